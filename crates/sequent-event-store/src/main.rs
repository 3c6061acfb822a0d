//! Applies the Sequent storage schema to a `PostgreSQL` database.

use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Startup and migration errors.
#[derive(Debug, Error)]
enum MigrateError {
    /// A required environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration failed to apply.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[tokio::main]
async fn main() -> Result<(), MigrateError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| MigrateError::Config("DATABASE_URL environment variable must be set".into()))?;
    let max_connections: u32 = std::env::var("SEQUENT_DB_MAX_CONNECTIONS")
        .unwrap_or_else(|_| "2".to_string())
        .parse()
        .map_err(|e| MigrateError::Config(format!("SEQUENT_DB_MAX_CONNECTIONS must be a u32: {e}")))?;

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&database_url)
        .await?;

    tracing::info!("Applying storage migrations");
    sequent_event_store::schema::MIGRATOR.run(&pool).await?;
    tracing::info!("Storage schema is up to date");

    Ok(())
}
