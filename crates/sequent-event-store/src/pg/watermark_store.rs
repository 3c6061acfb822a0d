//! `PostgreSQL` implementation of the `WatermarkStore` trait.

use async_trait::async_trait;
use sequent_core::error::EngineError;
use sequent_core::store::WatermarkStore;
use sqlx::PgPool;
use uuid::Uuid;

use super::infra;

/// PostgreSQL-backed published-version watermarks.
#[derive(Debug, Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    /// Creates a new `PgWatermarkStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn load(&self, group: &str, aggregate_id: Uuid) -> Result<i64, EngineError> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM published_watermarks WHERE subscriber = $1 AND aggregate_id = $2",
        )
        .bind(group)
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        Ok(version.unwrap_or(0))
    }

    async fn advance(
        &self,
        group: &str,
        aggregate_id: Uuid,
        version: i64,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO published_watermarks (subscriber, aggregate_id, version) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (subscriber, aggregate_id) DO UPDATE \
             SET version = GREATEST(published_watermarks.version, EXCLUDED.version)",
        )
        .bind(group)
        .bind(aggregate_id)
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }
}
