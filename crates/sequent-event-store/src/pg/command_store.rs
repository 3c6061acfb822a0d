//! `PostgreSQL` implementation of the `CommandStore` trait.

use async_trait::async_trait;
use sequent_core::command::{CommandOutcome, HandledCommand};
use sequent_core::error::EngineError;
use sequent_core::store::{CommandStore, InsertOutcome};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::infra;

/// PostgreSQL-backed record of handled commands.
#[derive(Debug, Clone)]
pub struct PgCommandStore {
    pool: PgPool,
}

impl PgCommandStore {
    /// Creates a new `PgCommandStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommandStore for PgCommandStore {
    async fn get(&self, command_id: Uuid) -> Result<Option<HandledCommand>, EngineError> {
        let row = sqlx::query(
            "SELECT command_id, aggregate_id, command_type, outcome, handled_at \
             FROM handled_commands WHERE command_id = $1",
        )
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let outcome: Json<CommandOutcome> = row.try_get("outcome").map_err(infra)?;
        Ok(Some(HandledCommand {
            command_id: row.try_get("command_id").map_err(infra)?,
            aggregate_id: row.try_get("aggregate_id").map_err(infra)?,
            command_type: row.try_get("command_type").map_err(infra)?,
            outcome: outcome.0,
            handled_at: row.try_get("handled_at").map_err(infra)?,
        }))
    }

    async fn try_insert(&self, handled: HandledCommand) -> Result<InsertOutcome, EngineError> {
        let result = sqlx::query(
            "INSERT INTO handled_commands \
             (command_id, aggregate_id, command_type, outcome, handled_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (command_id) DO NOTHING",
        )
        .bind(handled.command_id)
        .bind(handled.aggregate_id)
        .bind(&handled.command_type)
        .bind(Json(&handled.outcome))
        .bind(handled.handled_at)
        .execute(&self.pool)
        .await
        .map_err(infra)?;

        if result.rows_affected() == 1 {
            return Ok(InsertOutcome::Inserted);
        }
        self.get(handled.command_id)
            .await?
            .map(InsertOutcome::AlreadyExists)
            .ok_or_else(|| {
                EngineError::Infrastructure(format!(
                    "handled command {} conflicted but could not be read back",
                    handled.command_id
                ))
            })
    }
}
