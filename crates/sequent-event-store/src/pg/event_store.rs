//! `PostgreSQL` implementation of the `EventStore` trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sequent_core::error::EngineError;
use sequent_core::event::{EventStream, RecordedEvent};
use sequent_core::store::{AppendOutcome, EventStore};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Row};
use uuid::Uuid;

use super::infra;

const STREAM_COLUMNS: &str = "aggregate_id, aggregate_type, expected_version, command_id, \
                              correlation_id, occurred_at, events, items";

/// PostgreSQL-backed event store.
///
/// Every append runs in one transaction: the command-ID lookup, the
/// conditional move of the aggregate head from `expected_version` to the new
/// version, and the stream insert.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Creates a new `PgEventStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn stream_from_row(row: &PgRow) -> Result<EventStream, EngineError> {
    let events: Json<Vec<RecordedEvent>> = row.try_get("events").map_err(infra)?;
    let items: Json<BTreeMap<String, String>> = row.try_get("items").map_err(infra)?;
    Ok(EventStream {
        aggregate_id: row.try_get("aggregate_id").map_err(infra)?,
        aggregate_type: row.try_get("aggregate_type").map_err(infra)?,
        expected_version: row.try_get("expected_version").map_err(infra)?,
        command_id: row.try_get("command_id").map_err(infra)?,
        correlation_id: row.try_get("correlation_id").map_err(infra)?,
        timestamp: row.try_get("occurred_at").map_err(infra)?,
        events: events.0,
        items: items.0,
    })
}

async fn fetch_by_command<'e, E: PgExecutor<'e>>(
    executor: E,
    aggregate_id: Uuid,
    command_id: Uuid,
) -> Result<Option<EventStream>, EngineError> {
    let sql = format!(
        "SELECT {STREAM_COLUMNS} FROM event_streams WHERE aggregate_id = $1 AND command_id = $2"
    );
    let row = sqlx::query(&sql)
        .bind(aggregate_id)
        .bind(command_id)
        .fetch_optional(executor)
        .await
        .map_err(infra)?;
    row.as_ref().map(stream_from_row).transpose()
}

async fn head_version<'e, E: PgExecutor<'e>>(
    executor: E,
    aggregate_id: Uuid,
) -> Result<i64, EngineError> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM aggregate_heads WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .fetch_optional(executor)
            .await
            .map_err(infra)?;
    Ok(version.unwrap_or(0))
}

fn is_command_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.constraint() == Some("event_streams_command_key")
    )
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append_stream(&self, stream: EventStream) -> Result<AppendOutcome, EngineError> {
        stream.validate()?;
        let mut tx = self.pool.begin().await.map_err(infra)?;

        if let Some(existing) =
            fetch_by_command(&mut *tx, stream.aggregate_id, stream.command_id).await?
        {
            tx.rollback().await.map_err(infra)?;
            return Ok(AppendOutcome::Duplicate(existing));
        }

        let moved = if stream.expected_version == 0 {
            sqlx::query(
                "INSERT INTO aggregate_heads (aggregate_id, aggregate_type, version) \
                 VALUES ($1, $2, $3) ON CONFLICT (aggregate_id) DO NOTHING",
            )
            .bind(stream.aggregate_id)
            .bind(&stream.aggregate_type)
            .bind(stream.version())
            .execute(&mut *tx)
            .await
        } else {
            sqlx::query(
                "UPDATE aggregate_heads SET version = $2 \
                 WHERE aggregate_id = $1 AND version = $3",
            )
            .bind(stream.aggregate_id)
            .bind(stream.version())
            .bind(stream.expected_version)
            .execute(&mut *tx)
            .await
        };
        let moved = moved.map_err(infra)?;

        if moved.rows_affected() == 0 {
            // The head move waited on any concurrent append to this aggregate,
            // so a stream it committed for the same command is visible now.
            if let Some(existing) =
                fetch_by_command(&mut *tx, stream.aggregate_id, stream.command_id).await?
            {
                tx.rollback().await.map_err(infra)?;
                return Ok(AppendOutcome::Duplicate(existing));
            }
            let actual = head_version(&mut *tx, stream.aggregate_id).await?;
            tx.rollback().await.map_err(infra)?;
            tracing::debug!(
                aggregate_id = %stream.aggregate_id,
                expected = stream.expected_version,
                actual,
                "append rejected by head version"
            );
            return Err(EngineError::ConcurrencyConflict {
                aggregate_id: stream.aggregate_id,
                expected: stream.expected_version,
                actual,
            });
        }

        let inserted = sqlx::query(
            "INSERT INTO event_streams (aggregate_id, version, expected_version, aggregate_type, \
             command_id, correlation_id, occurred_at, events, items) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(stream.aggregate_id)
        .bind(stream.version())
        .bind(stream.expected_version)
        .bind(&stream.aggregate_type)
        .bind(stream.command_id)
        .bind(stream.correlation_id)
        .bind(stream.timestamp)
        .bind(Json(&stream.events))
        .bind(Json(&stream.items))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await.map_err(infra)?;
                Ok(AppendOutcome::Persisted(stream))
            }
            Err(err) if is_command_violation(&err) => {
                tx.rollback().await.map_err(infra)?;
                fetch_by_command(&self.pool, stream.aggregate_id, stream.command_id)
                    .await?
                    .map(AppendOutcome::Duplicate)
                    .ok_or_else(|| {
                        EngineError::Infrastructure(format!(
                            "command {} vanished after a uniqueness violation",
                            stream.command_id
                        ))
                    })
            }
            Err(err) if is_unique_violation(&err) => {
                tx.rollback().await.map_err(infra)?;
                let actual = head_version(&self.pool, stream.aggregate_id).await?;
                Err(EngineError::ConcurrencyConflict {
                    aggregate_id: stream.aggregate_id,
                    expected: stream.expected_version,
                    actual,
                })
            }
            Err(err) => Err(infra(err)),
        }
    }

    async fn query(
        &self,
        aggregate_id: Uuid,
        min_version: i64,
        max_version: i64,
    ) -> Result<Vec<EventStream>, EngineError> {
        let sql = format!(
            "SELECT {STREAM_COLUMNS} FROM event_streams \
             WHERE aggregate_id = $1 AND version BETWEEN $2 AND $3 ORDER BY version"
        );
        let rows = sqlx::query(&sql)
            .bind(aggregate_id)
            .bind(min_version)
            .bind(max_version)
            .fetch_all(&self.pool)
            .await
            .map_err(infra)?;
        rows.iter().map(stream_from_row).collect()
    }

    async fn find_by_command(
        &self,
        aggregate_id: Uuid,
        command_id: Uuid,
    ) -> Result<Option<EventStream>, EngineError> {
        fetch_by_command(&self.pool, aggregate_id, command_id).await
    }

    async fn list_aggregate_ids(&self) -> Result<Vec<Uuid>, EngineError> {
        sqlx::query_scalar("SELECT aggregate_id FROM aggregate_heads")
            .fetch_all(&self.pool)
            .await
            .map_err(infra)
    }
}
