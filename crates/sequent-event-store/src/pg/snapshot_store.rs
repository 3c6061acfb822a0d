//! `PostgreSQL` implementation of the `SnapshotStore` trait.

use async_trait::async_trait;
use sequent_core::error::EngineError;
use sequent_core::snapshot::Snapshot;
use sequent_core::store::SnapshotStore;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::infra;

/// PostgreSQL-backed snapshot cache holding the newest snapshot per
/// aggregate.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    /// Creates a new `PgSnapshotStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn store(&self, snapshot: Snapshot) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO snapshots (aggregate_id, aggregate_type, version, payload, taken_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (aggregate_id) DO UPDATE SET \
                 aggregate_type = EXCLUDED.aggregate_type, \
                 version = EXCLUDED.version, \
                 payload = EXCLUDED.payload, \
                 taken_at = EXCLUDED.taken_at \
             WHERE snapshots.version < EXCLUDED.version",
        )
        .bind(snapshot.aggregate_id)
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.version)
        .bind(&snapshot.payload)
        .bind(snapshot.taken_at)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }

    async fn latest(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, EngineError> {
        let row = sqlx::query(
            "SELECT aggregate_id, aggregate_type, version, payload, taken_at \
             FROM snapshots WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;

        row.map(|row| {
            Ok(Snapshot {
                aggregate_type: row.try_get("aggregate_type").map_err(infra)?,
                aggregate_id: row.try_get("aggregate_id").map_err(infra)?,
                version: row.try_get("version").map_err(infra)?,
                payload: row.try_get("payload").map_err(infra)?,
                taken_at: row.try_get("taken_at").map_err(infra)?,
            })
        })
        .transpose()
    }
}
