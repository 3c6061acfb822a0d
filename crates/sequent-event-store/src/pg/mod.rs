//! `PostgreSQL` implementations of the storage traits.

mod command_store;
mod event_store;
mod snapshot_store;
mod watermark_store;

pub use command_store::PgCommandStore;
pub use event_store::PgEventStore;
pub use snapshot_store::PgSnapshotStore;
pub use watermark_store::PgWatermarkStore;

use sequent_core::error::EngineError;

/// Maps a driver error onto the engine's infrastructure failure.
pub(crate) fn infra(err: sqlx::Error) -> EngineError {
    EngineError::Infrastructure(format!("database error: {err}"))
}
