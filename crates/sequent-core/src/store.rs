//! Storage contracts the pipeline relies on.
//!
//! Implementations live in `sequent-event-store`. The uniqueness rules
//! enforced by [`EventStore`] are the only mutual exclusion the pipeline
//! depends on for correctness.

use async_trait::async_trait;
use uuid::Uuid;

use crate::command::HandledCommand;
use crate::error::EngineError;
use crate::event::EventStream;
use crate::snapshot::Snapshot;

/// Result of appending one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The stream was written.
    Persisted(EventStream),
    /// The aggregate already holds a stream from the same command. The stored
    /// stream is returned so a crashed-then-retried commit can carry on.
    Duplicate(EventStream),
}

/// Partitioned result of a batched [`EventStore::append`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendBatchResult {
    /// Streams that were written.
    pub persisted: Vec<EventStream>,
    /// Streams rejected because their version range was already taken.
    pub duplicate_version: Vec<EventStream>,
    /// Previously stored streams matching a submitted command ID.
    pub duplicate_command: Vec<EventStream>,
}

/// Append-only log of event streams keyed by (aggregate id, version).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends one stream atomically.
    ///
    /// The command-ID check runs first: a stream whose command already
    /// committed against the aggregate yields `Duplicate` with the stored
    /// stream. Otherwise the aggregate's current version must equal
    /// `stream.expected_version`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConcurrencyConflict` if the version range is
    /// taken, `EngineError::Infrastructure` if the store is unreachable.
    async fn append_stream(&self, stream: EventStream) -> Result<AppendOutcome, EngineError>;

    /// Appends many independent streams and partitions the outcome.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Infrastructure` if the store is unreachable.
    /// Per-stream conflicts and duplicates are reported in the result.
    async fn append(&self, streams: Vec<EventStream>) -> Result<AppendBatchResult, EngineError> {
        let mut result = AppendBatchResult::default();
        for stream in streams {
            match self.append_stream(stream.clone()).await {
                Ok(AppendOutcome::Persisted(stored)) => result.persisted.push(stored),
                Ok(AppendOutcome::Duplicate(existing)) => result.duplicate_command.push(existing),
                Err(EngineError::ConcurrencyConflict { .. }) => {
                    result.duplicate_version.push(stream);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(result)
    }

    /// Returns the streams whose version lies in `[min_version, max_version]`,
    /// ascending, without gaps.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Infrastructure` if the store is unreachable.
    async fn query(
        &self,
        aggregate_id: Uuid,
        min_version: i64,
        max_version: i64,
    ) -> Result<Vec<EventStream>, EngineError>;

    /// Returns the stream a command committed against an aggregate, if any.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Infrastructure` if the store is unreachable.
    async fn find_by_command(
        &self,
        aggregate_id: Uuid,
        command_id: Uuid,
    ) -> Result<Option<EventStream>, EngineError>;

    /// Lists every aggregate with at least one stream.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Infrastructure` if the store is unreachable.
    async fn list_aggregate_ids(&self) -> Result<Vec<Uuid>, EngineError>;
}

/// Result of recording a handled command.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The record was written.
    Inserted,
    /// A record for the command already existed; it is returned unchanged.
    AlreadyExists(HandledCommand),
}

/// Durable record of handled commands.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Looks up the record for a command.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Infrastructure` if the store is unreachable.
    async fn get(&self, command_id: Uuid) -> Result<Option<HandledCommand>, EngineError>;

    /// Records a command unless it is already recorded.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Infrastructure` if the store is unreachable.
    async fn try_insert(&self, handled: HandledCommand) -> Result<InsertOutcome, EngineError>;
}

/// Advisory snapshot cache.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Stores a snapshot. A snapshot older than the stored one is ignored.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Infrastructure` if the store is unreachable.
    async fn store(&self, snapshot: Snapshot) -> Result<(), EngineError>;

    /// Returns the newest snapshot for an aggregate.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Infrastructure` if the store is unreachable.
    async fn latest(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, EngineError>;
}

/// Per-(subscriber group, aggregate) published-version watermarks.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Returns the last version published to `group` for an aggregate, or 0.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Infrastructure` if the store is unreachable.
    async fn load(&self, group: &str, aggregate_id: Uuid) -> Result<i64, EngineError>;

    /// Raises the watermark to `version`. Never lowers it.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Infrastructure` if the store is unreachable.
    async fn advance(&self, group: &str, aggregate_id: Uuid, version: i64)
    -> Result<(), EngineError>;
}
