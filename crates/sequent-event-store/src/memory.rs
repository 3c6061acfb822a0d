//! In-memory store implementations.
//!
//! They enforce the same invariants as the PostgreSQL stores and are what the
//! engine's tests and single-process deployments run on.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sequent_core::command::HandledCommand;
use sequent_core::error::EngineError;
use sequent_core::event::EventStream;
use sequent_core::snapshot::Snapshot;
use sequent_core::store::{
    AppendOutcome, CommandStore, EventStore, InsertOutcome, SnapshotStore, WatermarkStore,
};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, EngineError> {
    mutex
        .lock()
        .map_err(|_| EngineError::Infrastructure("in-memory store lock poisoned".to_owned()))
}

/// Event log held in a map of per-aggregate stream lists.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: Mutex<HashMap<Uuid, Vec<EventStream>>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every stream stored for an aggregate.
    #[must_use]
    pub fn streams_for(&self, aggregate_id: Uuid) -> Vec<EventStream> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&aggregate_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of stored streams across all aggregates.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner).values().map(Vec::len).sum()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_stream(&self, stream: EventStream) -> Result<AppendOutcome, EngineError> {
        stream.validate()?;
        let mut streams = lock(&self.streams)?;
        let history = streams.entry(stream.aggregate_id).or_default();

        if let Some(existing) = history.iter().find(|s| s.command_id == stream.command_id) {
            return Ok(AppendOutcome::Duplicate(existing.clone()));
        }

        let current = history.last().map_or(0, EventStream::version);
        if current != stream.expected_version {
            return Err(EngineError::ConcurrencyConflict {
                aggregate_id: stream.aggregate_id,
                expected: stream.expected_version,
                actual: current,
            });
        }

        history.push(stream.clone());
        Ok(AppendOutcome::Persisted(stream))
    }

    async fn query(
        &self,
        aggregate_id: Uuid,
        min_version: i64,
        max_version: i64,
    ) -> Result<Vec<EventStream>, EngineError> {
        let streams = lock(&self.streams)?;
        Ok(streams
            .get(&aggregate_id)
            .map(|history| {
                history
                    .iter()
                    .filter(|s| s.version() >= min_version && s.version() <= max_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_by_command(
        &self,
        aggregate_id: Uuid,
        command_id: Uuid,
    ) -> Result<Option<EventStream>, EngineError> {
        let streams = lock(&self.streams)?;
        Ok(streams
            .get(&aggregate_id)
            .and_then(|history| history.iter().find(|s| s.command_id == command_id))
            .cloned())
    }

    async fn list_aggregate_ids(&self) -> Result<Vec<Uuid>, EngineError> {
        let streams = lock(&self.streams)?;
        Ok(streams
            .iter()
            .filter(|(_, history)| !history.is_empty())
            .map(|(id, _)| *id)
            .collect())
    }
}

/// Handled-command records keyed by command ID.
#[derive(Debug, Default)]
pub struct InMemoryCommandStore {
    handled: Mutex<HashMap<Uuid, HandledCommand>>,
}

impl InMemoryCommandStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handled.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CommandStore for InMemoryCommandStore {
    async fn get(&self, command_id: Uuid) -> Result<Option<HandledCommand>, EngineError> {
        Ok(lock(&self.handled)?.get(&command_id).cloned())
    }

    async fn try_insert(&self, handled: HandledCommand) -> Result<InsertOutcome, EngineError> {
        let mut records = lock(&self.handled)?;
        if let Some(existing) = records.get(&handled.command_id) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        records.insert(handled.command_id, handled);
        Ok(InsertOutcome::Inserted)
    }
}

/// Latest snapshot per aggregate.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<Uuid, Snapshot>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of aggregates with a snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no snapshot has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the snapshot for an aggregate.
    pub fn evict(&self, aggregate_id: Uuid) {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner).remove(&aggregate_id);
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn store(&self, snapshot: Snapshot) -> Result<(), EngineError> {
        let mut snapshots = lock(&self.snapshots)?;
        let newer = snapshots
            .get(&snapshot.aggregate_id)
            .is_none_or(|current| current.version < snapshot.version);
        if newer {
            snapshots.insert(snapshot.aggregate_id, snapshot);
        }
        Ok(())
    }

    async fn latest(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, EngineError> {
        Ok(lock(&self.snapshots)?.get(&aggregate_id).cloned())
    }
}

/// Published-version watermarks keyed by (group, aggregate).
#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    watermarks: Mutex<HashMap<(String, Uuid), i64>>,
}

impl InMemoryWatermarkStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn load(&self, group: &str, aggregate_id: Uuid) -> Result<i64, EngineError> {
        Ok(lock(&self.watermarks)?
            .get(&(group.to_owned(), aggregate_id))
            .copied()
            .unwrap_or(0))
    }

    async fn advance(
        &self,
        group: &str,
        aggregate_id: Uuid,
        version: i64,
    ) -> Result<(), EngineError> {
        let mut watermarks = lock(&self.watermarks)?;
        let entry = watermarks
            .entry((group.to_owned(), aggregate_id))
            .or_insert(0);
        *entry = (*entry).max(version);
        Ok(())
    }
}
