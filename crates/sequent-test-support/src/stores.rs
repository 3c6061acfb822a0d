//! Event stores that inject races and failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sequent_core::command::HandledCommand;
use sequent_core::error::EngineError;
use sequent_core::event::EventStream;
use sequent_core::store::{AppendOutcome, CommandStore, EventStore, InsertOutcome};
use sequent_event_store::{InMemoryCommandStore, InMemoryEventStore};
use tokio::sync::Barrier;
use uuid::Uuid;

/// Holds the first `parties` appends at a barrier until all of them have
/// arrived, so concurrent commands are guaranteed to have loaded the same
/// version before any of them commits.
#[derive(Debug)]
pub struct GatedEventStore {
    inner: Arc<InMemoryEventStore>,
    barrier: Barrier,
    gated: AtomicUsize,
    conflicts: AtomicUsize,
}

impl GatedEventStore {
    /// Gates the first `parties` appends to `inner`.
    #[must_use]
    pub fn new(inner: Arc<InMemoryEventStore>, parties: usize) -> Self {
        Self {
            inner,
            barrier: Barrier::new(parties),
            gated: AtomicUsize::new(parties),
            conflicts: AtomicUsize::new(0),
        }
    }

    /// Appends that failed the version check.
    #[must_use]
    pub fn conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for GatedEventStore {
    async fn append_stream(&self, stream: EventStream) -> Result<AppendOutcome, EngineError> {
        if self
            .gated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.barrier.wait().await;
        }
        let result = self.inner.append_stream(stream).await;
        if matches!(result, Err(EngineError::ConcurrencyConflict { .. })) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    async fn query(
        &self,
        aggregate_id: Uuid,
        min_version: i64,
        max_version: i64,
    ) -> Result<Vec<EventStream>, EngineError> {
        self.inner.query(aggregate_id, min_version, max_version).await
    }

    async fn find_by_command(
        &self,
        aggregate_id: Uuid,
        command_id: Uuid,
    ) -> Result<Option<EventStream>, EngineError> {
        self.inner.find_by_command(aggregate_id, command_id).await
    }

    async fn list_aggregate_ids(&self) -> Result<Vec<Uuid>, EngineError> {
        self.inner.list_aggregate_ids().await
    }
}

/// Reads from `inner` but refuses every append with a conflict, as if
/// another writer always got there first.
#[derive(Debug)]
pub struct ConflictingEventStore {
    inner: Arc<InMemoryEventStore>,
    attempts: AtomicUsize,
}

impl ConflictingEventStore {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<InMemoryEventStore>) -> Self {
        Self {
            inner,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Appends attempted so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for ConflictingEventStore {
    async fn append_stream(&self, stream: EventStream) -> Result<AppendOutcome, EngineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::ConcurrencyConflict {
            aggregate_id: stream.aggregate_id,
            expected: stream.expected_version,
            actual: stream.expected_version + 1,
        })
    }

    async fn query(
        &self,
        aggregate_id: Uuid,
        min_version: i64,
        max_version: i64,
    ) -> Result<Vec<EventStream>, EngineError> {
        self.inner.query(aggregate_id, min_version, max_version).await
    }

    async fn find_by_command(
        &self,
        aggregate_id: Uuid,
        command_id: Uuid,
    ) -> Result<Option<EventStream>, EngineError> {
        self.inner.find_by_command(aggregate_id, command_id).await
    }

    async fn list_aggregate_ids(&self) -> Result<Vec<Uuid>, EngineError> {
        self.inner.list_aggregate_ids().await
    }
}

/// Refuses the first append to one aggregate with a conflict, then behaves
/// like `inner`. Appends to other aggregates go straight through, so a
/// multi-aggregate command commits part of its work before it has to retry.
#[derive(Debug)]
pub struct ConflictOnceEventStore {
    inner: Arc<InMemoryEventStore>,
    target: Uuid,
    pending: AtomicUsize,
}

impl ConflictOnceEventStore {
    /// Conflicts once on the first append to `target`.
    #[must_use]
    pub fn new(inner: Arc<InMemoryEventStore>, target: Uuid) -> Self {
        Self {
            inner,
            target,
            pending: AtomicUsize::new(1),
        }
    }
}

#[async_trait]
impl EventStore for ConflictOnceEventStore {
    async fn append_stream(&self, stream: EventStream) -> Result<AppendOutcome, EngineError> {
        if stream.aggregate_id == self.target
            && self
                .pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(EngineError::ConcurrencyConflict {
                aggregate_id: stream.aggregate_id,
                expected: stream.expected_version,
                actual: stream.expected_version,
            });
        }
        self.inner.append_stream(stream).await
    }

    async fn query(
        &self,
        aggregate_id: Uuid,
        min_version: i64,
        max_version: i64,
    ) -> Result<Vec<EventStream>, EngineError> {
        self.inner.query(aggregate_id, min_version, max_version).await
    }

    async fn find_by_command(
        &self,
        aggregate_id: Uuid,
        command_id: Uuid,
    ) -> Result<Option<EventStream>, EngineError> {
        self.inner.find_by_command(aggregate_id, command_id).await
    }

    async fn list_aggregate_ids(&self) -> Result<Vec<Uuid>, EngineError> {
        self.inner.list_aggregate_ids().await
    }
}

/// Fails the first `n` attempts to record a command, then records into
/// `inner`. Lookups always reach `inner`.
#[derive(Debug)]
pub struct FlakyCommandStore {
    inner: Arc<InMemoryCommandStore>,
    failures_left: AtomicUsize,
}

impl FlakyCommandStore {
    /// Fails the next `n` inserts.
    #[must_use]
    pub fn new(inner: Arc<InMemoryCommandStore>, n: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(n),
        }
    }
}

#[async_trait]
impl CommandStore for FlakyCommandStore {
    async fn get(&self, command_id: Uuid) -> Result<Option<HandledCommand>, EngineError> {
        self.inner.get(command_id).await
    }

    async fn try_insert(&self, handled: HandledCommand) -> Result<InsertOutcome, EngineError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::Infrastructure("command store unavailable".to_owned()));
        }
        self.inner.try_insert(handled).await
    }
}

/// An event store where every operation fails.
#[derive(Debug, Default)]
pub struct FailingEventStore;

fn unavailable() -> EngineError {
    EngineError::Infrastructure("event store unavailable".to_owned())
}

#[async_trait]
impl EventStore for FailingEventStore {
    async fn append_stream(&self, _stream: EventStream) -> Result<AppendOutcome, EngineError> {
        Err(unavailable())
    }

    async fn query(
        &self,
        _aggregate_id: Uuid,
        _min_version: i64,
        _max_version: i64,
    ) -> Result<Vec<EventStream>, EngineError> {
        Err(unavailable())
    }

    async fn find_by_command(
        &self,
        _aggregate_id: Uuid,
        _command_id: Uuid,
    ) -> Result<Option<EventStream>, EngineError> {
        Err(unavailable())
    }

    async fn list_aggregate_ids(&self) -> Result<Vec<Uuid>, EngineError> {
        Err(unavailable())
    }
}
