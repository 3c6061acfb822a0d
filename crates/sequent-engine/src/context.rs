//! Per-attempt unit of work handed to command handlers.

use std::any::Any;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sequent_core::aggregate::AggregateRoot;
use sequent_core::clock::SharedClock;
use sequent_core::error::EngineError;
use sequent_core::event::{DomainEvent, EventStream, RecordedEvent};
use sequent_core::snapshot::Snapshot;
use serde::Serialize;
use uuid::Uuid;

use crate::envelope::CommandEnvelope;
use crate::registry::SnapshotSettings;
use crate::repository::Repository;

/// Gives a handler access to aggregates and records which ones it touched.
///
/// Each aggregate is loaded at most once per attempt; a second `load` of the
/// same ID returns the instance already in the context. After the handler
/// returns, every tracked aggregate with uncommitted events becomes one
/// [`EventStream`].
pub struct CommandContext {
    repository: Repository,
    clock: SharedClock,
    command_id: Uuid,
    correlation_id: Uuid,
    command_type: &'static str,
    items: BTreeMap<String, String>,
    tracked: Vec<Box<dyn TrackedAggregate>>,
    result: serde_json::Value,
}

impl CommandContext {
    pub(crate) fn new(
        repository: Repository,
        clock: SharedClock,
        envelope: &CommandEnvelope,
    ) -> Self {
        Self {
            repository,
            clock,
            command_id: envelope.command_id,
            correlation_id: envelope.correlation_id,
            command_type: envelope.command_type,
            items: envelope.items.clone(),
            tracked: Vec::new(),
            result: serde_json::Value::Null,
        }
    }

    /// The command being handled.
    #[must_use]
    pub fn command_id(&self) -> Uuid {
        self.command_id
    }

    /// The command type being handled.
    #[must_use]
    pub fn command_type(&self) -> &'static str {
        self.command_type
    }

    /// The current time from the engine clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Loads an aggregate, or returns `None` if it has no history.
    ///
    /// When this command already committed to the aggregate in an earlier
    /// attempt, the aggregate is loaded as it was before that commit.
    ///
    /// # Errors
    ///
    /// Returns `EngineError` if the store fails, the history cannot be
    /// replayed, or the ID is already tracked as a different type.
    pub async fn load<A: AggregateRoot>(
        &mut self,
        aggregate_id: Uuid,
    ) -> Result<Option<&mut A>, EngineError> {
        if let Some(index) = self.position(aggregate_id) {
            return self.tracked_at::<A>(index).map(Some);
        }
        let settings = self.repository.registry().snapshot_settings::<A>()?;
        let Some(aggregate) = self
            .repository
            .load_for_command::<A>(aggregate_id, self.command_id)
            .await?
        else {
            return Ok(None);
        };
        self.track(aggregate, settings).map(Some)
    }

    /// Loads an aggregate that must already exist.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AggregateNotFound` if it has no history, or any
    /// error from [`load`](Self::load).
    pub async fn get<A: AggregateRoot>(&mut self, aggregate_id: Uuid) -> Result<&mut A, EngineError> {
        self.load::<A>(aggregate_id)
            .await?
            .ok_or_else(|| EngineError::AggregateNotFound {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                aggregate_id,
            })
    }

    /// Starts tracking a new aggregate. Events it has already recorded are
    /// committed with the rest of the command.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Misconfiguration` if an aggregate with the same ID
    /// is already tracked or the type is not registered.
    pub fn create<A: AggregateRoot>(&mut self, aggregate: A) -> Result<&mut A, EngineError> {
        if self.position(aggregate.aggregate_id()).is_some() {
            return Err(EngineError::Misconfiguration(format!(
                "aggregate {} is already part of command {}",
                aggregate.aggregate_id(),
                self.command_id
            )));
        }
        let settings = self.repository.registry().snapshot_settings::<A>()?;
        self.track(aggregate, settings)
    }

    /// Sets the value returned to the caller on success.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Serialization` if `value` cannot be serialized.
    pub fn set_result<T: Serialize>(&mut self, value: &T) -> Result<(), EngineError> {
        self.result = serde_json::to_value(value)?;
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Vec<Box<dyn TrackedAggregate>>, serde_json::Value) {
        (self.tracked, self.result)
    }

    pub(crate) fn stream_meta(&self) -> StreamMeta {
        StreamMeta {
            command_id: self.command_id,
            correlation_id: self.correlation_id,
            items: self.items.clone(),
        }
    }

    fn position(&self, aggregate_id: Uuid) -> Option<usize> {
        self.tracked
            .iter()
            .position(|tracked| tracked.aggregate_id() == aggregate_id)
    }

    fn track<A: AggregateRoot>(
        &mut self,
        aggregate: A,
        settings: SnapshotSettings<A>,
    ) -> Result<&mut A, EngineError> {
        let pending = i64::try_from(aggregate.uncommitted_events().len())
            .map_err(|e| EngineError::Misconfiguration(e.to_string()))?;
        self.tracked.push(Box::new(Tracked {
            base_version: aggregate.version() - pending,
            aggregate,
            settings,
        }));
        self.tracked_at::<A>(self.tracked.len() - 1)
    }

    fn tracked_at<A: AggregateRoot>(&mut self, index: usize) -> Result<&mut A, EngineError> {
        let tracked = &mut self.tracked[index];
        let aggregate_id = tracked.aggregate_id();
        let tracked_type = tracked.aggregate_type();
        tracked
            .as_any_mut()
            .downcast_mut::<Tracked<A>>()
            .map(|tracked| &mut tracked.aggregate)
            .ok_or_else(|| {
                EngineError::Misconfiguration(format!(
                    "aggregate {aggregate_id} is a {tracked_type}, not a {}",
                    A::AGGREGATE_TYPE
                ))
            })
    }
}

/// Metadata shared by every stream a command commits.
pub(crate) struct StreamMeta {
    pub(crate) command_id: Uuid,
    pub(crate) correlation_id: Uuid,
    pub(crate) items: BTreeMap<String, String>,
}

/// An aggregate loaded or created during a command, with its type erased.
pub(crate) trait TrackedAggregate: Send + Sync {
    fn aggregate_id(&self) -> Uuid;

    fn aggregate_type(&self) -> &'static str;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Drains uncommitted events into a stream, or `None` if there are none.
    fn build_stream(
        &mut self,
        meta: &StreamMeta,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<EventStream>, EngineError>;

    /// Captures a snapshot if the policy calls for one after the commit.
    fn snapshot(&self, taken_at: DateTime<Utc>) -> Option<Result<Snapshot, EngineError>>;
}

struct Tracked<A: AggregateRoot> {
    aggregate: A,
    // Version the aggregate had before this command touched it.
    base_version: i64,
    settings: SnapshotSettings<A>,
}

impl<A: AggregateRoot> TrackedAggregate for Tracked<A> {
    fn aggregate_id(&self) -> Uuid {
        self.aggregate.aggregate_id()
    }

    fn aggregate_type(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn build_stream(
        &mut self,
        meta: &StreamMeta,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<EventStream>, EngineError> {
        let events = self.aggregate.take_uncommitted_events();
        if events.is_empty() {
            return Ok(None);
        }
        let count = i64::try_from(events.len())
            .map_err(|e| EngineError::Misconfiguration(e.to_string()))?;
        let expected_version = self.aggregate.version() - count;
        if expected_version != self.base_version {
            return Err(EngineError::Misconfiguration(format!(
                "{} {} is at version {} with {count} new events but was loaded at {}; \
                 every recorded event must be applied exactly once",
                A::AGGREGATE_TYPE,
                self.aggregate.aggregate_id(),
                self.aggregate.version(),
                self.base_version
            )));
        }

        let events = (expected_version + 1..)
            .zip(&events)
            .map(|(sequence_number, event)| {
                Ok(RecordedEvent {
                    event_id: Uuid::now_v7(),
                    event_type: event.event_type().to_owned(),
                    sequence_number,
                    payload: event.to_payload()?,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        Ok(Some(EventStream {
            aggregate_id: self.aggregate.aggregate_id(),
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            expected_version,
            command_id: meta.command_id,
            correlation_id: meta.correlation_id,
            timestamp,
            events,
            items: meta.items.clone(),
        }))
    }

    fn snapshot(&self, taken_at: DateTime<Utc>) -> Option<Result<Snapshot, EngineError>> {
        let codec = self.settings.codec?;
        if !self
            .settings
            .policy
            .should_snapshot(self.base_version, self.aggregate.version())
        {
            return None;
        }
        Some((codec.capture)(&self.aggregate).map(|payload| Snapshot {
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            aggregate_id: self.aggregate.aggregate_id(),
            version: self.aggregate.version(),
            payload,
            taken_at,
        }))
    }
}
