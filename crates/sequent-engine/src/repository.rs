//! Rebuilds aggregates from snapshots and committed streams.

use std::sync::Arc;

use sequent_core::aggregate::AggregateRoot;
use sequent_core::error::EngineError;
use sequent_core::event::{DomainEvent, EventStream};
use sequent_core::store::{EventStore, SnapshotStore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::{Registry, SnapshotCodec};

/// Loads aggregates. A snapshot, when one exists and can be restored, is the
/// starting point; the streams after it are replayed on top. Snapshots are
/// only a cache, so any problem with one falls back to full replay.
#[derive(Clone)]
pub struct Repository {
    events: Arc<dyn EventStore>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    registry: Arc<Registry>,
}

impl Repository {
    /// Creates a repository over the given stores.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventStore>,
        snapshots: Option<Arc<dyn SnapshotStore>>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            events,
            snapshots,
            registry,
        }
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Loads the aggregate, or `None` if it has neither snapshot nor history.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Misconfiguration` if `A` is not registered,
    /// `EngineError::Serialization` if an event payload does not decode, and
    /// `EngineError::Infrastructure` if the store fails or the history has a
    /// gap.
    pub async fn load<A: AggregateRoot>(&self, aggregate_id: Uuid) -> Result<Option<A>, EngineError> {
        self.load_until::<A>(aggregate_id, i64::MAX).await
    }

    /// Loads the aggregate as `command_id` first saw it.
    ///
    /// If the command already committed a stream to this aggregate (an
    /// earlier attempt that failed later on), replay stops just before that
    /// stream so the handler decides against the same state again and the
    /// rebuilt stream matches the stored one by command ID.
    pub(crate) async fn load_for_command<A: AggregateRoot>(
        &self,
        aggregate_id: Uuid,
        command_id: Uuid,
    ) -> Result<Option<A>, EngineError> {
        let Some(earlier) = self.events.find_by_command(aggregate_id, command_id).await? else {
            return self.load_until::<A>(aggregate_id, i64::MAX).await;
        };
        debug!(
            %aggregate_id,
            %command_id,
            version = earlier.expected_version,
            "command already committed here; loading the state it saw"
        );
        self.load_until::<A>(aggregate_id, earlier.expected_version).await
    }

    async fn load_until<A: AggregateRoot>(
        &self,
        aggregate_id: Uuid,
        max_version: i64,
    ) -> Result<Option<A>, EngineError> {
        let settings = self.registry.snapshot_settings::<A>()?;
        let restored = match settings.codec {
            Some(codec) => self.restore_snapshot::<A>(aggregate_id, codec, max_version).await,
            None => None,
        };
        let from_version = restored.as_ref().map_or(0, |aggregate| aggregate.version());

        let streams = if from_version < max_version {
            self.events
                .query(aggregate_id, from_version + 1, max_version)
                .await?
        } else {
            Vec::new()
        };
        if restored.is_none() && streams.is_empty() {
            return Ok(None);
        }

        let mut aggregate = restored.unwrap_or_else(|| A::blank(aggregate_id));
        for stream in &streams {
            replay_stream(&mut aggregate, stream)?;
        }
        debug!(
            %aggregate_id,
            aggregate_type = A::AGGREGATE_TYPE,
            snapshot_version = from_version,
            version = aggregate.version(),
            "aggregate loaded"
        );
        Ok(Some(aggregate))
    }

    /// Loads an aggregate that must exist.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AggregateNotFound` when there is no history, or
    /// any error from [`load`](Self::load).
    pub async fn get<A: AggregateRoot>(&self, aggregate_id: Uuid) -> Result<A, EngineError> {
        self.load::<A>(aggregate_id)
            .await?
            .ok_or_else(|| EngineError::AggregateNotFound {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                aggregate_id,
            })
    }

    async fn restore_snapshot<A: AggregateRoot>(
        &self,
        aggregate_id: Uuid,
        codec: SnapshotCodec<A>,
        max_version: i64,
    ) -> Option<A> {
        let store = self.snapshots.as_ref()?;
        let snapshot = match store.latest(aggregate_id).await {
            Ok(snapshot) => snapshot?,
            Err(err) => {
                warn!(%aggregate_id, error = %err, "snapshot lookup failed; replaying full history");
                return None;
            }
        };
        if snapshot.version > max_version {
            return None;
        }
        if snapshot.aggregate_type != A::AGGREGATE_TYPE {
            warn!(
                %aggregate_id,
                found = %snapshot.aggregate_type,
                expected = A::AGGREGATE_TYPE,
                "snapshot belongs to another aggregate type; ignoring it"
            );
            return None;
        }
        match (codec.restore)(aggregate_id, snapshot.version, &snapshot.payload) {
            Ok(aggregate) if aggregate.version() == snapshot.version => Some(aggregate),
            Ok(aggregate) => {
                warn!(
                    %aggregate_id,
                    snapshot_version = snapshot.version,
                    restored_version = aggregate.version(),
                    "restored snapshot reports the wrong version; ignoring it"
                );
                None
            }
            Err(err) => {
                warn!(%aggregate_id, error = %err, "corrupt snapshot; replaying full history");
                None
            }
        }
    }
}

/// Applies the events of `stream` that are newer than the aggregate.
pub(crate) fn replay_stream<A: AggregateRoot>(
    aggregate: &mut A,
    stream: &EventStream,
) -> Result<(), EngineError> {
    for recorded in &stream.events {
        if recorded.sequence_number <= aggregate.version() {
            continue;
        }
        if recorded.sequence_number != aggregate.version() + 1 {
            return Err(EngineError::Infrastructure(format!(
                "history of {} {} jumps from version {} to {}",
                A::AGGREGATE_TYPE,
                stream.aggregate_id,
                aggregate.version(),
                recorded.sequence_number
            )));
        }
        let event = A::Event::from_payload(&recorded.payload)?;
        aggregate.apply(&event);
        if aggregate.version() != recorded.sequence_number {
            return Err(EngineError::Misconfiguration(format!(
                "applying {} left {} {} at version {} instead of {}",
                recorded.event_type,
                A::AGGREGATE_TYPE,
                stream.aggregate_id,
                aggregate.version(),
                recorded.sequence_number
            )));
        }
    }
    Ok(())
}
