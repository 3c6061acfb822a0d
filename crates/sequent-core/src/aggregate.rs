//! Aggregate root abstraction.

use uuid::Uuid;

use crate::error::EngineError;
use crate::event::DomainEvent;

/// Trait for aggregate roots that reconstitute from event history.
///
/// An aggregate only changes by applying events. Behavior methods validate
/// their input, then *raise* an event: apply it to `self` and push it onto the
/// uncommitted list. Replay calls [`apply`](Self::apply) with stored events, so
/// the same code path produces the state either way.
pub trait AggregateRoot: Send + Sync + Sized + 'static {
    /// The event type this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Stable type name, used as the registry key and stored on every stream.
    const AGGREGATE_TYPE: &'static str;

    /// Returns a blank aggregate at version 0, ready for replay.
    fn blank(id: Uuid) -> Self;

    /// Returns the aggregate identifier.
    fn aggregate_id(&self) -> Uuid;

    /// Returns the current version (number of events applied).
    fn version(&self) -> i64;

    /// Apply an event to mutate internal state. Applying event `n` must leave
    /// the aggregate at version `n`.
    fn apply(&mut self, event: &Self::Event);

    /// Returns uncommitted events produced by command handling.
    fn uncommitted_events(&self) -> &[Self::Event];

    /// Removes and returns uncommitted events once they are handed to the
    /// event store.
    fn take_uncommitted_events(&mut self) -> Vec<Self::Event>;
}

/// Capability implemented by aggregates whose state can be compacted into a
/// snapshot.
pub trait Snapshotable: AggregateRoot {
    /// Captures the aggregate state as an opaque payload.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Serialization` if the state cannot be encoded.
    fn capture_snapshot(&self) -> Result<serde_json::Value, EngineError>;

    /// Rebuilds an aggregate from a payload captured at `version`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Serialization` if the payload cannot be decoded.
    fn restore(id: Uuid, version: i64, payload: &serde_json::Value) -> Result<Self, EngineError>;
}
