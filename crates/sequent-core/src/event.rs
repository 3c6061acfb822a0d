//! Domain events and the event stream (batch) they are persisted in.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Trait that every aggregate's event type implements.
///
/// Event types are expected to be enums whose variants are the aggregate's
/// state transitions. The serde representation is the persisted payload, and
/// the variant tag selects the replay arm in [`AggregateRoot::apply`].
///
/// [`AggregateRoot::apply`]: crate::aggregate::AggregateRoot::apply
pub trait DomainEvent:
    Serialize + DeserializeOwned + Clone + Send + Sync + std::fmt::Debug + 'static
{
    /// Returns the event type name (used for routing and by consumers).
    fn event_type(&self) -> &'static str;

    /// Serializes the event payload to JSON.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Serialization` if the payload cannot be encoded.
    fn to_payload(&self) -> Result<serde_json::Value, EngineError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes an event from a stored payload.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Serialization` if the payload does not match
    /// any variant.
    fn from_payload(payload: &serde_json::Value) -> Result<Self, EngineError> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}

/// Stored representation of a single event inside an [`EventStream`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Event type name.
    pub event_type: String,
    /// Sequence number within the aggregate stream.
    pub sequence_number: i64,
    /// Serialized event payload.
    pub payload: serde_json::Value,
}

/// An immutable batch of events committed by one command against one
/// aggregate.
///
/// Versions advance once per event: a stream holding `n` events moves the
/// aggregate from `expected_version` to `expected_version + n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStream {
    /// Aggregate this stream belongs to.
    pub aggregate_id: Uuid,
    /// Stable aggregate type name.
    pub aggregate_type: String,
    /// Aggregate version before this stream was applied.
    pub expected_version: i64,
    /// Command that produced the stream (idempotency key).
    pub command_id: Uuid,
    /// Correlation ID for tracing a command through its effects.
    pub correlation_id: Uuid,
    /// Commit timestamp.
    pub timestamp: DateTime<Utc>,
    /// Events in sequence order.
    pub events: Vec<RecordedEvent>,
    /// Arbitrary context carried from the command.
    #[serde(default)]
    pub items: BTreeMap<String, String>,
}

impl EventStream {
    /// The aggregate version after this stream is applied.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn version(&self) -> i64 {
        self.expected_version + self.events.len() as i64
    }

    /// The sequence number of the first event in the stream.
    #[must_use]
    pub fn first_sequence(&self) -> i64 {
        self.expected_version + 1
    }

    /// Checks that the events are numbered `expected_version + 1 ..= version`
    /// with no gaps.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Misconfiguration` for an empty stream or a
    /// misnumbered event.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.events.is_empty() {
            return Err(EngineError::Misconfiguration(format!(
                "stream for aggregate {} from command {} has no events",
                self.aggregate_id, self.command_id
            )));
        }
        for (expected, event) in (self.first_sequence()..).zip(&self.events) {
            if event.sequence_number != expected {
                return Err(EngineError::Misconfiguration(format!(
                    "event {} in stream for aggregate {} has sequence {}, expected {expected}",
                    event.event_id, self.aggregate_id, event.sequence_number
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(expected_version: i64, count: i64) -> EventStream {
        EventStream {
            aggregate_id: Uuid::new_v4(),
            aggregate_type: "test".to_owned(),
            expected_version,
            command_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            events: (1..=count)
                .map(|i| RecordedEvent {
                    event_id: Uuid::new_v4(),
                    event_type: "test.happened".to_owned(),
                    sequence_number: expected_version + i,
                    payload: serde_json::json!({ "i": i }),
                })
                .collect(),
            items: BTreeMap::new(),
        }
    }

    #[test]
    fn test_version_advances_once_per_event() {
        let s = stream(3, 2);

        assert_eq!(s.first_sequence(), 4);
        assert_eq!(s.version(), 5);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_gap_in_sequence() {
        let mut s = stream(0, 2);
        s.events[1].sequence_number = 3;

        assert!(matches!(
            s.validate(),
            Err(EngineError::Misconfiguration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_stream() {
        let s = stream(0, 0);

        assert!(s.validate().is_err());
    }
}
