//! Bridges between the publisher and a message broker.
//!
//! On the producing side a [`TransportSubscriber`] publishes each committed
//! stream as JSON, keyed by aggregate ID. On the consuming side an
//! [`InboundConsumer`] decodes those payloads and feeds them into a local
//! [`Publisher`], whose watermarks discard redeliveries and restore order.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sequent_core::error::EngineError;
use sequent_core::event::EventStream;
use sequent_core::transport::{PayloadHandler, Transport};
use tracing::trace;

use crate::publisher::{EventSubscriber, Publisher};

/// Encodes a stream for the wire.
///
/// # Errors
///
/// Returns `EngineError::Serialization` if encoding fails.
pub fn encode_stream(stream: &EventStream) -> Result<Vec<u8>, EngineError> {
    Ok(serde_json::to_vec(stream)?)
}

/// Decodes and validates a stream received from the wire.
///
/// # Errors
///
/// Returns `EngineError::Serialization` for malformed JSON and
/// `EngineError::Misconfiguration` for a malformed stream.
pub fn decode_stream(payload: &[u8]) -> Result<EventStream, EngineError> {
    let stream: EventStream = serde_json::from_slice(payload)?;
    stream.validate()?;
    Ok(stream)
}

/// Publishes committed streams to a broker topic.
pub struct TransportSubscriber {
    name: String,
    topic: String,
    transport: Arc<dyn Transport>,
    aggregate_types: Option<HashSet<String>>,
}

impl TransportSubscriber {
    /// Publishes every stream to `topic` under subscriber group `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, topic: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            transport,
            aggregate_types: None,
        }
    }

    /// Restricts publishing to the given aggregate types.
    #[must_use]
    pub fn only<I, S>(mut self, aggregate_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregate_types = Some(aggregate_types.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl EventSubscriber for TransportSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, stream: &EventStream) -> bool {
        self.aggregate_types
            .as_ref()
            .is_none_or(|types| types.contains(&stream.aggregate_type))
    }

    async fn deliver(&self, stream: &EventStream) -> Result<(), EngineError> {
        let payload = encode_stream(stream)?;
        self.transport
            .publish(&self.topic, &stream.aggregate_id.to_string(), payload)
            .await?;
        trace!(topic = %self.topic, version = stream.version(), "stream published");
        Ok(())
    }
}

/// Feeds streams received from a broker into a local publisher.
///
/// A payload is acknowledged once it is queued; delivery to local
/// subscribers then follows the publisher's watermark rules.
#[derive(Clone)]
pub struct InboundConsumer {
    publisher: Publisher,
}

impl InboundConsumer {
    /// Creates a consumer feeding `publisher`.
    #[must_use]
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    /// Subscribes this consumer to `topic`.
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub async fn attach(self, transport: &dyn Transport, topic: &str) -> Result<(), EngineError> {
        transport.subscribe(topic, Arc::new(self)).await
    }
}

#[async_trait]
impl PayloadHandler for InboundConsumer {
    async fn handle(&self, payload: &[u8]) -> Result<(), EngineError> {
        let stream = decode_stream(payload)?;
        trace!(
            aggregate_id = %stream.aggregate_id,
            version = stream.version(),
            "stream received"
        );
        self.publisher.submit(stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use sequent_core::event::RecordedEvent;
    use uuid::Uuid;

    use super::*;

    fn stream() -> EventStream {
        EventStream {
            aggregate_id: Uuid::new_v4(),
            aggregate_type: "account".to_owned(),
            expected_version: 2,
            command_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            events: vec![RecordedEvent {
                event_id: Uuid::new_v4(),
                event_type: "account.deposited".to_owned(),
                sequence_number: 3,
                payload: serde_json::json!({ "amount": 5 }),
            }],
            items: BTreeMap::from([("tenant".to_owned(), "acme".to_owned())]),
        }
    }

    #[test]
    fn test_decode_accepts_encoded_stream() {
        let original = stream();

        let decoded = decode_stream(&encode_stream(&original).unwrap()).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_rejects_misnumbered_stream() {
        let mut broken = stream();
        broken.events[0].sequence_number = 9;

        let result = decode_stream(&encode_stream(&broken).unwrap());

        assert!(matches!(result, Err(EngineError::Misconfiguration(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_stream(b"not json"),
            Err(EngineError::Serialization(_))
        ));
    }
}
