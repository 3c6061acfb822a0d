//! Contract for the message broker that carries committed streams between
//! processes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;

/// Receives payloads delivered by a [`Transport`] subscription.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    /// Handles one payload. An error asks the transport to redeliver.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload could not be processed.
    async fn handle(&self, payload: &[u8]) -> Result<(), EngineError>;
}

/// Topic-based broker with at-least-once delivery. Delivery order across
/// restarts is not guaranteed; consumers gate on watermarks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes a payload. `partition_key` groups payloads that the broker
    /// should keep together (the aggregate id).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Infrastructure` when the broker does not
    /// acknowledge the publish.
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), EngineError>;

    /// Registers a handler for every payload published to `topic`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Infrastructure` when the subscription cannot be
    /// established.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn PayloadHandler>,
    ) -> Result<(), EngineError>;
}
