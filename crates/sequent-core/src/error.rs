//! Engine error types.

use thiserror::Error;
use uuid::Uuid;

/// Top-level error type shared by the stores, the repository and handlers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// An aggregate was not found.
    #[error("aggregate not found: {aggregate_type} {aggregate_id}")]
    AggregateNotFound {
        /// The aggregate type name.
        aggregate_type: String,
        /// The aggregate identifier.
        aggregate_id: Uuid,
    },

    /// Optimistic concurrency conflict.
    #[error(
        "concurrency conflict on aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_id: Uuid,
        /// The expected version.
        expected: i64,
        /// The actual version found.
        actual: i64,
    },

    /// The command was already applied.
    #[error("command {0} has already been handled")]
    DuplicateCommand(Uuid),

    /// No handler is registered for a command type.
    #[error("no handler registered for command type {0}")]
    HandlerNotFound(String),

    /// The engine was wired incorrectly (unregistered aggregate type, bad
    /// config value, mismatched handler payload).
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    /// An event, snapshot or outcome could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
