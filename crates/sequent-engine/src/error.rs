//! Errors surfaced to callers of the command bus and returned by handlers.

use std::time::Duration;

use sequent_core::command::Rejection;
use sequent_core::error::EngineError;
use uuid::Uuid;

/// Why a command did not produce a successful outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecuteError {
    /// The handler rejected the command. The rejection is recorded, so
    /// resubmitting the same command returns it again.
    #[error("command rejected: {0}")]
    Rejected(Rejection),

    /// Every attempt lost an optimistic concurrency race.
    #[error("aggregate {aggregate_id} kept changing; gave up after {attempts} attempts")]
    ConcurrencyConflict {
        /// The aggregate whose version kept moving.
        aggregate_id: Uuid,
        /// Attempts made, including the first.
        attempts: u32,
    },

    /// No handler is registered for the command type.
    #[error("no handler registered for command type {0}")]
    HandlerNotFound(String),

    /// The caller stopped waiting. The command may still complete; resubmit
    /// it with the same ID to learn the outcome.
    #[error("command {command_id} did not finish within {after:?}")]
    Timeout {
        /// The command that timed out.
        command_id: Uuid,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// Infrastructure or programming failure. Nothing is recorded, so the
    /// command can be retried with the same ID.
    #[error(transparent)]
    System(#[from] EngineError),

    /// The engine is shutting down or the worker handling the command went
    /// away before replying.
    #[error("engine is not accepting commands")]
    Unavailable,
}

/// Error returned from a command handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// A business rule refused the command.
    #[error("{0}")]
    Rejected(Rejection),

    /// Anything else. Concurrency conflicts raised here are retried.
    #[error(transparent)]
    System(#[from] EngineError),
}

impl From<Rejection> for HandlerError {
    fn from(rejection: Rejection) -> Self {
        Self::Rejected(rejection)
    }
}

/// Result type returned by command handlers.
pub type HandlerResult = Result<(), HandlerError>;
