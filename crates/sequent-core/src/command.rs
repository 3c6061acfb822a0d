//! Command abstractions and the records kept about handled commands.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trait that all commands implement.
pub trait Command: Send + Sync + std::fmt::Debug + Sized + 'static {
    /// Idempotency key. Resubmitting a command with the same ID never applies
    /// it twice.
    fn command_id(&self) -> Uuid;

    /// The type name for this command (handler lookup and logging).
    const COMMAND_TYPE: &'static str;

    /// Returns [`COMMAND_TYPE`](Self::COMMAND_TYPE).
    fn command_type(&self) -> &'static str {
        Self::COMMAND_TYPE
    }

    /// The aggregate this command is routed to. Commands for the same
    /// aggregate run one at a time in arrival order.
    fn aggregate_id(&self) -> Uuid;

    /// Correlation ID to trace this command through the system.
    fn correlation_id(&self) -> Uuid {
        self.command_id()
    }

    /// How long the caller is willing to wait for an outcome. `None` uses the
    /// engine default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Context items copied onto every stream the command commits.
    fn items(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// A business rejection raised by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Machine-readable rejection code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured details for the caller.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Rejection {
    /// Creates a rejection without details.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Reference to a stream committed by a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    /// The aggregate that was mutated.
    pub aggregate_id: Uuid,
    /// The aggregate type name.
    pub aggregate_type: String,
    /// Aggregate version after the commit.
    pub version: i64,
    /// Number of events in the stream.
    pub event_count: usize,
}

/// The terminal outcome of a command, recorded so a retry can replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The handler succeeded. `commits` is empty when it produced no events.
    Succeeded {
        /// Streams the command committed.
        commits: Vec<CommitRef>,
        /// Value the handler chose to return.
        #[serde(default)]
        result: serde_json::Value,
    },
    /// The handler rejected the command.
    Rejected(Rejection),
}

/// Durable record that a command has been handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandledCommand {
    /// The command identifier.
    pub command_id: Uuid,
    /// The aggregate the command was routed to.
    pub aggregate_id: Uuid,
    /// The command type name.
    pub command_type: String,
    /// The recorded outcome.
    pub outcome: CommandOutcome,
    /// When the outcome was recorded.
    pub handled_at: DateTime<Utc>,
}
