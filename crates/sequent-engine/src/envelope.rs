//! Type-erased command as it travels through the sequencer.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sequent_core::command::Command;
use uuid::Uuid;

/// A command with its routing metadata pulled out, so mailboxes can carry
/// commands of any type.
#[derive(Clone)]
pub struct CommandEnvelope {
    /// Idempotency key.
    pub command_id: Uuid,
    /// Handler lookup key.
    pub command_type: &'static str,
    /// Aggregate the command is sequenced on.
    pub aggregate_id: Uuid,
    /// Correlation ID copied onto committed streams.
    pub correlation_id: Uuid,
    /// Caller-requested timeout, if any.
    pub timeout: Option<Duration>,
    /// Context items copied onto committed streams.
    pub items: BTreeMap<String, String>,
    pub(crate) payload: Arc<dyn Any + Send + Sync>,
}

impl CommandEnvelope {
    /// Wraps a command.
    #[must_use]
    pub fn new<C: Command>(command: C) -> Self {
        Self {
            command_id: command.command_id(),
            command_type: C::COMMAND_TYPE,
            aggregate_id: command.aggregate_id(),
            correlation_id: command.correlation_id(),
            timeout: command.timeout(),
            items: command.items(),
            payload: Arc::new(command),
        }
    }

    /// Returns the wrapped command if it is a `C`.
    #[must_use]
    pub fn downcast_ref<C: Command>(&self) -> Option<&C> {
        self.payload.downcast_ref::<C>()
    }
}

impl fmt::Debug for CommandEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEnvelope")
            .field("command_id", &self.command_id)
            .field("command_type", &self.command_type)
            .field("aggregate_id", &self.aggregate_id)
            .field("correlation_id", &self.correlation_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
