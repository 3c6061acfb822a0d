//! Entry point for submitting commands.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sequent_core::command::Command;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::envelope::CommandEnvelope;
use crate::error::ExecuteError;
use crate::processor::CommandResult;
use crate::sequencer::Sequencer;

/// Submits commands to the sequencer.
#[derive(Clone)]
pub struct CommandBus {
    sequencer: Sequencer,
    default_timeout: Duration,
    accepting: Arc<AtomicBool>,
}

impl CommandBus {
    pub(crate) fn new(sequencer: Sequencer, default_timeout: Duration) -> Self {
        Self {
            sequencer,
            default_timeout,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Queues a command and returns a handle to its outcome. The timeout
    /// starts now.
    #[must_use]
    pub fn send<C: Command>(&self, command: C) -> CommandHandle {
        self.send_envelope(CommandEnvelope::new(command))
    }

    /// Queues an already wrapped command.
    #[must_use]
    pub fn send_envelope(&self, envelope: CommandEnvelope) -> CommandHandle {
        let timeout = envelope.timeout.unwrap_or(self.default_timeout);
        let command_id = envelope.command_id;
        let (reply, receiver) = oneshot::channel();
        if self.accepting.load(Ordering::Acquire) {
            self.sequencer.enqueue(envelope, reply);
        }
        // Otherwise the reply sender is dropped here and the handle resolves
        // to `Unavailable`.
        CommandHandle {
            command_id,
            timeout,
            deadline: Instant::now() + timeout,
            receiver,
        }
    }

    /// Sends a command and waits for its outcome.
    ///
    /// # Errors
    ///
    /// See [`ExecuteError`].
    pub async fn execute<C: Command>(&self, command: C) -> Result<CommandResult, ExecuteError> {
        self.send(command).wait().await
    }

    /// Sends a wrapped command and waits for its outcome.
    ///
    /// # Errors
    ///
    /// See [`ExecuteError`].
    pub async fn execute_envelope(
        &self,
        envelope: CommandEnvelope,
    ) -> Result<CommandResult, ExecuteError> {
        self.send_envelope(envelope).wait().await
    }

    /// Refuses new commands. Commands already queued still run.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Whether the bus still accepts commands.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

/// Pending outcome of a sent command.
#[derive(Debug)]
pub struct CommandHandle {
    command_id: Uuid,
    timeout: Duration,
    deadline: Instant,
    receiver: oneshot::Receiver<Result<CommandResult, ExecuteError>>,
}

impl CommandHandle {
    /// The command this handle tracks.
    #[must_use]
    pub fn command_id(&self) -> Uuid {
        self.command_id
    }

    /// Waits for the outcome until the deadline. Timing out does not cancel
    /// the command.
    ///
    /// # Errors
    ///
    /// Returns `ExecuteError::Timeout` when the deadline passes and
    /// `ExecuteError::Unavailable` when the engine dropped the command.
    pub async fn wait(self) -> Result<CommandResult, ExecuteError> {
        match tokio::time::timeout_at(self.deadline, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExecuteError::Unavailable),
            Err(_) => Err(ExecuteError::Timeout {
                command_id: self.command_id,
                after: self.timeout,
            }),
        }
    }
}
