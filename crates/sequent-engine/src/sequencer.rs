//! Per-aggregate serialization of commands.

use std::sync::Arc;

use async_trait::async_trait;
use sequent_core::config::EngineConfig;
use sequent_core::error::EngineError;
use tokio::sync::oneshot;
use tracing::error;
use uuid::Uuid;

use crate::envelope::CommandEnvelope;
use crate::error::ExecuteError;
use crate::mailbox::{MailboxHandler, Mailboxes};
use crate::processor::{CommandProcessor, CommandResult};

pub(crate) type Reply = oneshot::Sender<Result<CommandResult, ExecuteError>>;

pub(crate) struct Sequenced {
    envelope: CommandEnvelope,
    reply: Reply,
}

pub(crate) struct Worker {
    processor: Arc<CommandProcessor>,
}

#[async_trait]
impl MailboxHandler for Worker {
    type Key = Uuid;
    type Message = Sequenced;
    type State = ();

    async fn open(&self, _aggregate_id: &Uuid) {}

    async fn handle(&self, _aggregate_id: &Uuid, _state: &mut (), message: Sequenced) {
        let Sequenced { envelope, reply } = message;
        let command_id = envelope.command_id;
        let processor = Arc::clone(&self.processor);
        // A panicking handler fails its own command; the mailbox carries on.
        let result = match tokio::spawn(async move { processor.process(&envelope).await }).await
        {
            Ok(result) => result,
            Err(join_error) => {
                error!(%command_id, error = %join_error, "command processing panicked");
                Err(ExecuteError::System(EngineError::Infrastructure(format!(
                    "processing of command {command_id} panicked"
                ))))
            }
        };
        // The caller may have stopped waiting.
        let _ = reply.send(result);
    }
}

/// Routes commands into one mailbox per aggregate. Commands for the same
/// aggregate run one at a time in submission order; at most
/// `worker_limit` commands run at once overall.
#[derive(Clone)]
pub struct Sequencer {
    mailboxes: Mailboxes<Worker>,
}

impl Sequencer {
    /// Creates a sequencer feeding `processor`.
    #[must_use]
    pub fn new(processor: Arc<CommandProcessor>, config: &EngineConfig) -> Self {
        Self {
            mailboxes: Mailboxes::new(
                "sequencer",
                Worker { processor },
                config.mailbox_idle_timeout,
                Some(config.worker_limit),
            ),
        }
    }

    pub(crate) fn enqueue(&self, envelope: CommandEnvelope, reply: Reply) {
        self.mailboxes
            .enqueue(envelope.aggregate_id, Sequenced { envelope, reply });
    }

    /// Number of aggregates with a live mailbox.
    #[must_use]
    pub fn active_mailboxes(&self) -> usize {
        self.mailboxes.active()
    }
}
