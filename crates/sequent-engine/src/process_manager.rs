//! Process managers: react to committed streams by issuing commands.

use async_trait::async_trait;
use sequent_core::error::EngineError;
use sequent_core::event::EventStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::CommandBus;
use crate::envelope::CommandEnvelope;
use crate::error::ExecuteError;
use crate::publisher::EventSubscriber;

/// Turns committed streams into follow-up commands.
///
/// Streams can be delivered more than once, so follow-up command IDs must be
/// derived from the stream (see [`derive_command_id`]); the command store
/// then makes each follow-up happen once.
#[async_trait]
pub trait ProcessManager: Send + Sync + 'static {
    /// Subscriber group name.
    fn name(&self) -> &str;

    /// Whether the manager cares about this stream.
    fn accepts(&self, _stream: &EventStream) -> bool {
        true
    }

    /// Commands to issue in response to `stream`.
    ///
    /// # Errors
    ///
    /// Any error makes the publisher redeliver the stream.
    async fn react(&self, stream: &EventStream) -> Result<Vec<CommandEnvelope>, EngineError>;
}

/// Deterministic command ID for a command issued in reaction to `stream`.
/// `discriminator` tells apart several commands issued for the same stream.
#[must_use]
pub fn derive_command_id(stream: &EventStream, discriminator: &str) -> Uuid {
    let name = format!(
        "{}:{}:{discriminator}",
        stream.aggregate_id,
        stream.version()
    );
    Uuid::new_v5(&stream.command_id, name.as_bytes())
}

pub(crate) struct ProcessManagerSubscriber<P> {
    pub(crate) manager: P,
    pub(crate) bus: CommandBus,
}

#[async_trait]
impl<P: ProcessManager> EventSubscriber for ProcessManagerSubscriber<P> {
    fn name(&self) -> &str {
        self.manager.name()
    }

    fn accepts(&self, stream: &EventStream) -> bool {
        self.manager.accepts(stream)
    }

    async fn deliver(&self, stream: &EventStream) -> Result<(), EngineError> {
        for envelope in self.manager.react(stream).await? {
            let command_id = envelope.command_id;
            let command_type = envelope.command_type;
            match self.bus.execute_envelope(envelope).await {
                Ok(_) => {}
                // Permanent outcomes; retrying would not change them.
                Err(ExecuteError::Rejected(rejection)) => {
                    info!(%command_id, command_type, code = %rejection.code, "follow-up command rejected");
                }
                Err(ExecuteError::HandlerNotFound(command_type)) => {
                    warn!(%command_id, command_type, "no handler for follow-up command");
                }
                Err(err) => {
                    return Err(EngineError::Infrastructure(format!(
                        "follow-up command {command_id} ({command_type}) failed: {err}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;

    fn stream(expected_version: i64) -> EventStream {
        EventStream {
            aggregate_id: Uuid::from_u128(1),
            aggregate_type: "account".to_owned(),
            expected_version,
            command_id: Uuid::from_u128(2),
            correlation_id: Uuid::from_u128(2),
            timestamp: Utc::now(),
            events: vec![sequent_core::event::RecordedEvent {
                event_id: Uuid::new_v4(),
                event_type: "account.opened".to_owned(),
                sequence_number: expected_version + 1,
                payload: serde_json::Value::Null,
            }],
            items: BTreeMap::new(),
        }
    }

    #[test]
    fn test_derived_id_is_stable_across_redeliveries() {
        // Event IDs and timestamps differ, the derived ID does not.
        assert_eq!(
            derive_command_id(&stream(0), "bonus"),
            derive_command_id(&stream(0), "bonus")
        );
    }

    #[test]
    fn test_derived_id_differs_by_discriminator_and_version() {
        let first = derive_command_id(&stream(0), "bonus");

        assert_ne!(first, derive_command_id(&stream(0), "audit"));
        assert_ne!(first, derive_command_id(&stream(1), "bonus"));
    }
}
