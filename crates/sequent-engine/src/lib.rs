//! Sequent Engine: sequenced command execution over an event store.
//!
//! Commands enter through the [`CommandBus`], are serialized per aggregate by
//! the [`Sequencer`], and run through the [`CommandProcessor`]: deduplicate
//! by command ID, invoke the handler, commit one stream per touched
//! aggregate with an optimistic version check, publish, and record the
//! outcome. The [`Publisher`] delivers committed streams to subscribers in
//! version order per aggregate, at least once.

pub mod bus;
pub mod context;
pub mod engine;
pub mod envelope;
pub mod error;
mod mailbox;
pub mod process_manager;
pub mod processor;
pub mod publisher;
pub mod registry;
pub mod repository;
pub mod sequencer;
pub mod snapshotter;
pub mod transport;

pub use bus::{CommandBus, CommandHandle};
pub use context::CommandContext;
pub use engine::{Engine, EngineBuilder};
pub use envelope::CommandEnvelope;
pub use error::{ExecuteError, HandlerError, HandlerResult};
pub use process_manager::{ProcessManager, derive_command_id};
pub use processor::{CommandProcessor, CommandResult};
pub use publisher::{EventSubscriber, Publisher};
pub use registry::{CommandHandler, Registry, RegistryBuilder};
pub use repository::Repository;
pub use sequencer::Sequencer;
pub use snapshotter::Snapshotter;
pub use transport::{InboundConsumer, TransportSubscriber, decode_stream, encode_stream};
