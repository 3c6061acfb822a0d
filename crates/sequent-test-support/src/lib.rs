//! Shared fixtures for testing the Sequent pipeline: a sample account
//! domain, in-memory wiring, recording subscribers, an in-memory broker and
//! stores that inject faults.

pub mod account;
mod clock;
mod harness;
mod stores;
mod subscriber;
mod transport;

pub use clock::FixedClock;
pub use harness::{TestStores, eventually, fast_config};
pub use stores::{
    ConflictOnceEventStore, ConflictingEventStore, FailingEventStore, FlakyCommandStore,
    GatedEventStore,
};
pub use subscriber::RecordingSubscriber;
pub use transport::InMemoryTransport;
