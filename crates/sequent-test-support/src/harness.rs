//! In-memory wiring and polling helpers.

use std::sync::Arc;
use std::time::Duration;

use sequent_core::config::{EngineConfig, RetryPolicy};
use sequent_engine::{Engine, EngineBuilder};
use sequent_event_store::{
    InMemoryCommandStore, InMemoryEventStore, InMemorySnapshotStore, InMemoryWatermarkStore,
};
use tokio::time::Instant;

/// One of each in-memory store. Clones share the stores, so a second
/// engine built from the same `TestStores` behaves like a restarted process.
#[derive(Debug, Clone, Default)]
pub struct TestStores {
    /// Committed streams.
    pub events: Arc<InMemoryEventStore>,
    /// Handled commands.
    pub commands: Arc<InMemoryCommandStore>,
    /// Snapshots.
    pub snapshots: Arc<InMemorySnapshotStore>,
    /// Publisher watermarks.
    pub watermarks: Arc<InMemoryWatermarkStore>,
}

impl TestStores {
    /// Fresh, empty stores.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine builder wired to these stores with [`fast_config`].
    #[must_use]
    pub fn engine(&self) -> EngineBuilder {
        Engine::builder()
            .config(fast_config())
            .event_store(self.events.clone())
            .command_store(self.commands.clone())
            .snapshot_store(self.snapshots.clone())
            .watermark_store(self.watermarks.clone())
    }
}

/// Configuration with short timeouts and no jitter.
#[must_use]
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        worker_limit: 16,
        mailbox_idle_timeout: Duration::from_millis(50),
        default_command_timeout: Duration::from_secs(5),
        conflict_retry: RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(20),
            jitter: Duration::from_millis(2),
        },
        publish_retry: RetryPolicy {
            max_retries: 0,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            jitter: Duration::ZERO,
        },
        snapshot_queue_capacity: 64,
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// passes. Returns the last result.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
