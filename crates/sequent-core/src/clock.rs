//! Time source used to stamp streams, handled commands and snapshots.

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Source of wall-clock time. Injected so tests can pin timestamps.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock handle shared between the processor, snapshotter and stores.
pub type SharedClock = Arc<dyn Clock>;

/// Reads the operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Returns the system clock as a [`SharedClock`].
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
