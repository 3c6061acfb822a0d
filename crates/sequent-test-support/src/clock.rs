//! Deterministic `Clock` for tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sequent_core::clock::{Clock, SharedClock};

/// A clock that always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// 2026-01-15T12:00:00Z as a shared clock.
    ///
    /// # Panics
    ///
    /// Never; the literal date is valid.
    #[must_use]
    pub fn shared() -> SharedClock {
        let instant = Utc
            .with_ymd_and_hms(2026, 1, 15, 12, 0, 0)
            .single()
            .expect("valid date");
        Arc::new(Self(instant))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
