//! Subscriber that records what it receives.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sequent_core::error::EngineError;
use sequent_core::event::EventStream;
use sequent_engine::EventSubscriber;
use uuid::Uuid;

/// Records every delivered stream. Can be told to fail a number of
/// deliveries first.
#[derive(Debug)]
pub struct RecordingSubscriber {
    name: String,
    received: Mutex<Vec<EventStream>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl RecordingSubscriber {
    /// Creates a subscriber in group `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            received: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fails the next `n` deliveries.
    #[must_use]
    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Every stream received, in delivery order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn received(&self) -> Vec<EventStream> {
        self.received.lock().unwrap().clone()
    }

    /// Versions received for one aggregate, in delivery order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn versions_for(&self, aggregate_id: Uuid) -> Vec<i64> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|stream| stream.aggregate_id == aggregate_id)
            .map(EventStream::version)
            .collect()
    }

    /// Delivery attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` streams arrived or `timeout` passed.
    /// Returns whether the count was reached.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        crate::eventually(timeout, || self.received.lock().unwrap().len() >= count).await
    }
}

#[async_trait]
impl EventSubscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, stream: &EventStream) -> Result<(), EngineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::Infrastructure(format!(
                "{} refused version {}",
                self.name,
                stream.version()
            )));
        }
        self.received.lock().unwrap().push(stream.clone());
        Ok(())
    }
}
