//! In-process broker for transport tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sequent_core::error::EngineError;
use sequent_core::transport::{PayloadHandler, Transport};

#[derive(Debug, Clone)]
struct Message {
    topic: String,
    partition_key: String,
    payload: Vec<u8>,
}

/// Broker that delivers synchronously to in-process handlers.
///
/// Every publish is logged so tests can redeliver, and delivery can be
/// paused to hold messages and release them in any order.
#[derive(Default)]
pub struct InMemoryTransport {
    handlers: Mutex<HashMap<String, Vec<Arc<dyn PayloadHandler>>>>,
    log: Mutex<Vec<Message>>,
    held: Mutex<Vec<Message>>,
    paused: AtomicBool,
    failures_left: AtomicUsize,
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("paused", &self.paused)
            .field("failures_left", &self.failures_left)
            .finish_non_exhaustive()
    }
}

impl InMemoryTransport {
    /// Creates a broker with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses the next `n` publishes.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Holds published messages instead of delivering them.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Partition keys of everything published so far, in publish order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn published_keys(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.partition_key.clone())
            .collect()
    }

    /// Resumes delivery, first delivering held messages in reverse order.
    ///
    /// # Errors
    ///
    /// Returns the first handler error.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub async fn release_reversed(&self) -> Result<(), EngineError> {
        self.paused.store(false, Ordering::SeqCst);
        let held: Vec<Message> = std::mem::take(&mut *self.held.lock().unwrap());
        for message in held.iter().rev() {
            self.dispatch(message).await?;
        }
        Ok(())
    }

    /// Delivers every message ever published again, as a broker does after
    /// a consumer restarts without committed offsets.
    ///
    /// # Errors
    ///
    /// Returns the first handler error.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub async fn redeliver_all(&self) -> Result<(), EngineError> {
        let log = self.log.lock().unwrap().clone();
        for message in &log {
            self.dispatch(message).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, message: &Message) -> Result<(), EngineError> {
        let handlers = self
            .handlers
            .lock()
            .unwrap()
            .get(&message.topic)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler.handle(&message.payload).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), EngineError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::Infrastructure("broker unavailable".to_owned()));
        }
        let message = Message {
            topic: topic.to_owned(),
            partition_key: partition_key.to_owned(),
            payload,
        };
        self.log.lock().unwrap().push(message.clone());
        if self.paused.load(Ordering::SeqCst) {
            self.held.lock().unwrap().push(message);
            return Ok(());
        }
        self.dispatch(&message).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn PayloadHandler>,
    ) -> Result<(), EngineError> {
        self.handlers
            .lock()
            .unwrap()
            .entry(topic.to_owned())
            .or_default()
            .push(handler);
        Ok(())
    }
}
