//! Ordered, at-least-once delivery of committed streams to subscribers.
//!
//! Every subscriber group gets one lane per aggregate. A lane keeps a
//! watermark: the aggregate version the group has fully received. A stream is
//! delivered only when its `expected_version` equals the watermark; streams
//! at or below it are dropped as redeliveries, and streams beyond it wait
//! until the gap is filled (from the event store when one is configured, or
//! by the transport redelivering). Failed deliveries are retried with
//! backoff until they succeed or the publisher shuts down; a stuck lane only
//! blocks its own aggregate.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use sequent_core::config::{EngineConfig, RetryPolicy};
use sequent_core::error::EngineError;
use sequent_core::event::EventStream;
use sequent_core::store::{EventStore, WatermarkStore};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mailbox::{MailboxHandler, Mailboxes};

/// A consumer of committed streams.
#[async_trait]
pub trait EventSubscriber: Send + Sync + 'static {
    /// Subscriber group name. Watermarks are kept per group, so two
    /// processes registering the same name share progress.
    fn name(&self) -> &str;

    /// Whether the subscriber wants this stream. Streams it does not want
    /// still advance its watermark.
    fn accepts(&self, _stream: &EventStream) -> bool {
        true
    }

    /// Delivers one stream. Called at most once at a time per aggregate, in
    /// version order.
    ///
    /// # Errors
    ///
    /// Any error schedules a retry of the same stream.
    async fn deliver(&self, stream: &EventStream) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct LaneKey {
    group: Arc<str>,
    aggregate_id: Uuid,
}

pub(crate) struct Delivery {
    subscriber: Arc<dyn EventSubscriber>,
    stream: Arc<EventStream>,
}

#[derive(Default)]
pub(crate) struct LaneState {
    subscriber: Option<Arc<dyn EventSubscriber>>,
    watermark: Option<i64>,
    // Streams waiting for delivery, keyed by expected version.
    pending: BTreeMap<i64, Arc<EventStream>>,
}

pub(crate) struct Lanes {
    events: Option<Arc<dyn EventStore>>,
    watermarks: Arc<dyn WatermarkStore>,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

#[async_trait]
impl MailboxHandler for Lanes {
    type Key = LaneKey;
    type Message = Delivery;
    type State = LaneState;

    async fn open(&self, _key: &LaneKey) -> LaneState {
        LaneState::default()
    }

    async fn handle(&self, key: &LaneKey, state: &mut LaneState, delivery: Delivery) {
        if state.subscriber.is_none() {
            state.subscriber = Some(delivery.subscriber);
        }
        let stream = delivery.stream;
        state
            .pending
            .entry(stream.expected_version)
            .or_insert(stream);
        self.drain(key, state).await;
    }

    fn is_settled(&self, state: &LaneState) -> bool {
        // After shutdown held streams are left to `resume_all` on restart.
        state.pending.is_empty() || *self.shutdown.borrow()
    }

    async fn tick(&self, key: &LaneKey, state: &mut LaneState) {
        self.drain(key, state).await;
    }
}

impl Lanes {
    async fn drain(&self, key: &LaneKey, state: &mut LaneState) {
        let Some(subscriber) = state.subscriber.clone() else {
            return;
        };
        loop {
            let Some(watermark) = self.watermark(key, state).await else {
                return;
            };
            let before = state.pending.len();
            state
                .pending
                .retain(|_, stream| stream.expected_version >= watermark);
            if state.pending.len() < before {
                debug!(
                    dropped = before - state.pending.len(),
                    watermark, "dropped streams already delivered"
                );
            }

            let Some(next) = state.pending.remove(&watermark) else {
                let Some(&gap_end) = state.pending.keys().next() else {
                    return;
                };
                if self.fill_gap(key, state, watermark, gap_end).await {
                    continue;
                }
                return;
            };

            if subscriber.accepts(&next) && !self.deliver(key, subscriber.as_ref(), &next).await {
                state.pending.insert(watermark, next);
                return;
            }
            let version = next.version();
            state.watermark = Some(version);
            if let Err(err) = self
                .watermarks
                .advance(&key.group, key.aggregate_id, version)
                .await
            {
                // The lane keeps its in-memory position; after a restart the
                // stream is delivered again.
                warn!(version, error = %err, "failed to persist watermark");
            }
            debug!(version, "stream delivered");
        }
    }

    async fn watermark(&self, key: &LaneKey, state: &mut LaneState) -> Option<i64> {
        if let Some(watermark) = state.watermark {
            return Some(watermark);
        }
        match self.watermarks.load(&key.group, key.aggregate_id).await {
            Ok(watermark) => {
                state.watermark = Some(watermark);
                Some(watermark)
            }
            Err(err) => {
                warn!(error = %err, "failed to load watermark; holding lane");
                None
            }
        }
    }

    /// Fetches the streams between the watermark and the first held stream.
    /// Returns whether the next stream is now available.
    async fn fill_gap(
        &self,
        key: &LaneKey,
        state: &mut LaneState,
        watermark: i64,
        gap_end: i64,
    ) -> bool {
        let Some(events) = &self.events else {
            debug!(watermark, gap_end, "holding stream until the gap is redelivered");
            return false;
        };
        match events.query(key.aggregate_id, watermark + 1, gap_end).await {
            Ok(streams) => {
                for stream in streams {
                    if stream.expected_version >= watermark {
                        state
                            .pending
                            .entry(stream.expected_version)
                            .or_insert_with(|| Arc::new(stream));
                    }
                }
                state.pending.contains_key(&watermark)
            }
            Err(err) => {
                warn!(watermark, gap_end, error = %err, "failed to fetch missing streams");
                false
            }
        }
    }

    /// Delivers until success. Returns `false` if shutdown interrupted it.
    async fn deliver(
        &self,
        key: &LaneKey,
        subscriber: &dyn EventSubscriber,
        stream: &EventStream,
    ) -> bool {
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 0u32;
        loop {
            if *shutdown.borrow() {
                return false;
            }
            match subscriber.deliver(stream).await {
                Ok(()) => return true,
                Err(err) => {
                    let delay = self.retry.backoff(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        group = %key.group,
                        version = stream.version(),
                        attempt,
                        ?delay,
                        error = %err,
                        "delivery failed; retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Fans committed streams out to subscribers, one ordered lane per
/// subscriber group and aggregate.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

struct Inner {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    lanes: Mailboxes<Lanes>,
    shutdown: watch::Sender<bool>,
}

impl Publisher {
    /// Creates a publisher. Without an event store, gaps are only closed by
    /// redelivery and [`catch_up`](Self::catch_up) is unavailable.
    #[must_use]
    pub fn new(
        watermarks: Arc<dyn WatermarkStore>,
        events: Option<Arc<dyn EventStore>>,
        config: &EngineConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let lanes = Mailboxes::new(
            "publisher",
            Lanes {
                events,
                watermarks,
                retry: config.publish_retry,
                shutdown: shutdown_rx,
            },
            config.mailbox_idle_timeout,
            None,
        );
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(Vec::new()),
                lanes,
                shutdown,
            }),
        }
    }

    /// Adds a subscriber. It receives streams submitted from now on; call
    /// [`catch_up`](Self::catch_up) or [`resume_all`](Self::resume_all) for
    /// older ones.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Misconfiguration` if a subscriber with the same
    /// name is already registered.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> Result<(), EngineError> {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if subscribers.iter().any(|s| s.name() == subscriber.name()) {
            return Err(EngineError::Misconfiguration(format!(
                "subscriber {} is already registered",
                subscriber.name()
            )));
        }
        info!(subscriber = subscriber.name(), "subscriber registered");
        subscribers.push(subscriber);
        Ok(())
    }

    /// Names of the registered subscribers.
    #[must_use]
    pub fn subscriber_names(&self) -> Vec<String> {
        self.subscribers().iter().map(|s| s.name().to_owned()).collect()
    }

    /// Queues a committed stream for every subscriber. Never blocks.
    pub fn submit(&self, stream: EventStream) {
        let stream = Arc::new(stream);
        for subscriber in self.subscribers().iter() {
            self.enqueue(subscriber, &stream);
        }
    }

    /// Re-queues everything after each subscriber's watermark for one
    /// aggregate. Returns the number of deliveries queued.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Misconfiguration` without an event store, or
    /// the store's error.
    pub async fn catch_up(&self, aggregate_id: Uuid) -> Result<usize, EngineError> {
        let lanes = self.inner.lanes.handler();
        let events = lanes.events.as_ref().ok_or_else(|| {
            EngineError::Misconfiguration("catch-up needs an event store".to_owned())
        })?;
        let subscribers = self.subscribers().clone();
        let mut queued = 0;
        for subscriber in &subscribers {
            let watermark = lanes.watermarks.load(subscriber.name(), aggregate_id).await?;
            for stream in events.query(aggregate_id, watermark + 1, i64::MAX).await? {
                self.enqueue(subscriber, &Arc::new(stream));
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Runs [`catch_up`](Self::catch_up) for every aggregate in the event
    /// store. Call once at startup.
    ///
    /// # Errors
    ///
    /// Returns the first error from the store.
    pub async fn resume_all(&self) -> Result<usize, EngineError> {
        let events = self.inner.lanes.handler().events.as_ref().ok_or_else(|| {
            EngineError::Misconfiguration("resume needs an event store".to_owned())
        })?;
        let mut queued = 0;
        for aggregate_id in events.list_aggregate_ids().await? {
            queued += self.catch_up(aggregate_id).await?;
        }
        info!(queued, "publisher resumed");
        Ok(queued)
    }

    /// Persisted watermark of `group` for `aggregate_id`.
    ///
    /// # Errors
    ///
    /// Returns the watermark store's error.
    pub async fn watermark(&self, group: &str, aggregate_id: Uuid) -> Result<i64, EngineError> {
        self.inner.lanes.handler().watermarks.load(group, aggregate_id).await
    }

    /// Stops delivering. Streams in flight stay queued and are picked up by
    /// [`resume_all`](Self::resume_all) after a restart.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Number of live lanes.
    #[must_use]
    pub fn active_lanes(&self) -> usize {
        self.inner.lanes.active()
    }

    fn subscribers(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn EventSubscriber>>> {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, subscriber: &Arc<dyn EventSubscriber>, stream: &Arc<EventStream>) {
        self.inner.lanes.enqueue(
            LaneKey {
                group: Arc::from(subscriber.name()),
                aggregate_id: stream.aggregate_id,
            },
            Delivery {
                subscriber: Arc::clone(subscriber),
                stream: Arc::clone(stream),
            },
        );
    }
}
