//! Keyed mailboxes: one FIFO queue and one task per key.
//!
//! Messages for the same key are handled strictly in arrival order by a
//! single task; different keys run concurrently. A task that sees no
//! messages for the idle timeout retires, and the next message for its key
//! starts a fresh one.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tracing::{Instrument, debug, info_span};

/// What a mailbox task does with its messages.
#[async_trait]
pub(crate) trait MailboxHandler: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Message: Send + 'static;
    type State: Send + 'static;

    /// Builds the per-key state when a task starts.
    async fn open(&self, key: &Self::Key) -> Self::State;

    /// Handles one message.
    async fn handle(&self, key: &Self::Key, state: &mut Self::State, message: Self::Message);

    /// Whether the task may retire. Unsettled tasks get [`tick`](Self::tick)
    /// on every idle timeout instead.
    fn is_settled(&self, _state: &Self::State) -> bool {
        true
    }

    /// Called on idle timeouts while the state is unsettled.
    async fn tick(&self, _key: &Self::Key, _state: &mut Self::State) {}
}

struct Slot<M> {
    generation: u64,
    sender: mpsc::UnboundedSender<M>,
}

struct Shared<H: MailboxHandler> {
    handler: Arc<H>,
    slots: Mutex<HashMap<H::Key, Slot<H::Message>>>,
    idle_timeout: Duration,
    permits: Option<Arc<Semaphore>>,
    next_generation: AtomicU64,
    name: &'static str,
}

impl<H: MailboxHandler> Shared<H> {
    // The map is only ever left in a consistent state, so a poisoned lock is
    // still usable.
    fn slots(&self) -> MutexGuard<'_, HashMap<H::Key, Slot<H::Message>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes this task's slot if nothing is queued. Holding the map lock
    /// while checking the queue means no sender can slip a message in between.
    fn retire(&self, key: &H::Key, generation: u64, rx: &mpsc::UnboundedReceiver<H::Message>) -> bool {
        let mut slots = self.slots();
        if !rx.is_empty() {
            return false;
        }
        if slots
            .get(key)
            .is_some_and(|slot| slot.generation == generation)
        {
            slots.remove(key);
        }
        true
    }
}

/// A set of keyed mailboxes sharing one handler.
pub(crate) struct Mailboxes<H: MailboxHandler> {
    shared: Arc<Shared<H>>,
}

impl<H: MailboxHandler> Clone for Mailboxes<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H: MailboxHandler> Mailboxes<H> {
    /// `concurrency` bounds how many messages are handled at once across all
    /// keys; `None` leaves it unbounded.
    pub(crate) fn new(
        name: &'static str,
        handler: H,
        idle_timeout: Duration,
        concurrency: Option<usize>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                handler: Arc::new(handler),
                slots: Mutex::new(HashMap::new()),
                idle_timeout,
                permits: concurrency.map(|n| Arc::new(Semaphore::new(n.max(1)))),
                next_generation: AtomicU64::new(0),
                name,
            }),
        }
    }

    pub(crate) fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// Queues `message` behind everything already queued for `key`.
    pub(crate) fn enqueue(&self, key: H::Key, message: H::Message) {
        let mut slots = self.shared.slots();
        let message = match slots.get(&key) {
            Some(slot) => match slot.sender.send(message) {
                Ok(()) => return,
                // The task died (a handler panicked); start over.
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let (sender, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail.
        let _ = sender.send(message);
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        slots.insert(key.clone(), Slot { generation, sender });
        drop(slots);

        let span = info_span!("mailbox", kind = self.shared.name, key = ?key);
        tokio::spawn(run(Arc::clone(&self.shared), key, generation, rx).instrument(span));
    }

    /// Number of live mailbox tasks.
    pub(crate) fn active(&self) -> usize {
        self.shared.slots().len()
    }
}

async fn run<H: MailboxHandler>(
    shared: Arc<Shared<H>>,
    key: H::Key,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<H::Message>,
) {
    let handler = Arc::clone(&shared.handler);
    let mut state = handler.open(&key).await;
    debug!("mailbox started");
    loop {
        match tokio::time::timeout(shared.idle_timeout, rx.recv()).await {
            Ok(Some(message)) => {
                let _permit = match &shared.permits {
                    Some(permits) => Arc::clone(permits).acquire_owned().await.ok(),
                    None => None,
                };
                handler.handle(&key, &mut state, message).await;
            }
            Ok(None) => break,
            Err(_) if !handler.is_settled(&state) => handler.tick(&key, &mut state).await,
            Err(_) => {
                if shared.retire(&key, generation, &rx) {
                    break;
                }
            }
        }
    }
    debug!("mailbox retired");
}
