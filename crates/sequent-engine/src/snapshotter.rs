//! Background snapshot writer.

use std::sync::Arc;

use sequent_core::snapshot::Snapshot;
use sequent_core::store::SnapshotStore;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Hands snapshots to a background task so that writing them never delays
/// a command. When the queue is full the snapshot is dropped; the next one
/// the policy asks for will catch up.
#[derive(Debug, Clone)]
pub struct Snapshotter {
    tx: Option<mpsc::Sender<Snapshot>>,
}

impl Snapshotter {
    /// Spawns the writer task. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn spawn(store: Arc<dyn SnapshotStore>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Snapshot>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                let aggregate_id = snapshot.aggregate_id;
                let version = snapshot.version;
                match store.store(snapshot).await {
                    Ok(()) => debug!(%aggregate_id, version, "snapshot stored"),
                    Err(err) => warn!(%aggregate_id, version, error = %err, "failed to store snapshot"),
                }
            }
        });
        Self { tx: Some(tx) }
    }

    /// A snapshotter that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queues a snapshot. Returns `false` if it was dropped.
    pub fn offer(&self, snapshot: Snapshot) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(snapshot) {
            Ok(()) => true,
            Err(TrySendError::Full(snapshot)) => {
                warn!(
                    aggregate_id = %snapshot.aggregate_id,
                    version = snapshot.version,
                    "snapshot queue full; dropping snapshot"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use sequent_core::error::EngineError;
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use uuid::Uuid;

    use super::*;

    #[derive(Default)]
    struct GatedStore {
        gate: Notify,
        stored: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl SnapshotStore for GatedStore {
        async fn store(&self, snapshot: Snapshot) -> Result<(), EngineError> {
            self.gate.notified().await;
            self.stored.lock().unwrap().push(snapshot.version);
            Ok(())
        }

        async fn latest(&self, _aggregate_id: Uuid) -> Result<Option<Snapshot>, EngineError> {
            Ok(None)
        }
    }

    fn snapshot(version: i64) -> Snapshot {
        Snapshot {
            aggregate_type: "test".to_owned(),
            aggregate_id: Uuid::new_v4(),
            version,
            payload: serde_json::Value::Null,
            taken_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_offer_drops_when_queue_is_full() {
        let store = Arc::new(GatedStore::default());
        let snapshotter = Snapshotter::spawn(store.clone(), 1);

        // The writer takes the first snapshot and blocks on the gate, the
        // second fills the queue, the third has nowhere to go.
        assert!(snapshotter.offer(snapshot(1)));
        tokio::task::yield_now().await;
        let mut accepted = 1;
        for version in 2..=4 {
            if snapshotter.offer(snapshot(version)) {
                accepted += 1;
            }
        }

        assert!(accepted < 4);
    }

    #[tokio::test]
    async fn test_disabled_snapshotter_accepts_nothing() {
        assert!(!Snapshotter::disabled().offer(snapshot(1)));
    }
}
