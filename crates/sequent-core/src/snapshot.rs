//! Snapshots and the policy deciding when to take them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Compacted aggregate state as of `version`. Advisory only: the event log is
/// always authoritative and a snapshot may be deleted at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The aggregate type name.
    pub aggregate_type: String,
    /// The aggregate identifier.
    pub aggregate_id: Uuid,
    /// Version of the state held in `payload`.
    pub version: i64,
    /// Opaque state captured by the aggregate.
    pub payload: serde_json::Value,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Pure predicate deciding whether a commit should be followed by a
/// snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotPolicy {
    /// Never snapshot.
    #[default]
    Never,
    /// Snapshot whenever a commit reaches or crosses a multiple of `n`.
    EveryNVersions(u32),
}

impl SnapshotPolicy {
    /// Returns `true` when a commit that moved the aggregate from `previous`
    /// to `current` should be snapshotted. A multi-event commit that jumps
    /// over a boundary still counts.
    #[must_use]
    pub fn should_snapshot(self, previous: i64, current: i64) -> bool {
        match self {
            Self::Never => false,
            Self::EveryNVersions(0) => false,
            Self::EveryNVersions(n) => {
                let n = i64::from(n);
                current > previous && current / n > previous / n
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_n_versions_fires_on_multiple() {
        let policy = SnapshotPolicy::EveryNVersions(3);

        assert!(!policy.should_snapshot(0, 1));
        assert!(!policy.should_snapshot(1, 2));
        assert!(policy.should_snapshot(2, 3));
        assert!(!policy.should_snapshot(3, 4));
    }

    #[test]
    fn test_every_n_versions_fires_when_batch_crosses_boundary() {
        let policy = SnapshotPolicy::EveryNVersions(5);

        assert!(policy.should_snapshot(4, 7));
        assert!(!policy.should_snapshot(5, 9));
    }

    #[test]
    fn test_never_and_zero_do_not_fire() {
        assert!(!SnapshotPolicy::Never.should_snapshot(0, 100));
        assert!(!SnapshotPolicy::EveryNVersions(0).should_snapshot(0, 100));
    }
}
