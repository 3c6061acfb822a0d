//! Rehydration from snapshots versus full replay.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sequent_core::aggregate::AggregateRoot;
use sequent_core::snapshot::{Snapshot, SnapshotPolicy};
use sequent_core::store::SnapshotStore;
use sequent_engine::{Engine, Repository};
use sequent_test_support::account::{
    Account, AccountHandlers, Deposit, OpenAccount, Withdraw, account_registry,
};
use sequent_test_support::{TestStores, eventually};
use uuid::Uuid;

fn engine(stores: &TestStores, policy: SnapshotPolicy) -> Engine {
    stores
        .engine()
        .registry(account_registry(&AccountHandlers::new(), policy))
        .build()
        .unwrap()
}

fn replay_only(stores: &TestStores) -> Repository {
    Repository::new(
        stores.events.clone(),
        None,
        Arc::new(account_registry(&AccountHandlers::new(), SnapshotPolicy::Never)),
    )
}

async fn history(engine: &Engine, deposits: i64) -> Uuid {
    let id = Uuid::new_v4();
    engine.execute(OpenAccount::new(id, "ada")).await.unwrap();
    for amount in 1..=deposits {
        engine.execute(Deposit::new(id, amount)).await.unwrap();
    }
    id
}

async fn snapshot_version(stores: &TestStores, id: Uuid) -> Option<i64> {
    stores
        .snapshots
        .latest(id)
        .await
        .unwrap()
        .map(|snapshot| snapshot.version)
}

#[tokio::test]
async fn test_snapshots_follow_policy() {
    let stores = TestStores::new();
    let engine = engine(&stores, SnapshotPolicy::EveryNVersions(3));

    let id = history(&engine, 5).await;

    let mut latest = None;
    for _ in 0..100 {
        latest = snapshot_version(&stores, id).await;
        if latest == Some(6) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(latest, Some(6));
}

#[tokio::test]
async fn test_never_policy_writes_no_snapshots() {
    let stores = TestStores::new();
    let engine = engine(&stores, SnapshotPolicy::Never);

    let id = history(&engine, 5).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(snapshot_version(&stores, id).await, None);
}

#[tokio::test]
async fn test_snapshot_load_matches_full_replay() {
    // Arrange
    let stores = TestStores::new();
    let engine = engine(&stores, SnapshotPolicy::EveryNVersions(4));
    let id = history(&engine, 6).await;
    engine.execute(Withdraw::new(id, 5)).await.unwrap();
    let snapshots = stores.snapshots.clone();
    assert!(eventually(Duration::from_secs(1), || {
        // Version 4 crossed the boundary; version 8 did too.
        !snapshots.is_empty()
    })
    .await);

    // Act
    let from_snapshot = engine.repository().get::<Account>(id).await.unwrap();
    let replayed = replay_only(&stores).get::<Account>(id).await.unwrap();

    // Assert
    assert_eq!(from_snapshot.version(), 8);
    assert_eq!(from_snapshot.version(), replayed.version());
    assert_eq!(from_snapshot.state(), replayed.state());
    assert_eq!(replayed.balance(), 21 - 5);
}

#[tokio::test]
async fn test_load_starts_from_snapshot_and_replays_the_rest() {
    let stores = TestStores::new();
    let engine = engine(&stores, SnapshotPolicy::Never);
    let id = history(&engine, 3).await;
    // A snapshot at version 2 that disagrees with history proves it is used.
    stores
        .snapshots
        .store(Snapshot {
            aggregate_type: "account".to_owned(),
            aggregate_id: id,
            version: 2,
            payload: serde_json::json!({ "owner": "ada", "balance": 1000, "closed": false }),
            taken_at: Utc::now(),
        })
        .await
        .unwrap();

    let account = engine.repository().get::<Account>(id).await.unwrap();

    assert_eq!(account.version(), 4);
    assert_eq!(account.balance(), 1000 + 2 + 3);
}

#[tokio::test]
async fn test_corrupt_snapshot_falls_back_to_full_replay() {
    let stores = TestStores::new();
    let engine = engine(&stores, SnapshotPolicy::Never);
    let id = history(&engine, 3).await;
    stores
        .snapshots
        .store(Snapshot {
            aggregate_type: "account".to_owned(),
            aggregate_id: id,
            version: 3,
            payload: serde_json::json!("not an account"),
            taken_at: Utc::now(),
        })
        .await
        .unwrap();

    let account = engine.repository().get::<Account>(id).await.unwrap();

    assert_eq!(account.version(), 4);
    assert_eq!(account.balance(), 6);
}

#[tokio::test]
async fn test_snapshot_of_another_type_is_ignored() {
    let stores = TestStores::new();
    let engine = engine(&stores, SnapshotPolicy::Never);
    let id = history(&engine, 2).await;
    stores
        .snapshots
        .store(Snapshot {
            aggregate_type: "ledger".to_owned(),
            aggregate_id: id,
            version: 2,
            payload: serde_json::json!({ "owner": "x", "balance": 1000, "closed": false }),
            taken_at: Utc::now(),
        })
        .await
        .unwrap();

    let account = engine.repository().get::<Account>(id).await.unwrap();

    assert_eq!(account.balance(), 3);
}

#[tokio::test]
async fn test_commands_after_snapshot_continue_from_it() {
    let stores = TestStores::new();
    let engine = engine(&stores, SnapshotPolicy::EveryNVersions(2));
    let id = history(&engine, 3).await;
    let snapshots = stores.snapshots.clone();
    assert!(eventually(Duration::from_secs(1), || !snapshots.is_empty()).await);

    let result = engine.execute(Deposit::new(id, 10)).await.unwrap();

    assert_eq!(result.commits[0].version, 5);
    assert_eq!(result.result["balance"], 16);
}

#[tokio::test]
async fn test_unknown_aggregate_loads_as_none() {
    let stores = TestStores::new();
    let engine = engine(&stores, SnapshotPolicy::EveryNVersions(2));

    let loaded = engine.repository().load::<Account>(Uuid::new_v4()).await.unwrap();

    assert!(loaded.is_none());
}
