//! Integration tests for the `PostgreSQL` stores.

use std::collections::BTreeMap;

use chrono::Utc;
use sequent_core::command::{CommandOutcome, HandledCommand, Rejection};
use sequent_core::error::EngineError;
use sequent_core::event::{EventStream, RecordedEvent};
use sequent_core::snapshot::Snapshot;
use sequent_core::store::{
    AppendOutcome, CommandStore, EventStore, InsertOutcome, SnapshotStore, WatermarkStore,
};
use sequent_event_store::{PgCommandStore, PgEventStore, PgSnapshotStore, PgWatermarkStore};
use sqlx::PgPool;
use uuid::Uuid;

/// Helper to build an `EventStream` with sensible defaults.
fn make_stream(aggregate_id: Uuid, expected_version: i64, count: i64) -> EventStream {
    EventStream {
        aggregate_id,
        aggregate_type: "test".to_string(),
        expected_version,
        command_id: Uuid::new_v4(),
        correlation_id: Uuid::new_v4(),
        timestamp: Utc::now(),
        events: (1..=count)
            .map(|i| RecordedEvent {
                event_id: Uuid::new_v4(),
                event_type: "TestEvent".to_string(),
                sequence_number: expected_version + i,
                payload: serde_json::json!({"key": "value", "i": i}),
            })
            .collect(),
        items: BTreeMap::from([("tenant".to_string(), "acme".to_string())]),
    }
}

// --- append + query round-trip ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_append_and_query_single_stream(pool: PgPool) {
    let store = PgEventStore::new(pool);
    let aggregate_id = Uuid::new_v4();
    let stream = make_stream(aggregate_id, 0, 2);

    let outcome = store.append_stream(stream.clone()).await.unwrap();
    assert!(matches!(outcome, AppendOutcome::Persisted(_)));

    let loaded = store.query(aggregate_id, 1, i64::MAX).await.unwrap();
    assert_eq!(loaded.len(), 1);

    let s = &loaded[0];
    assert_eq!(s.command_id, stream.command_id);
    assert_eq!(s.version(), 2);
    assert_eq!(s.events, stream.events);
    assert_eq!(s.items, stream.items);
    // PostgreSQL TIMESTAMPTZ has microsecond precision.
    assert_eq!(
        s.timestamp.timestamp_micros(),
        stream.timestamp.timestamp_micros()
    );
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_query_preserves_version_order_and_bounds(pool: PgPool) {
    let store = PgEventStore::new(pool);
    let aggregate_id = Uuid::new_v4();

    store.append_stream(make_stream(aggregate_id, 0, 1)).await.unwrap();
    store.append_stream(make_stream(aggregate_id, 1, 2)).await.unwrap();
    store.append_stream(make_stream(aggregate_id, 3, 1)).await.unwrap();

    let all = store.query(aggregate_id, 1, i64::MAX).await.unwrap();
    let versions: Vec<i64> = all.iter().map(EventStream::version).collect();
    assert_eq!(versions, vec![1, 3, 4]);

    let tail = store.query(aggregate_id, 2, 3).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].expected_version, 1);
}

// --- concurrency ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_stale_expected_version_is_a_conflict(pool: PgPool) {
    let store = PgEventStore::new(pool);
    let aggregate_id = Uuid::new_v4();

    store.append_stream(make_stream(aggregate_id, 0, 2)).await.unwrap();

    // Versions 1-1 are taken; the head is at 2.
    let result = store.append_stream(make_stream(aggregate_id, 0, 1)).await;

    match result {
        Err(EngineError::ConcurrencyConflict {
            aggregate_id: conflict_agg_id,
            expected,
            actual,
        }) => {
            assert_eq!(conflict_agg_id, aggregate_id);
            assert_eq!(expected, 0);
            assert_eq!(actual, 2);
        }
        other => panic!("expected ConcurrencyConflict, got {other:?}"),
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_overlapping_range_is_a_conflict(pool: PgPool) {
    let store = PgEventStore::new(pool);
    let aggregate_id = Uuid::new_v4();

    store.append_stream(make_stream(aggregate_id, 0, 2)).await.unwrap();

    // Starts at 2 and ends at 4: no key collides with (0 -> 2) but the head
    // moved past the expected version.
    let result = store.append_stream(make_stream(aggregate_id, 1, 3)).await;

    assert!(matches!(
        result,
        Err(EngineError::ConcurrencyConflict { actual: 2, .. })
    ));
}

// --- idempotency ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_same_command_returns_stored_stream(pool: PgPool) {
    let store = PgEventStore::new(pool);
    let aggregate_id = Uuid::new_v4();
    let first = make_stream(aggregate_id, 0, 1);
    store.append_stream(first.clone()).await.unwrap();

    let mut retry = make_stream(aggregate_id, 1, 1);
    retry.command_id = first.command_id;
    let outcome = store.append_stream(retry).await.unwrap();

    match outcome {
        AppendOutcome::Duplicate(existing) => {
            assert_eq!(existing.command_id, first.command_id);
            assert_eq!(existing.version(), 1);
        }
        other => panic!("expected Duplicate, got {other:?}"),
    }
    assert_eq!(store.query(aggregate_id, 1, i64::MAX).await.unwrap().len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_concurrent_appends_of_same_command_yield_one_stream(pool: PgPool) {
    let store = PgEventStore::new(pool);
    let aggregate_id = Uuid::new_v4();
    store.append_stream(make_stream(aggregate_id, 0, 1)).await.unwrap();
    let stream = make_stream(aggregate_id, 1, 2);

    let (left, right) = tokio::join!(
        store.append_stream(stream.clone()),
        store.append_stream(stream.clone())
    );

    let outcomes = [left.unwrap(), right.unwrap()];
    let persisted = outcomes
        .iter()
        .filter(|o| matches!(o, AppendOutcome::Persisted(_)))
        .count();
    assert_eq!(persisted, 1);
    for outcome in &outcomes {
        if let AppendOutcome::Duplicate(existing) = outcome {
            assert_eq!(existing.command_id, stream.command_id);
            assert_eq!(existing.version(), 3);
        }
    }
    assert_eq!(store.query(aggregate_id, 1, i64::MAX).await.unwrap().len(), 2);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_batched_append_partitions_results(pool: PgPool) {
    let store = PgEventStore::new(pool);
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let committed = make_stream(a, 0, 1);
    store.append_stream(committed.clone()).await.unwrap();

    let mut replayed = make_stream(a, 1, 1);
    replayed.command_id = committed.command_id;

    let result = store
        .append(vec![replayed, make_stream(a, 0, 1), make_stream(b, 0, 1)])
        .await
        .unwrap();

    assert_eq!(result.persisted.len(), 1);
    assert_eq!(result.persisted[0].aggregate_id, b);
    assert_eq!(result.duplicate_version.len(), 1);
    assert_eq!(result.duplicate_command.len(), 1);
    assert_eq!(result.duplicate_command[0].command_id, committed.command_id);

    let mut ids = store.list_aggregate_ids().await.unwrap();
    ids.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(ids, expected);
}

// --- handled commands ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_command_store_keeps_first_outcome(pool: PgPool) {
    let store = PgCommandStore::new(pool);
    let command_id = Uuid::new_v4();
    let handled = HandledCommand {
        command_id,
        aggregate_id: Uuid::new_v4(),
        command_type: "account.withdraw".to_string(),
        outcome: CommandOutcome::Rejected(Rejection::new("insufficient_funds", "balance 0")),
        handled_at: Utc::now(),
    };

    assert_eq!(
        store.try_insert(handled.clone()).await.unwrap(),
        InsertOutcome::Inserted
    );

    let mut second = handled.clone();
    second.outcome = CommandOutcome::Succeeded {
        commits: Vec::new(),
        result: serde_json::Value::Null,
    };
    match store.try_insert(second).await.unwrap() {
        InsertOutcome::AlreadyExists(existing) => assert_eq!(existing.outcome, handled.outcome),
        InsertOutcome::Inserted => panic!("expected AlreadyExists"),
    }
}

// --- snapshots and watermarks ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_snapshot_store_keeps_newest(pool: PgPool) {
    let store = PgSnapshotStore::new(pool);
    let aggregate_id = Uuid::new_v4();
    let snapshot = |version| Snapshot {
        aggregate_type: "test".to_string(),
        aggregate_id,
        version,
        payload: serde_json::json!({"balance": version * 10}),
        taken_at: Utc::now(),
    };

    store.store(snapshot(6)).await.unwrap();
    store.store(snapshot(3)).await.unwrap();

    let latest = store.latest(aggregate_id).await.unwrap().unwrap();
    assert_eq!(latest.version, 6);
    assert_eq!(latest.payload, serde_json::json!({"balance": 60}));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_watermark_is_monotonic(pool: PgPool) {
    let store = PgWatermarkStore::new(pool);
    let aggregate_id = Uuid::new_v4();

    assert_eq!(store.load("ledger", aggregate_id).await.unwrap(), 0);
    store.advance("ledger", aggregate_id, 5).await.unwrap();
    store.advance("ledger", aggregate_id, 3).await.unwrap();

    assert_eq!(store.load("ledger", aggregate_id).await.unwrap(), 5);
}
