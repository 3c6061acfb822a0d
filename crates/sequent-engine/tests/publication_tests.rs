//! Ordered at-least-once publication: subscribers, restarts, transport
//! redelivery and process managers.

use std::sync::Arc;
use std::time::Duration;

use sequent_core::snapshot::SnapshotPolicy;
use sequent_core::store::{CommandStore, EventStore, WatermarkStore};
use sequent_engine::{
    Engine, EngineBuilder, InboundConsumer, Publisher, TransportSubscriber, derive_command_id,
};
use sequent_event_store::InMemoryWatermarkStore;
use sequent_test_support::account::{
    Account, AccountHandlers, Deposit, OpenAccount, WelcomeBonus, account_registry,
};
use sequent_test_support::{
    InMemoryTransport, RecordingSubscriber, TestStores, eventually, fast_config,
};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

fn with_accounts(builder: EngineBuilder) -> Engine {
    builder
        .registry(account_registry(&AccountHandlers::new(), SnapshotPolicy::Never))
        .build()
        .unwrap()
}

async fn history(engine: &Engine, deposits: i64) -> Uuid {
    let id = Uuid::new_v4();
    engine.execute(OpenAccount::new(id, "ada")).await.unwrap();
    for amount in 1..=deposits {
        engine.execute(Deposit::new(id, amount)).await.unwrap();
    }
    id
}

async fn wait_for_watermark(publisher: &Publisher, group: &str, id: Uuid, version: i64) -> bool {
    for _ in 0..400 {
        if publisher.watermark(group, id).await.unwrap() >= version {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// A consumer-side publisher fed by `transport`, with its own watermarks.
async fn consumer(
    transport: &InMemoryTransport,
    stores: Option<&TestStores>,
) -> (Publisher, Arc<RecordingSubscriber>) {
    let publisher = Publisher::new(
        Arc::new(InMemoryWatermarkStore::new()),
        stores.map(|s| s.events.clone() as Arc<dyn EventStore>),
        &fast_config(),
    );
    let projection = Arc::new(RecordingSubscriber::new("projection"));
    publisher.subscribe(projection.clone()).unwrap();
    InboundConsumer::new(publisher.clone())
        .attach(transport, "accounts")
        .await
        .unwrap();
    (publisher, projection)
}

// --- in-process subscribers ---

#[tokio::test]
async fn test_subscriber_receives_streams_in_version_order() {
    let stores = TestStores::new();
    let ledger = Arc::new(RecordingSubscriber::new("ledger"));
    let engine = with_accounts(stores.engine().subscriber(ledger.clone()));

    let a = history(&engine, 4).await;
    let b = history(&engine, 2).await;

    assert!(ledger.wait_for(8, WAIT).await);
    assert_eq!(ledger.versions_for(a), vec![1, 2, 3, 4, 5]);
    assert_eq!(ledger.versions_for(b), vec![1, 2, 3]);
    assert!(wait_for_watermark(engine.publisher(), "ledger", a, 5).await);
}

#[tokio::test]
async fn test_failed_deliveries_are_retried_in_order() {
    let stores = TestStores::new();
    let ledger = Arc::new(RecordingSubscriber::new("ledger").failing_first(4));
    let engine = with_accounts(stores.engine().subscriber(ledger.clone()));

    let id = history(&engine, 3).await;

    assert!(ledger.wait_for(4, WAIT).await);
    assert_eq!(ledger.versions_for(id), vec![1, 2, 3, 4]);
    assert!(ledger.attempts() >= 8);
}

#[tokio::test]
async fn test_restart_resumes_after_the_watermark() {
    // Arrange: the first process delivers three streams, then two more are
    // committed while no subscriber is running.
    let stores = TestStores::new();
    let first_ledger = Arc::new(RecordingSubscriber::new("ledger"));
    let first = with_accounts(stores.engine().subscriber(first_ledger.clone()));
    let id = history(&first, 2).await;
    assert!(wait_for_watermark(first.publisher(), "ledger", id, 3).await);
    first.shutdown();

    let offline = with_accounts(stores.engine());
    offline.execute(Deposit::new(id, 10)).await.unwrap();
    offline.execute(Deposit::new(id, 20)).await.unwrap();

    // Act
    let second_ledger = Arc::new(RecordingSubscriber::new("ledger"));
    let second = with_accounts(stores.engine().subscriber(second_ledger.clone()));
    let queued = second.resume().await.unwrap();

    // Assert
    assert_eq!(queued, 2);
    assert!(second_ledger.wait_for(2, WAIT).await);
    assert_eq!(second_ledger.versions_for(id), vec![4, 5]);
    assert_eq!(stores.watermarks.load("ledger", id).await.unwrap(), 5);
}

#[tokio::test]
async fn test_late_subscriber_catches_up_from_store() {
    let stores = TestStores::new();
    let engine = with_accounts(stores.engine());
    let id = history(&engine, 2).await;
    let audit = Arc::new(RecordingSubscriber::new("audit"));

    engine.subscribe(audit.clone()).unwrap();
    engine.catch_up(id).await.unwrap();
    engine.execute(Deposit::new(id, 3)).await.unwrap();

    assert!(audit.wait_for(4, WAIT).await);
    assert_eq!(audit.versions_for(id), vec![1, 2, 3, 4]);
}

// --- transport ---

#[tokio::test]
async fn test_transport_redelivery_below_watermark_is_dropped() {
    // Arrange
    let stores = TestStores::new();
    let transport = Arc::new(InMemoryTransport::new());
    let (_consumer, projection) = consumer(&transport, None).await;
    let engine = with_accounts(stores.engine().subscriber(Arc::new(TransportSubscriber::new(
        "outbox",
        "accounts",
        transport.clone(),
    ))));
    let id = history(&engine, 2).await;
    assert!(projection.wait_for(3, WAIT).await);

    // Act: the broker hands everything over again.
    transport.redeliver_all().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert
    assert_eq!(projection.versions_for(id), vec![1, 2, 3]);
    assert_eq!(transport.published_keys(), vec![id.to_string(); 3]);
}

#[tokio::test]
async fn test_out_of_order_transport_delivery_is_reordered() {
    let stores = TestStores::new();
    let transport = Arc::new(InMemoryTransport::new());
    let (_consumer, projection) = consumer(&transport, None).await;
    let engine = with_accounts(stores.engine().subscriber(Arc::new(TransportSubscriber::new(
        "outbox",
        "accounts",
        transport.clone(),
    ))));
    transport.pause();
    let id = history(&engine, 2).await;
    assert!(eventually(WAIT, || transport.published_keys().len() == 3).await);

    transport.release_reversed().await.unwrap();

    assert!(projection.wait_for(3, WAIT).await);
    assert_eq!(projection.versions_for(id), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_consumer_fills_gaps_from_event_store() {
    let stores = TestStores::new();
    let transport = Arc::new(InMemoryTransport::new());
    let (_consumer, projection) = consumer(&transport, Some(&stores)).await;
    let engine = with_accounts(stores.engine().subscriber(Arc::new(TransportSubscriber::new(
        "outbox",
        "accounts",
        transport.clone(),
    ))));
    transport.pause();
    let id = history(&engine, 2).await;
    assert!(eventually(WAIT, || transport.published_keys().len() == 3).await);

    transport.release_reversed().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(projection.versions_for(id), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_broker_outage_is_retried() {
    let stores = TestStores::new();
    let transport = Arc::new(InMemoryTransport::new());
    transport.fail_next(3);
    let (_consumer, projection) = consumer(&transport, None).await;
    let engine = with_accounts(stores.engine().subscriber(Arc::new(TransportSubscriber::new(
        "outbox",
        "accounts",
        transport.clone(),
    ))));

    let id = history(&engine, 1).await;

    assert!(projection.wait_for(2, WAIT).await);
    assert_eq!(projection.versions_for(id), vec![1, 2]);
}

// --- process managers ---

#[tokio::test]
async fn test_process_manager_follow_up_applies_once() {
    // Arrange
    let stores = TestStores::new();
    let engine = with_accounts(stores.engine());
    engine
        .register_process_manager(WelcomeBonus { amount: 5 })
        .unwrap();
    let id = Uuid::new_v4();
    engine.execute(OpenAccount::new(id, "ada")).await.unwrap();
    assert!(wait_for_watermark(engine.publisher(), "welcome-bonus", id, 2).await);
    let opened = stores.events.streams_for(id).remove(0);

    // Act: a second process with no watermarks sees the history again.
    let replica = with_accounts(
        stores
            .engine()
            .watermark_store(Arc::new(InMemoryWatermarkStore::new())),
    );
    replica
        .register_process_manager(WelcomeBonus { amount: 5 })
        .unwrap();
    replica.resume().await.unwrap();
    assert!(wait_for_watermark(replica.publisher(), "welcome-bonus", id, 2).await);

    // Assert
    let account = engine.repository().get::<Account>(id).await.unwrap();
    assert_eq!(account.balance(), 5);
    assert_eq!(stores.events.streams_for(id).len(), 2);
    let bonus_id = derive_command_id(&opened, "welcome-bonus");
    assert!(stores.commands.get(bonus_id).await.unwrap().is_some());
}
