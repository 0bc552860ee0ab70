//! End-to-end relay scenarios against a real database.
//!
//! Each test runs a `RelayEngine` with a scripted publisher and asserts the
//! terminal row state the lease protocol guarantees.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use outbox_core::{EventId, EventStatus, LockToken, OutboxEvent, RealClock};
use outbox_relay::{PublishError, RelayConfig, RelayEngine, RetryPolicy};
use outbox_testing::{EventBuilder, MockPublisher, TestDb};

fn test_config() -> RelayConfig {
    RelayConfig {
        worker_count: 1,
        batch_size: 10,
        poll_interval: Duration::from_millis(50),
        concurrency: 4,
        lease: Duration::from_secs(3),
        heartbeat_interval: Duration::from_millis(500),
        default_max_retries: 5,
        retry_policy: RetryPolicy {
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            jitter_factor: 0.0,
        },
        reaper_enabled: true,
        reaper_interval: Duration::from_secs(1),
        shutdown_timeout: Duration::from_secs(3),
    }
}

async fn start_engine(
    db: &TestDb,
    config: RelayConfig,
    publisher: Arc<MockPublisher>,
) -> Result<RelayEngine> {
    let mut engine =
        RelayEngine::new(db.storage(), config, publisher, Arc::new(RealClock::new()))?;
    engine.start().await?;
    Ok(engine)
}

async fn wait_for_status(
    db: &TestDb,
    id: EventId,
    expected: EventStatus,
) -> Result<OutboxEvent> {
    let events = db.storage().outbox_events;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);

    loop {
        let row = events.find_by_id(id).await?.expect("event row should exist");
        if row.status == expected {
            return Ok(row);
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("event {id} stuck in {:?}, expected {expected:?}", row.status);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn happy_path_completes_event() -> Result<()> {
    let db = TestDb::new().await?;
    let publisher = Arc::new(MockPublisher::new());

    let event = EventBuilder::new()
        .event_type("OrderCreated")
        .payload(serde_json::json!({"id": 1}))
        .insert(&db.storage().outbox_events)
        .await?;

    let engine = start_engine(&db, test_config(), publisher.clone()).await?;
    let row = wait_for_status(&db, event.id, EventStatus::Completed).await?;

    assert_eq!(row.retry_count, 0);
    assert!(row.processed_at.is_some());
    assert!(row.locked_until.is_none());
    assert!(row.lock_token.is_none());
    assert_eq!(publisher.publish_count(event.tracking_id), 1);

    let stats = engine.stats().await;
    assert!(stats.events_claimed >= 1);
    assert!(stats.events_completed >= 1);

    engine.shutdown().await?;
    db.cleanup().await
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() -> Result<()> {
    let db = TestDb::new().await?;
    let publisher = Arc::new(MockPublisher::new());

    let event = EventBuilder::new().max_retries(3).insert(&db.storage().outbox_events).await?;
    publisher.script(
        event.tracking_id,
        vec![
            Err(PublishError::transient("timeout")),
            Err(PublishError::transient("timeout")),
            Ok(()),
        ],
    );

    let engine = start_engine(&db, test_config(), publisher.clone()).await?;
    let row = wait_for_status(&db, event.id, EventStatus::Completed).await?;

    assert_eq!(row.retry_count, 2);
    // The last failure before success stays recorded for diagnosis.
    assert_eq!(row.last_error.as_deref(), Some("timeout"));
    assert_eq!(publisher.publish_count(event.tracking_id), 3);

    engine.shutdown().await?;
    db.cleanup().await
}

#[tokio::test]
async fn exhausted_retries_dead_letter_the_event() -> Result<()> {
    let db = TestDb::new().await?;
    let publisher = Arc::new(MockPublisher::new());
    publisher.set_default_outcome(Err(PublishError::transient("schema invalid")));

    let event = EventBuilder::new().max_retries(2).insert(&db.storage().outbox_events).await?;

    let engine = start_engine(&db, test_config(), publisher.clone()).await?;
    let row = wait_for_status(&db, event.id, EventStatus::DeadLetter).await?;

    assert_eq!(row.retry_count, 2);
    assert_eq!(row.last_error.as_deref(), Some("schema invalid"));
    assert!(row.processed_at.is_some());
    assert_eq!(publisher.publish_count(event.tracking_id), 2);

    let stats = engine.stats().await;
    assert!(stats.events_dead_lettered >= 1);

    engine.shutdown().await?;
    db.cleanup().await
}

#[tokio::test]
async fn permanent_failure_dead_letters_immediately() -> Result<()> {
    let db = TestDb::new().await?;
    let publisher = Arc::new(MockPublisher::new());
    publisher.set_default_outcome(Err(PublishError::permanent("unroutable event")));

    let event = EventBuilder::new().max_retries(5).insert(&db.storage().outbox_events).await?;

    let engine = start_engine(&db, test_config(), publisher.clone()).await?;
    let row = wait_for_status(&db, event.id, EventStatus::DeadLetter).await?;

    assert_eq!(publisher.publish_count(event.tracking_id), 1, "no retries for permanent errors");
    assert_eq!(row.last_error.as_deref(), Some("unroutable event"));

    engine.shutdown().await?;
    db.cleanup().await
}

#[tokio::test]
async fn reaper_rescues_abandoned_lease() -> Result<()> {
    let db = TestDb::new().await?;
    let storage = db.storage();
    let publisher = Arc::new(MockPublisher::new());

    let event = EventBuilder::new().insert(&storage.outbox_events).await?;

    // A worker claims the event and dies: no heartbeat, no finalize.
    let dead_worker = LockToken::generate();
    let claimed = storage
        .outbox_events
        .claim_batch(1, Duration::from_millis(300), dead_worker)
        .await?;
    assert_eq!(claimed.len(), 1);

    let engine = start_engine(&db, test_config(), publisher.clone()).await?;
    let row = wait_for_status(&db, event.id, EventStatus::Completed).await?;

    assert_eq!(row.retry_count, 0, "reaping is not a failure");
    assert_eq!(publisher.publish_count(event.tracking_id), 1);

    // The dead worker's token fences every late mutation.
    assert!(!storage.outbox_events.mark_completed(event.id, dead_worker).await?);

    engine.shutdown().await?;
    db.cleanup().await
}

#[tokio::test]
async fn stolen_lease_is_abandoned_without_mutation() -> Result<()> {
    let db = TestDb::new().await?;
    let storage = db.storage();
    let publisher = Arc::new(MockPublisher::new());
    publisher.set_delay(Duration::from_millis(1500));

    let event = EventBuilder::new().insert(&storage.outbox_events).await?;

    let mut config = test_config();
    config.reaper_enabled = false;
    let engine = start_engine(&db, config, publisher.clone()).await?;

    // Let the worker claim and enter the slow publish.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let row = storage.outbox_events.find_by_id(event.id).await?.expect("row should exist");
    assert_eq!(row.status, EventStatus::Processing);

    // Another actor takes over the row; the worker's next heartbeat fails
    // and it must abandon the event without touching it.
    let foreign_token = LockToken::generate();
    sqlx::query("UPDATE outbox SET lock_token = $1 WHERE id = $2")
        .bind(foreign_token)
        .bind(event.id)
        .execute(db.pool())
        .await?;

    tokio::time::sleep(Duration::from_millis(2000)).await;

    let row = storage.outbox_events.find_by_id(event.id).await?.expect("row should exist");
    assert_eq!(row.status, EventStatus::Processing, "abandoned, not finalized");
    assert_eq!(row.lock_token, Some(foreign_token));
    assert!(row.processed_at.is_none());

    let stats = engine.stats().await;
    assert!(stats.leases_lost >= 1);

    engine.shutdown().await?;
    db.cleanup().await
}

#[tokio::test]
async fn relays_batches_across_many_events_at_least_once() -> Result<()> {
    let db = TestDb::new().await?;
    let storage = db.storage();
    let publisher = Arc::new(MockPublisher::new());

    let mut inserted = Vec::new();
    for i in 0..25 {
        let event = EventBuilder::new()
            .aggregate_id(format!("order-{i}"))
            .payload(serde_json::json!({"order_id": i}))
            .insert(&storage.outbox_events)
            .await?;
        inserted.push(event);
    }

    let mut config = test_config();
    config.worker_count = 2;
    let engine = start_engine(&db, config, publisher.clone()).await?;

    for event in &inserted {
        wait_for_status(&db, event.id, EventStatus::Completed).await?;
    }

    for event in &inserted {
        assert!(
            publisher.publish_count(event.tracking_id) >= 1,
            "every event is published at least once"
        );
    }
    assert_eq!(storage.outbox_events.completed_count().await?, 25);
    assert_eq!(storage.outbox_events.pending_count().await?, 0);

    engine.shutdown().await?;
    db.cleanup().await
}

#[tokio::test]
async fn graceful_shutdown_without_work() -> Result<()> {
    let db = TestDb::new().await?;
    let publisher = Arc::new(MockPublisher::new());

    let engine = start_engine(&db, test_config(), publisher).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.shutdown().await?;

    db.cleanup().await
}

#[tokio::test]
async fn invalid_config_rejected_at_engine_construction() -> Result<()> {
    let db = TestDb::new().await?;
    let publisher = Arc::new(MockPublisher::new());

    let config = RelayConfig {
        heartbeat_interval: Duration::from_secs(20),
        lease: Duration::from_secs(30),
        ..test_config()
    };
    let result =
        RelayEngine::new(db.storage(), config, publisher, Arc::new(RealClock::new()));
    assert!(result.is_err());

    db.cleanup().await
}
