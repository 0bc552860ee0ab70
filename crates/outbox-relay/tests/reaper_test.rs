//! Integration tests for stale-lease recovery.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use outbox_core::{EventStatus, LockToken, RealClock};
use outbox_relay::Reaper;
use outbox_testing::{EventBuilder, TestDb};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn sweep_recovers_only_expired_leases() -> Result<()> {
    let db = TestDb::new().await?;
    let storage = db.storage();
    let events = storage.outbox_events.clone();

    let expired = EventBuilder::new().insert(&events).await?;
    let live = EventBuilder::new().insert(&events).await?;

    let claimed = events.claim_batch(1, Duration::from_millis(200), LockToken::generate()).await?;
    assert_eq!(claimed[0].id, expired.id);
    let claimed = events.claim_batch(1, Duration::from_secs(30), LockToken::generate()).await?;
    assert_eq!(claimed[0].id, live.id);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let reaper = Reaper::new(
        storage.clone(),
        Duration::from_secs(1),
        CancellationToken::new(),
        Arc::new(RealClock::new()),
    );
    reaper.sweep_once().await;

    let row = events.find_by_id(expired.id).await?.expect("row should exist");
    assert_eq!(row.status, EventStatus::Pending);
    assert!(row.lock_token.is_none());

    let row = events.find_by_id(live.id).await?.expect("row should exist");
    assert_eq!(row.status, EventStatus::Processing);

    db.cleanup().await
}

#[tokio::test]
async fn run_loop_sweeps_periodically_until_cancelled() -> Result<()> {
    let db = TestDb::new().await?;
    let storage = db.storage();
    let events = storage.outbox_events.clone();

    let event = EventBuilder::new().insert(&events).await?;
    events.claim_batch(1, Duration::from_millis(100), LockToken::generate()).await?;

    let cancellation_token = CancellationToken::new();
    let reaper = Reaper::new(
        storage.clone(),
        Duration::from_millis(150),
        cancellation_token.clone(),
        Arc::new(RealClock::new()),
    );
    let handle = tokio::spawn(async move { reaper.run().await });

    // Within a couple of sweep intervals the expired lease is back.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let row = events.find_by_id(event.id).await?.expect("row should exist");
        if row.status == EventStatus::Pending {
            break;
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "reaper never recovered the row");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancellation_token.cancel();
    handle.await.expect("reaper task should join");

    db.cleanup().await
}
