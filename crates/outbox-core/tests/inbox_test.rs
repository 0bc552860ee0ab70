//! Integration tests for consumer-side deduplication.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use outbox_core::{IdempotentExecutor, Outcome, TrackingId};
use outbox_testing::TestDb;

#[tokio::test]
async fn mark_processed_true_exactly_once() -> Result<()> {
    let db = TestDb::new().await?;
    let inbox = db.storage().inbox;

    let tracking_id = TrackingId::new();
    assert!(!inbox.is_processed(tracking_id).await?);

    assert!(inbox.mark_processed(tracking_id, "billing-svc").await?);
    assert!(!inbox.mark_processed(tracking_id, "billing-svc").await?);
    assert!(inbox.is_processed(tracking_id).await?);

    // A different consumer keeps its own deduplication scope.
    assert!(inbox.mark_processed(tracking_id, "email-svc").await?);

    db.cleanup().await
}

#[tokio::test]
async fn concurrent_markers_race_safely() -> Result<()> {
    let db = TestDb::new().await?;
    let inbox = db.storage().inbox;

    let tracking_id = TrackingId::new();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let inbox = inbox.clone();
        handles.push(tokio::spawn(async move { inbox.mark_processed(tracking_id, "svc").await }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.expect("marker task should not panic")? {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one caller wins the mark");
    assert!(inbox.is_processed(tracking_id).await?);

    db.cleanup().await
}

#[tokio::test]
async fn get_record_returns_consumer_and_instant() -> Result<()> {
    let db = TestDb::new().await?;
    let inbox = db.storage().inbox;

    let tracking_id = TrackingId::new();
    assert!(inbox.get_record(tracking_id).await?.is_none());

    inbox.mark_processed(tracking_id, "billing-svc").await?;
    let record = inbox.get_record(tracking_id).await?.expect("record should exist");
    assert_eq!(record.tracking_id, tracking_id);
    assert_eq!(record.consumer_id, "billing-svc");
    assert!(record.processed_at <= Utc::now());

    db.cleanup().await
}

#[tokio::test]
async fn purge_removes_only_expired_records() -> Result<()> {
    let db = TestDb::new().await?;
    let inbox = db.storage().inbox;

    let old = TrackingId::new();
    let fresh = TrackingId::new();
    inbox.mark_processed(old, "svc").await?;
    inbox.mark_processed(fresh, "svc").await?;

    // Age the first record artificially.
    sqlx::query("UPDATE inbox SET processed_at = NOW() - INTERVAL '40 days' WHERE tracking_id = $1")
        .bind(old)
        .execute(db.pool())
        .await?;

    let purged = inbox.purge_older_than(Utc::now() - chrono::Duration::days(30)).await?;
    assert_eq!(purged, 1);
    assert!(!inbox.is_processed(old).await?);
    assert!(inbox.is_processed(fresh).await?);

    db.cleanup().await
}

#[tokio::test]
async fn idempotent_executor_runs_once() -> Result<()> {
    let db = TestDb::new().await?;
    let executor = IdempotentExecutor::new(db.storage().inbox, "billing-svc");

    let tracking_id = TrackingId::new();

    let first = executor.execute(tracking_id, || async { 42 }).await?;
    assert_eq!(first, Outcome::Executed(42));

    let second = executor.execute(tracking_id, || async { 42 }).await?;
    assert_eq!(second, Outcome::Skipped);

    db.cleanup().await
}

#[tokio::test]
async fn idempotent_executor_keeps_mark_on_operation_failure() -> Result<()> {
    let db = TestDb::new().await?;
    let storage = db.storage();
    let executor = IdempotentExecutor::new(storage.inbox.clone(), "billing-svc");

    let tracking_id = TrackingId::new();

    let outcome = executor
        .execute(tracking_id, || async { Err::<(), _>(anyhow::anyhow!("downstream down")) })
        .await?;
    assert!(matches!(outcome, Outcome::Executed(Err(_))));

    // The mark survives the failure; the operation is not retried here.
    assert!(storage.inbox.is_processed(tracking_id).await?);
    let retry = executor.execute(tracking_id, || async { Ok::<(), anyhow::Error>(()) }).await?;
    assert!(matches!(retry, Outcome::Skipped));

    db.cleanup().await
}

#[tokio::test]
async fn racing_executors_yield_one_execution() -> Result<()> {
    let db = TestDb::new().await?;
    let executor = Arc::new(IdempotentExecutor::new(db.storage().inbox, "svc"));

    let tracking_id = TrackingId::new();
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let executor = executor.clone();
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            executor
                .execute(tracking_id, || async {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("executor task should not panic")?;
    }

    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);

    db.cleanup().await
}
