//! Integration test for the LISTEN/NOTIFY wake path.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use outbox_relay::ChangeListener;
use outbox_testing::{EventBuilder, TestDb};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn insert_trigger_wakes_listener() -> Result<()> {
    let db = TestDb::new().await?;
    let storage = db.storage();

    let wake = Arc::new(Notify::new());
    let cancellation_token = CancellationToken::new();
    let listener =
        ChangeListener::connect(db.pool(), wake.clone(), cancellation_token.clone()).await?;
    let listener_handle = tokio::spawn(listener.run());

    // Register a waiter before the insert so the notification cannot race
    // past it.
    let waiter = {
        let wake = wake.clone();
        tokio::spawn(async move { wake.notified().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    EventBuilder::new().insert(&storage.outbox_events).await?;

    tokio::time::timeout(Duration::from_secs(3), waiter)
        .await
        .expect("insert should wake the listener")
        .expect("waiter task should not panic");

    cancellation_token.cancel();
    listener_handle.await.expect("listener task should join");

    db.cleanup().await
}
