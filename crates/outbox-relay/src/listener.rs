//! Optional LISTEN/NOTIFY fast path for waking idle workers.
//!
//! The outbox insert trigger raises a notification on `outbox_changed`;
//! this listener forwards each one to the workers' wake handle so an empty
//! poll ends early. Purely opportunistic: losing notifications only costs
//! latency, never correctness, since the poll loop still runs on its
//! interval. The notification payload is ignored.

use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgListener, PgPool};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};

/// Channel the outbox insert trigger notifies on.
pub const CHANGE_CHANNEL: &str = "outbox_changed";

/// Forwards outbox change notifications to a wake handle.
pub struct ChangeListener {
    listener: PgListener,
    wake: Arc<Notify>,
    cancellation_token: CancellationToken,
}

impl ChangeListener {
    /// Connects and subscribes to the change channel.
    ///
    /// # Errors
    ///
    /// Returns error if the listen connection cannot be established.
    pub async fn connect(
        pool: &PgPool,
        wake: Arc<Notify>,
        cancellation_token: CancellationToken,
    ) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool)
            .await
            .map_err(|e| RelayError::database(format!("listener connect failed: {e}")))?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .map_err(|e| RelayError::database(format!("listen on {CHANGE_CHANNEL} failed: {e}")))?;

        Ok(Self { listener, wake, cancellation_token })
    }

    /// Forwards notifications until cancelled.
    ///
    /// `PgListener` reconnects on its own; receive errors here are logged
    /// and retried after a short pause.
    pub async fn run(mut self) {
        info!(channel = CHANGE_CHANNEL, "change listener starting");

        loop {
            tokio::select! {
                () = self.cancellation_token.cancelled() => break,
                received = self.listener.recv() => {
                    match received {
                        Ok(_notification) => {
                            debug!("outbox change notification received");
                            self.wake.notify_waiters();
                        },
                        Err(e) => {
                            warn!(error = %e, "change listener receive failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        },
                    }
                },
            }
        }

        info!("change listener stopped");
    }
}
