//! Periodic recovery of abandoned leases.
//!
//! A `PROCESSING` row whose lease deadline has passed belongs to a worker
//! that crashed, lost its partition, or was shut down mid-flight. The
//! reaper returns such rows to `PENDING` without touching `retry_count`:
//! reaping is neither a success nor an application-level failure.

use std::{sync::Arc, time::Duration};

use outbox_core::{storage::Storage, Clock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Periodic stale-lease recovery task.
///
/// Runs in-process next to the worker pool by default; the same type can be
/// driven from a dedicated daemon. The sweep interval must be at most half
/// the lease so an abandoned event is recoverable within one lease
/// duration.
pub struct Reaper {
    storage: Storage,
    interval: Duration,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl Reaper {
    /// Creates a reaper sweeping every `interval`.
    pub fn new(
        storage: Storage,
        interval: Duration,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, interval, cancellation_token, clock }
    }

    /// Sweeps until cancelled.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "reaper starting");

        loop {
            tokio::select! {
                () = self.cancellation_token.cancelled() => break,
                () = self.clock.sleep(self.interval) => {
                    self.sweep_once().await;
                },
            }
        }

        info!("reaper stopped");
    }

    /// One recovery sweep; failures are logged and the next tick retries.
    pub async fn sweep_once(&self) {
        match self.storage.outbox_events.recover_stale().await {
            Ok(0) => debug!("no stale leases to recover"),
            Ok(recovered) => {
                warn!(recovered, "recovered events from expired leases");
            },
            Err(e) => {
                error!(error = %e, "stale lease recovery failed");
            },
        }
    }
}
