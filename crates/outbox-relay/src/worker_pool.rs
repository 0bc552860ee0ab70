//! Worker pool management with structured concurrency.
//!
//! Spawns supervised relay workers, each with its own fencing token, and
//! provides graceful shutdown with a bounded deadline.

use std::{sync::Arc, time::Duration};

use outbox_core::{storage::Storage, Clock};
use tokio::{
    sync::{Notify, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{RelayError, Result},
    publisher::Publisher,
    worker::{RelayConfig, RelayStats, RelayWorker},
};

/// Pool of supervised relay worker tasks.
pub struct WorkerPool {
    storage: Storage,
    config: RelayConfig,
    publisher: Arc<dyn Publisher>,
    stats: Arc<RwLock<RelayStats>>,
    cancellation_token: CancellationToken,
    wake: Arc<Notify>,
    clock: Arc<dyn Clock>,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates a new worker pool with the given configuration.
    pub fn new(
        storage: Storage,
        config: RelayConfig,
        publisher: Arc<dyn Publisher>,
        stats: Arc<RwLock<RelayStats>>,
        cancellation_token: CancellationToken,
        wake: Arc<Notify>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            config,
            publisher,
            stats,
            cancellation_token,
            wake,
            clock,
            worker_handles: Vec::new(),
        }
    }

    /// Spawns all configured workers.
    ///
    /// Workers run until cancellation is requested. Returns immediately
    /// after spawning.
    ///
    /// # Errors
    ///
    /// Currently never fails; the signature allows future validation.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        info!(worker_count = self.config.worker_count, "spawning relay workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.config.worker_count;
        }

        for worker_id in 0..self.config.worker_count {
            let worker = RelayWorker::new(
                worker_id,
                self.storage.clone(),
                self.config.clone(),
                self.publisher.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.wake.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "relay worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }

        Ok(())
    }

    /// Signals cancellation and waits for workers within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ShutdownTimeout` when workers outlive the
    /// deadline; their in-flight leases expire and the reaper recovers
    /// the rows.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_secs = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let join_all = async move {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker finished with error");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked");
                    },
                }
            }
            let mut stats = stats.write().await;
            stats.active_workers = 0;
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_) => {
                error!(
                    timeout_secs = timeout.as_secs(),
                    "worker shutdown timed out, abandoning in-flight events to the reaper"
                );
                Err(RelayError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            self.cancellation_token.cancel();
            warn!(
                active_workers = active,
                "WorkerPool dropped without graceful shutdown, cancelling workers"
            );
        }
    }
}
