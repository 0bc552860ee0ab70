//! Relay engine and worker loop.
//!
//! Workers claim batches of ready events under a fencing-token lease,
//! publish them with bounded concurrency while a per-event heartbeat keeps
//! the lease alive, and finalize each row with a conditional update gated on
//! the token. A worker that loses its lease abandons the event without
//! touching the row; the reaper or a later claim picks it up.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use outbox_core::{
    storage::{outbox_events, Storage},
    Clock, EventStatus, LockToken, OutboxEvent,
};
use tokio::{
    sync::{Notify, RwLock, Semaphore},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{PublishError, RelayError, Result},
    publisher::Publisher,
    reaper::Reaper,
    retry::RetryPolicy,
    worker_pool::WorkerPool,
};

/// Configuration for the relay engine.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Number of relay workers in this process, each with its own fencing
    /// token.
    pub worker_count: usize,

    /// Maximum rows claimed per iteration.
    pub batch_size: usize,

    /// Delay between polls that found no work.
    pub poll_interval: Duration,

    /// Events processed in parallel within a claimed batch, per worker.
    pub concurrency: usize,

    /// Initial and renewal lease duration.
    pub lease: Duration,

    /// Lease renewal cadence. Must be at most a third of the lease.
    pub heartbeat_interval: Duration,

    /// Retry cap applied when an event row carries none.
    pub default_max_retries: i32,

    /// Backoff timing for failed publish attempts.
    pub retry_policy: RetryPolicy,

    /// Whether to run the reaper in-process.
    pub reaper_enabled: bool,

    /// Reaper sweep cadence. Must be at most half the lease.
    pub reaper_interval: Duration,

    /// Maximum time to wait for in-flight events on shutdown. Must not
    /// exceed the lease, so abandoned events stay recoverable.
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            concurrency: 1,
            lease: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            default_max_retries: 5,
            retry_policy: RetryPolicy::default(),
            reaper_enabled: true,
            reaper_interval: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Validates option ranges and the timing ratios the lease protocol
    /// depends on.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Configuration` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(RelayError::configuration("worker_count must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(RelayError::configuration("batch_size must be greater than 0"));
        }
        if self.concurrency == 0 {
            return Err(RelayError::configuration("concurrency must be greater than 0"));
        }
        if self.lease.is_zero() {
            return Err(RelayError::configuration("lease must be greater than 0"));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval > self.lease / 3 {
            return Err(RelayError::configuration(format!(
                "heartbeat_interval must be in (0, lease/3]; lease is {:?}",
                self.lease
            )));
        }
        if self.reaper_enabled
            && (self.reaper_interval.is_zero() || self.reaper_interval > self.lease / 2)
        {
            return Err(RelayError::configuration(format!(
                "reaper_interval must be in (0, lease/2]; lease is {:?}",
                self.lease
            )));
        }
        if self.shutdown_timeout > self.lease {
            return Err(RelayError::configuration(
                "shutdown_timeout must not exceed the lease",
            ));
        }
        if self.default_max_retries <= 0 {
            return Err(RelayError::configuration("default_max_retries must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.retry_policy.jitter_factor) {
            return Err(RelayError::configuration("jitter_factor must be between 0.0 and 1.0"));
        }
        Ok(())
    }
}

/// Counters for relay monitoring.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    /// Number of active relay workers.
    pub active_workers: usize,
    /// Events claimed since startup.
    pub events_claimed: u64,
    /// Events completed since startup.
    pub events_completed: u64,
    /// Retriable failures recorded since startup.
    pub events_retried: u64,
    /// Events diverted to the dead-letter state since startup.
    pub events_dead_lettered: u64,
    /// Events abandoned because the lease was lost mid-flight.
    pub leases_lost: u64,
    /// Events currently being published.
    pub in_flight: u64,
}

/// Outcome of processing one claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventOutcome {
    Completed,
    Retried,
    DeadLettered,
    LeaseLost,
    Skipped,
    Errored,
}

/// Main engine coordinating relay workers and the in-process reaper.
pub struct RelayEngine {
    storage: Storage,
    config: RelayConfig,
    publisher: Arc<dyn Publisher>,
    stats: Arc<RwLock<RelayStats>>,
    cancellation_token: CancellationToken,
    wake: Arc<Notify>,
    clock: Arc<dyn Clock>,
    worker_pool: Option<WorkerPool>,
    reaper_handle: Option<JoinHandle<()>>,
}

impl RelayEngine {
    /// Creates a new relay engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Configuration` when the configuration is
    /// invalid.
    pub fn new(
        storage: Storage,
        config: RelayConfig,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            storage,
            config,
            publisher,
            stats: Arc::new(RwLock::new(RelayStats::default())),
            cancellation_token: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
            clock,
            worker_pool: None,
            reaper_handle: None,
        })
    }

    /// Handle the optional change-notification listener signals to shorten
    /// empty-poll sleeps. The payload of the notification is ignored.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Cancellation token governing every task the engine spawns.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Starts the worker pool and, when enabled, the in-process reaper.
    ///
    /// Returns immediately after spawning; use `shutdown()` to stop
    /// gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if the worker pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            lease_secs = self.config.lease.as_secs(),
            "starting outbox relay engine"
        );

        if self.config.concurrency > 1 || self.config.worker_count > 1 {
            warn!(
                concurrency = self.config.concurrency,
                worker_count = self.config.worker_count,
                "parallel relay does not preserve global event ordering"
            );
        }

        let mut worker_pool = WorkerPool::new(
            self.storage.clone(),
            self.config.clone(),
            self.publisher.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.wake.clone(),
            self.clock.clone(),
        );
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        if self.config.reaper_enabled {
            let reaper = Reaper::new(
                self.storage.clone(),
                self.config.reaper_interval,
                self.cancellation_token.clone(),
                self.clock.clone(),
            );
            self.reaper_handle = Some(tokio::spawn(async move { reaper.run().await }));
        }

        info!("relay engine started");
        Ok(())
    }

    /// Gracefully shuts down workers and the reaper.
    ///
    /// Claiming stops immediately; in-flight events get up to the shutdown
    /// timeout to finalize. Anything still unfinished is abandoned to the
    /// reaper.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ShutdownTimeout` when workers outlive the
    /// deadline.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down relay engine");
        self.cancellation_token.cancel();

        let result = match self.worker_pool.take() {
            Some(pool) => pool.shutdown_graceful(self.config.shutdown_timeout).await,
            None => Ok(()),
        };

        if let Some(handle) = self.reaper_handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "reaper task did not shut down cleanly");
            }
        }

        result
    }

    /// Returns current relay statistics.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }
}

/// Individual relay worker owning one fencing token for its lifetime.
#[derive(Clone)]
pub struct RelayWorker {
    id: usize,
    storage: Storage,
    config: RelayConfig,
    publisher: Arc<dyn Publisher>,
    stats: Arc<RwLock<RelayStats>>,
    cancellation_token: CancellationToken,
    wake: Arc<Notify>,
    clock: Arc<dyn Clock>,
    semaphore: Arc<Semaphore>,
    lock_token: LockToken,
}

impl RelayWorker {
    /// Creates a relay worker with a freshly generated fencing token.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        storage: Storage,
        config: RelayConfig,
        publisher: Arc<dyn Publisher>,
        stats: Arc<RwLock<RelayStats>>,
        cancellation_token: CancellationToken,
        wake: Arc<Notify>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let concurrency = config.concurrency;
        Self {
            id,
            storage,
            config,
            publisher,
            stats,
            cancellation_token,
            wake,
            clock,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            lock_token: LockToken::generate(),
        }
    }

    /// The fencing token this worker stamps on its claims.
    pub const fn lock_token(&self) -> LockToken {
        self.lock_token
    }

    /// Main loop: claim and relay batches until cancelled.
    ///
    /// A full batch re-enters immediately; anything less sleeps one poll
    /// interval or until the change listener wakes us. Database errors are
    /// logged and retried on the next iteration.
    ///
    /// # Errors
    ///
    /// Returns error only if worker setup fails; processing errors never
    /// escape the loop.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, lock_token = %self.lock_token, "relay worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.process_batch().await {
                Ok(claimed) if claimed == self.config.batch_size => {
                    // Backlog likely remains; re-enter without sleeping.
                },
                Ok(_) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = self.wake.notified() => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Err(error) => {
                    error!(worker_id = self.id, error = %error, "relay batch failed");
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "relay worker stopped");
        Ok(())
    }

    /// Claims one batch and processes it with bounded parallelism.
    ///
    /// Returns the number of events claimed.
    ///
    /// # Errors
    ///
    /// Returns error if the claim itself fails.
    async fn process_batch(&self) -> Result<usize> {
        let events = self
            .storage
            .outbox_events
            .claim_batch(self.config.batch_size, self.config.lease, self.lock_token)
            .await?;
        let claimed = events.len();

        if claimed == 0 {
            return Ok(0);
        }

        debug!(worker_id = self.id, claimed, "claimed event batch");
        {
            let mut stats = self.stats.write().await;
            stats.events_claimed += claimed as u64;
        }

        let mut tasks = JoinSet::new();
        for event in events {
            let worker = self.clone();
            let semaphore = self.semaphore.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return EventOutcome::Errored;
                };
                worker.process_event(event).await
            });
        }

        let mut completed = 0_u64;
        let mut retried = 0_u64;
        let mut dead_lettered = 0_u64;
        let mut leases_lost = 0_u64;
        let mut errors = 0_u64;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(EventOutcome::Completed) => completed += 1,
                Ok(EventOutcome::Retried) => retried += 1,
                Ok(EventOutcome::DeadLettered) => dead_lettered += 1,
                Ok(EventOutcome::LeaseLost) => leases_lost += 1,
                Ok(EventOutcome::Skipped) => {},
                Ok(EventOutcome::Errored) => errors += 1,
                Err(join_error) => {
                    // A panicking publisher kills only its event's task; the
                    // abandoned lease expires and the reaper rescues the row.
                    error!(worker_id = self.id, error = %join_error, "event task panicked");
                    errors += 1;
                },
            }
        }

        {
            let mut stats = self.stats.write().await;
            stats.events_completed += completed;
            stats.events_retried += retried;
            stats.events_dead_lettered += dead_lettered;
            stats.leases_lost += leases_lost;
        }

        info!(
            worker_id = self.id,
            claimed, completed, retried, dead_lettered, leases_lost, errors, "batch relayed"
        );

        Ok(claimed)
    }

    /// Relays one event: heartbeat, publish, fenced finalization.
    async fn process_event(&self, event: OutboxEvent) -> EventOutcome {
        if event.lock_token != Some(self.lock_token) {
            debug!(
                worker_id = self.id,
                event_id = %event.id,
                "claimed row carries a foreign lock token, dropping"
            );
            return EventOutcome::Skipped;
        }

        {
            let mut stats = self.stats.write().await;
            stats.in_flight += 1;
        }
        let outcome = self.publish_and_finalize(&event).await;
        {
            let mut stats = self.stats.write().await;
            stats.in_flight -= 1;
        }

        outcome
    }

    async fn publish_and_finalize(&self, event: &OutboxEvent) -> EventOutcome {
        let heartbeat_stop = CancellationToken::new();
        let lease_lost = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.storage.outbox_events.clone(),
            event.id,
            self.lock_token,
            self.config.heartbeat_interval,
            self.config.lease,
            heartbeat_stop.clone(),
            lease_lost.clone(),
            self.clock.clone(),
        ));

        // The publisher call cannot be interrupted; on a lost lease we stop
        // awaiting it and discard whatever it eventually produces.
        let publish_result = tokio::select! {
            () = lease_lost.cancelled() => None,
            result = self.publisher.publish(event) => Some(result),
        };

        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            warn!(worker_id = self.id, event_id = %event.id, error = %e, "heartbeat task failed");
        }

        let Some(publish_result) = publish_result else {
            warn!(
                worker_id = self.id,
                event_id = %event.id,
                tracking_id = %event.tracking_id,
                "lease lost mid-publish, abandoning event"
            );
            return EventOutcome::LeaseLost;
        };

        match publish_result {
            Ok(()) => self.finalize_success(event).await,
            Err(error) => self.finalize_failure(event, &error).await,
        }
    }

    async fn finalize_success(&self, event: &OutboxEvent) -> EventOutcome {
        match self.storage.outbox_events.mark_completed(event.id, self.lock_token).await {
            Ok(true) => {
                debug!(
                    worker_id = self.id,
                    event_id = %event.id,
                    tracking_id = %event.tracking_id,
                    "event relayed"
                );
                EventOutcome::Completed
            },
            Ok(false) => self.report_lease_lost(event),
            Err(e) => {
                error!(worker_id = self.id, event_id = %event.id, error = %e, "finalize failed");
                EventOutcome::Errored
            },
        }
    }

    async fn finalize_failure(&self, event: &OutboxEvent, error: &PublishError) -> EventOutcome {
        let max_retries =
            if event.max_retries > 0 { event.max_retries } else { self.config.default_max_retries };
        let attempts_exhausted = event.retry_count + 1 >= max_retries;

        if error.is_retryable() && !attempts_exhausted {
            let next_visible_at = self
                .config
                .retry_policy
                .next_visible_at(Utc::now(), event.retry_count.unsigned_abs());

            match self
                .storage
                .outbox_events
                .mark_failed(event.id, self.lock_token, error.reason(), next_visible_at)
                .await
            {
                Ok(true) => {
                    debug!(
                        worker_id = self.id,
                        event_id = %event.id,
                        retry_count = event.retry_count + 1,
                        next_visible_at = %next_visible_at,
                        error = error.reason(),
                        "publish failed, retry scheduled"
                    );
                    EventOutcome::Retried
                },
                Ok(false) => self.report_lease_lost(event),
                Err(e) => {
                    error!(worker_id = self.id, event_id = %event.id, error = %e, "finalize failed");
                    EventOutcome::Errored
                },
            }
        } else {
            match self
                .storage
                .outbox_events
                .mark_dead_letter(event.id, self.lock_token, error.reason())
                .await
            {
                Ok(true) => {
                    error!(
                        worker_id = self.id,
                        event_id = %event.id,
                        tracking_id = %event.tracking_id,
                        event_type = %event.event_type,
                        last_error = error.reason(),
                        "event dead-lettered"
                    );
                    EventOutcome::DeadLettered
                },
                Ok(false) => self.report_lease_lost(event),
                Err(e) => {
                    error!(worker_id = self.id, event_id = %event.id, error = %e, "finalize failed");
                    EventOutcome::Errored
                },
            }
        }
    }

    fn report_lease_lost(&self, event: &OutboxEvent) -> EventOutcome {
        warn!(
            worker_id = self.id,
            event_id = %event.id,
            tracking_id = %event.tracking_id,
            "lease lost before finalize, abandoning event"
        );
        EventOutcome::LeaseLost
    }
}

/// Renews one event's lease every `interval` until stopped.
///
/// A failed renewal (token mismatch) fires `lease_lost` immediately so the
/// worker can cancel further work on the event; transient database errors
/// are logged and the next tick retries.
#[allow(clippy::too_many_arguments)]
async fn heartbeat_loop(
    repository: Arc<outbox_events::Repository>,
    event_id: outbox_core::EventId,
    lock_token: LockToken,
    interval: Duration,
    lease: Duration,
    stop: CancellationToken,
    lease_lost: CancellationToken,
    clock: Arc<dyn Clock>,
) {
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            () = clock.sleep(interval) => {
                match repository.renew_lease(event_id, lock_token, lease).await {
                    Ok(true) => {},
                    Ok(false) => {
                        lease_lost.cancel();
                        break;
                    },
                    Err(e) => {
                        warn!(event_id = %event_id, error = %e, "lease renewal failed");
                    },
                }
            },
        }
    }
}

/// Convenience check used by operational tooling: whether a status is one
/// the relay will still act on.
pub fn is_relayable(status: EventStatus) -> bool {
    matches!(status, EventStatus::Pending | EventStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn heartbeat_ratio_enforced() {
        let config = RelayConfig {
            lease: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(11),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            lease: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reaper_ratio_enforced() {
        let config = RelayConfig {
            lease: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(16),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn shutdown_timeout_bounded_by_lease() {
        let config = RelayConfig {
            lease: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(3),
            reaper_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(11),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_options_rejected() {
        for config in [
            RelayConfig { batch_size: 0, ..Default::default() },
            RelayConfig { concurrency: 0, ..Default::default() },
            RelayConfig { worker_count: 0, ..Default::default() },
            RelayConfig { default_max_retries: 0, ..Default::default() },
        ] {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn relayable_statuses() {
        assert!(is_relayable(EventStatus::Pending));
        assert!(is_relayable(EventStatus::Failed));
        assert!(!is_relayable(EventStatus::Processing));
        assert!(!is_relayable(EventStatus::Completed));
        assert!(!is_relayable(EventStatus::DeadLetter));
    }
}
