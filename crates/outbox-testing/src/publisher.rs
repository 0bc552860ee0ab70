//! Scripted publisher fake for relay tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use outbox_core::{OutboxEvent, TrackingId};
use outbox_relay::{PublishError, Publisher};

type Outcome = Result<(), PublishError>;

/// Publisher fake with per-tracking-id scripted outcomes.
///
/// Each publish pops the next scripted outcome for the event's tracking id;
/// once a script runs dry (or none exists) the default outcome applies.
/// Invocation counts are recorded for assertions.
pub struct MockPublisher {
    scripts: Mutex<HashMap<TrackingId, VecDeque<Outcome>>>,
    default_outcome: Mutex<Outcome>,
    calls: Mutex<HashMap<TrackingId, usize>>,
    total_calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    healthy: AtomicBool,
}

impl MockPublisher {
    /// Creates a publisher that succeeds for every event.
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_outcome: Mutex::new(Ok(())),
            calls: Mutex::new(HashMap::new()),
            total_calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
            healthy: AtomicBool::new(true),
        }
    }

    /// Sets the outcome used when no script entry remains.
    pub fn set_default_outcome(&self, outcome: Outcome) {
        *self.default_outcome.lock().unwrap() = outcome;
    }

    /// Scripts a sequence of outcomes for one tracking id.
    pub fn script(&self, tracking_id: TrackingId, outcomes: Vec<Outcome>) {
        self.scripts.lock().unwrap().insert(tracking_id, outcomes.into());
    }

    /// Makes every publish take at least `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Sets the advisory health flag.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Publishes recorded for one tracking id.
    pub fn publish_count(&self, tracking_id: TrackingId) -> usize {
        self.calls.lock().unwrap().get(&tracking_id).copied().unwrap_or(0)
    }

    /// Publishes recorded across all events.
    pub fn total_publishes(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, tracking_id: TrackingId) -> Outcome {
        let mut scripts = self.scripts.lock().unwrap();
        if let Some(queue) = scripts.get_mut(&tracking_id) {
            if let Some(outcome) = queue.pop_front() {
                return outcome;
            }
        }
        self.default_outcome.lock().unwrap().clone()
    }
}

impl Default for MockPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        *self.calls.lock().unwrap().entry(event.tracking_id).or_insert(0) += 1;
        self.total_calls.fetch_add(1, Ordering::SeqCst);

        self.next_outcome(event.tracking_id)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
