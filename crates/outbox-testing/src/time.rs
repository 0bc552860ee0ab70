//! Deterministic clock for time-based test scenarios.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use outbox_core::Clock;

/// Test clock with manually controlled time progression.
///
/// `sleep` advances virtual time immediately and yields, so timing-driven
/// code runs without real delays. Monotonic and system time share one
/// nanosecond counter, so sub-second advances never drift the two apart.
/// Clones share the same underlying time.
#[derive(Clone)]
pub struct TestClock {
    monotonic_ns: Arc<AtomicU64>,
    base_system_ns: u64,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            base_system_ns: u64::try_from(since_epoch.as_nanos().min(u128::from(u64::MAX)))
                .unwrap_or(0),
            base_instant: Instant::now(),
        }
    }

    /// Advances both clocks by the given duration.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(0);
        self.monotonic_ns.fetch_add(nanos, Ordering::AcqRel);
    }

    /// Elapsed virtual time since clock creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }

    fn now_system(&self) -> SystemTime {
        let elapsed = self.monotonic_ns.load(Ordering::Acquire);
        UNIX_EPOCH + Duration::from_nanos(self.base_system_ns.saturating_add(elapsed))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances() {
        let clock = TestClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(10));
        assert_eq!(clock.now().duration_since(start), Duration::from_secs(10));
    }

    #[test]
    fn sub_second_advances_accumulate_in_system_time() {
        let clock = TestClock::new();
        let start = clock.now_system();

        clock.advance(Duration::from_millis(500));
        clock.advance(Duration::from_millis(500));

        let elapsed = clock.now_system().duration_since(start).unwrap();
        assert_eq!(elapsed, Duration::from_secs(1));
    }

    #[test]
    fn monotonic_and_system_time_stay_in_step() {
        let clock = TestClock::new();
        let system_start = clock.now_system();

        clock.advance(Duration::from_millis(1500));

        assert_eq!(clock.elapsed(), Duration::from_millis(1500));
        assert_eq!(
            clock.now_system().duration_since(system_start).unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::new();
        clock.sleep(Duration::from_secs(5)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_secs(3));
        assert_eq!(other.elapsed(), Duration::from_secs(3));
    }
}
