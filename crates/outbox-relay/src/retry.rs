//! Exponential backoff with jitter and cap.
//!
//! Computes the re-admission delay applied after each failed publish
//! attempt. The delay is persisted as the event's `visible_at` so that
//! claims honour it precisely even under heavy backlog.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry timing policy for failed publish attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay for the exponential calculation.
    pub base_backoff: Duration,

    /// Ceiling on the exponential component.
    pub max_backoff: Duration,

    /// Fraction of the exponential delay added as uniform random jitter
    /// (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n + 1`, where `n` is the zero-based attempt
    /// that just failed.
    ///
    /// `min(max_backoff, base_backoff * 2^n)` plus uniform jitter in
    /// `[0, exponential * jitter_factor]`, floored to whole milliseconds.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let exponential = self.base_backoff.saturating_mul(multiplier).min(self.max_backoff);

        let jitter_ms = if self.jitter_factor > 0.0 {
            let range = exponential.as_secs_f64() * self.jitter_factor.clamp(0.0, 1.0) * 1000.0;
            if range > 0.0 {
                rand::rng().random_range(0.0..=range)
            } else {
                0.0
            }
        } else {
            0.0
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let total_ms = exponential.as_millis().min(u128::from(u64::MAX)) as u64
            + jitter_ms.floor() as u64;

        Duration::from_millis(total_ms)
    }

    /// The instant at which a row failed on attempt `attempt` becomes
    /// claimable again.
    pub fn next_visible_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = self.delay_for(attempt);
        now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
    }
}
