//! Ingress backpressure against unbounded pending growth.
//!
//! Producers consult the limiter before inserting. The limiter never blocks
//! the relay itself; it only shapes what enters the table.

use std::{str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{CoreError, Result},
    storage::outbox_events,
};

/// What to do when the pending backlog reaches the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowAction {
    /// Reject the insert with `CoreError::BacklogExceeded`.
    #[default]
    Throw,

    /// Log a warning and permit the insert.
    Warn,

    /// Log and tell the producer to skip enqueueing.
    Drop,
}

impl FromStr for OverflowAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "throw" => Ok(Self::Throw),
            "warn" => Ok(Self::Warn),
            "drop" => Ok(Self::Drop),
            _ => Err(CoreError::InvalidInput(format!("unknown overflow action: {s}"))),
        }
    }
}

/// Verdict handed back to the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed with the insert.
    Enqueue,

    /// Do not insert; the event was deliberately not enqueued.
    Skip,
}

/// Backlog utilization at which health reports degrade.
pub const DEGRADED_UTILIZATION_PERCENT: f64 = 80.0;

/// Compares the pending backlog against a configured cap before inserts.
pub struct BacklogLimiter {
    repository: Arc<outbox_events::Repository>,
    max_backlog_size: i64,
    on_limit: OverflowAction,
}

impl BacklogLimiter {
    /// Creates a limiter with the given cap and overflow action.
    pub fn new(
        repository: Arc<outbox_events::Repository>,
        max_backlog_size: i64,
        on_limit: OverflowAction,
    ) -> Self {
        Self { repository, max_backlog_size: max_backlog_size.max(1), on_limit }
    }

    /// The configured backlog cap.
    pub const fn max_backlog_size(&self) -> i64 {
        self.max_backlog_size
    }

    /// Decides whether a producer may insert right now.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::BacklogExceeded` when the cap is reached and the
    /// action is `Throw`; propagates database errors from the count.
    pub async fn admit(&self) -> Result<Admission> {
        let pending = self.repository.pending_count().await?;

        if pending < self.max_backlog_size {
            return Ok(Admission::Enqueue);
        }

        match self.on_limit {
            OverflowAction::Throw => {
                Err(CoreError::BacklogExceeded { pending, max: self.max_backlog_size })
            },
            OverflowAction::Warn => {
                warn!(pending, max = self.max_backlog_size, "outbox backlog cap reached");
                Ok(Admission::Enqueue)
            },
            OverflowAction::Drop => {
                warn!(
                    pending,
                    max = self.max_backlog_size,
                    "outbox backlog cap reached, dropping event"
                );
                Ok(Admission::Skip)
            },
        }
    }

    /// Pending backlog as a percentage of the cap.
    ///
    /// # Errors
    ///
    /// Returns error if the count fails.
    pub async fn utilization_percent(&self) -> Result<f64> {
        let pending = self.repository.pending_count().await?;
        Ok(utilization_percent(pending, self.max_backlog_size))
    }
}

/// Utilization formula shared with the health surface.
pub fn utilization_percent(pending: i64, max: i64) -> f64 {
    if max <= 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    {
        100.0 * pending as f64 / max as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_action_parses() {
        assert_eq!("throw".parse::<OverflowAction>().unwrap(), OverflowAction::Throw);
        assert_eq!("warn".parse::<OverflowAction>().unwrap(), OverflowAction::Warn);
        assert_eq!("drop".parse::<OverflowAction>().unwrap(), OverflowAction::Drop);
        assert!("reject".parse::<OverflowAction>().is_err());
    }

    #[test]
    fn utilization_formula() {
        assert!((utilization_percent(80, 100) - 80.0).abs() < f64::EPSILON);
        assert!((utilization_percent(0, 100)).abs() < f64::EPSILON);
        assert!((utilization_percent(150, 100) - 150.0).abs() < f64::EPSILON);
        assert!((utilization_percent(5, 0)).abs() < f64::EPSILON);
    }
}
