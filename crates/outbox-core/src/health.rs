//! Read-only health and metrics surface over the event store.
//!
//! Aggregates the outbox gauges and rolls independent sub-checks up into a
//! coarse status via worst-of. The surface is a library component; whatever
//! serves it over HTTP lives outside this crate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::{
    limiter::{utilization_percent, DEGRADED_UTILIZATION_PERCENT},
    storage::Storage,
};

/// Coarse health status, worst-of over the sub-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All checks within thresholds.
    Healthy,
    /// At least one check past its warning threshold.
    Degraded,
    /// Database unreachable or a check past its critical threshold.
    Unhealthy,
}

/// Thresholds the sub-checks compare against.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Backlog cap used for utilization; matches the limiter's cap.
    pub max_backlog_size: i64,
    /// Dead-letter count at which the store is degraded.
    pub dead_letter_degraded: i64,
    /// Dead-letter count at which the store is unhealthy.
    pub dead_letter_unhealthy: i64,
    /// Oldest-pending age at which the relay is falling behind.
    pub oldest_pending_degraded: Duration,
    /// Oldest-pending age at which the relay is considered stuck.
    pub oldest_pending_unhealthy: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_backlog_size: 10_000,
            dead_letter_degraded: 1,
            dead_letter_unhealthy: 100,
            oldest_pending_degraded: Duration::from_secs(300),
            oldest_pending_unhealthy: Duration::from_secs(1800),
        }
    }
}

/// Point-in-time gauge snapshot of the event store.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxGauges {
    /// Events awaiting relay.
    pub pending: i64,
    /// Events currently leased.
    pub processing: i64,
    /// Completed events within retention.
    pub completed: i64,
    /// Dead-lettered events awaiting redrive.
    pub dead_letter: i64,
    /// Age in seconds of the oldest pending event.
    pub oldest_pending_age_seconds: Option<i64>,
    /// Pending backlog as a percentage of the configured cap.
    pub backlog_utilization_percent: f64,
}

/// One sub-check's verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentCheck {
    /// Status contributed to the rollup.
    pub status: HealthStatus,
    /// Explanation when not healthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentCheck {
    fn healthy() -> Self {
        Self { status: HealthStatus::Healthy, message: None }
    }

    fn degraded(message: String) -> Self {
        Self { status: HealthStatus::Degraded, message: Some(message) }
    }

    fn unhealthy(message: String) -> Self {
        Self { status: HealthStatus::Unhealthy, message: Some(message) }
    }
}

/// Individual sub-check results.
#[derive(Debug, Clone, Serialize)]
pub struct HealthChecks {
    /// Database connectivity.
    pub database: ComponentCheck,
    /// Pending backlog against the cap.
    pub backlog: ComponentCheck,
    /// Dead-letter population.
    pub dead_letter: ComponentCheck,
    /// Oldest pending event age.
    pub oldest_pending: ComponentCheck,
}

/// Full health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst-of rollup over the checks.
    pub status: HealthStatus,
    /// When the report was taken.
    pub timestamp: DateTime<Utc>,
    /// Individual sub-check results.
    pub checks: HealthChecks,
    /// Gauge snapshot; absent when the database is unreachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gauges: Option<OutboxGauges>,
}

/// Read-only aggregator producing `HealthReport`s.
pub struct HealthService {
    storage: Storage,
    thresholds: HealthThresholds,
}

impl HealthService {
    /// Creates a health service with the given thresholds.
    pub fn new(storage: Storage, thresholds: HealthThresholds) -> Self {
        Self { storage, thresholds }
    }

    /// Takes a health snapshot of the event store.
    ///
    /// Never returns an error: an unreachable database is itself a health
    /// finding and yields an `Unhealthy` report without gauges.
    pub async fn check(&self) -> HealthReport {
        debug!("taking outbox health snapshot");
        let timestamp = Utc::now();

        if let Err(e) = self.storage.health_check().await {
            let database = ComponentCheck::unhealthy(format!("database unreachable: {e}"));
            return HealthReport {
                status: HealthStatus::Unhealthy,
                timestamp,
                checks: HealthChecks {
                    database,
                    backlog: ComponentCheck::healthy(),
                    dead_letter: ComponentCheck::healthy(),
                    oldest_pending: ComponentCheck::healthy(),
                },
                gauges: None,
            };
        }

        let gauges = match self.collect_gauges().await {
            Ok(gauges) => gauges,
            Err(e) => {
                let database = ComponentCheck::unhealthy(format!("gauge query failed: {e}"));
                return HealthReport {
                    status: HealthStatus::Unhealthy,
                    timestamp,
                    checks: HealthChecks {
                        database,
                        backlog: ComponentCheck::healthy(),
                        dead_letter: ComponentCheck::healthy(),
                        oldest_pending: ComponentCheck::healthy(),
                    },
                    gauges: None,
                };
            },
        };

        let backlog = self.check_backlog(&gauges);
        let dead_letter = self.check_dead_letter(&gauges);
        let oldest_pending = self.check_oldest_pending(&gauges);

        let status = [backlog.status, dead_letter.status, oldest_pending.status]
            .into_iter()
            .max()
            .unwrap_or(HealthStatus::Healthy);

        HealthReport {
            status,
            timestamp,
            checks: HealthChecks {
                database: ComponentCheck::healthy(),
                backlog,
                dead_letter,
                oldest_pending,
            },
            gauges: Some(gauges),
        }
    }

    async fn collect_gauges(&self) -> crate::error::Result<OutboxGauges> {
        let events = &self.storage.outbox_events;

        let pending = events.pending_count().await?;
        let processing = events.processing_count().await?;
        let completed = events.completed_count().await?;
        let dead_letter = events.dead_letter_count().await?;
        let oldest_pending_age_seconds = events.oldest_pending_age_seconds().await?;

        Ok(OutboxGauges {
            pending,
            processing,
            completed,
            dead_letter,
            oldest_pending_age_seconds,
            backlog_utilization_percent: utilization_percent(
                pending,
                self.thresholds.max_backlog_size,
            ),
        })
    }

    fn check_backlog(&self, gauges: &OutboxGauges) -> ComponentCheck {
        let utilization = gauges.backlog_utilization_percent;
        if utilization >= 100.0 {
            ComponentCheck::unhealthy(format!(
                "backlog at {utilization:.0}% of cap {}",
                self.thresholds.max_backlog_size
            ))
        } else if utilization >= DEGRADED_UTILIZATION_PERCENT {
            ComponentCheck::degraded(format!(
                "backlog at {utilization:.0}% of cap {}",
                self.thresholds.max_backlog_size
            ))
        } else {
            ComponentCheck::healthy()
        }
    }

    fn check_dead_letter(&self, gauges: &OutboxGauges) -> ComponentCheck {
        let count = gauges.dead_letter;
        if count >= self.thresholds.dead_letter_unhealthy {
            ComponentCheck::unhealthy(format!("{count} dead-lettered events"))
        } else if count >= self.thresholds.dead_letter_degraded {
            ComponentCheck::degraded(format!("{count} dead-lettered events"))
        } else {
            ComponentCheck::healthy()
        }
    }

    fn check_oldest_pending(&self, gauges: &OutboxGauges) -> ComponentCheck {
        let Some(age) = gauges.oldest_pending_age_seconds else {
            return ComponentCheck::healthy();
        };
        let age = Duration::from_secs(age.max(0).unsigned_abs());

        if age >= self.thresholds.oldest_pending_unhealthy {
            ComponentCheck::unhealthy(format!("oldest pending event is {}s old", age.as_secs()))
        } else if age >= self.thresholds.oldest_pending_degraded {
            ComponentCheck::degraded(format!("oldest pending event is {}s old", age.as_secs()))
        } else {
            ComponentCheck::healthy()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordering_supports_worst_of() {
        assert!(HealthStatus::Healthy < HealthStatus::Degraded);
        assert!(HealthStatus::Degraded < HealthStatus::Unhealthy);
        let worst = [HealthStatus::Healthy, HealthStatus::Unhealthy, HealthStatus::Degraded]
            .into_iter()
            .max();
        assert_eq!(worst, Some(HealthStatus::Unhealthy));
    }

    #[test]
    fn default_thresholds_are_ordered() {
        let t = HealthThresholds::default();
        assert!(t.dead_letter_degraded <= t.dead_letter_unhealthy);
        assert!(t.oldest_pending_degraded <= t.oldest_pending_unhealthy);
    }
}
