//! Core domain model and storage layer for the transactional outbox.
//!
//! Provides the event row model, the repository contract the relay is built
//! on (atomic claim, fenced finalization, reaping, redrive), consumer-side
//! idempotency, ingress backpressure, and the read-only health surface.
//! All other crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod health;
pub mod idempotency;
pub mod limiter;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use health::{HealthReport, HealthService, HealthStatus, HealthThresholds, OutboxGauges};
pub use idempotency::{IdempotentExecutor, Outcome};
pub use limiter::{Admission, BacklogLimiter, OverflowAction};
pub use models::{
    EventId, EventStatus, InboxRecord, LockToken, NewOutboxEvent, OutboxEvent, TrackingId,
};
pub use time::{Clock, RealClock};
