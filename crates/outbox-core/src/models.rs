//! Core domain model and strongly-typed identifiers.
//!
//! Defines the outbox event row, its status lifecycle, and newtype ID
//! wrappers for compile-time type safety. Includes database serialization
//! traits for the relay pipeline.

use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Server-assigned event identifier.
///
/// Wraps the BIGSERIAL primary key of the outbox table. Assigned on insert,
/// monotonically increasing, gaps permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Stable idempotency key carried across producer, relay, and consumer.
///
/// Assigned once at event creation and never changed. Unique across the
/// whole outbox table; consumers deduplicate on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackingId(pub Uuid);

impl TrackingId {
    /// Creates a new random tracking ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TrackingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TrackingId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for TrackingId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TrackingId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for TrackingId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Process-local floor ensuring tokens never repeat within a process.
static LAST_TOKEN: AtomicI64 = AtomicI64::new(0);

/// Fencing token identifying the current leaseholder of an event.
///
/// Every state-changing repository operation on a `PROCESSING` row is gated
/// on matching this token, so a worker that lost its lease cannot mutate the
/// row. Tokens are monotonically increasing within a process and unique
/// across processes with overwhelming probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub i64);

impl LockToken {
    /// Generates a fresh fencing token.
    ///
    /// Composite of wall-clock milliseconds and a random suffix:
    /// `millis * 1000 + rand(0..1000)`. A process-wide atomic floor keeps
    /// the sequence strictly increasing even when the clock stalls.
    pub fn generate() -> Self {
        let raw = Utc::now().timestamp_millis() * 1000
            + i64::from(rand::rng().random_range(0..1000u16));

        let mut last = LAST_TOKEN.load(Ordering::Acquire);
        loop {
            let candidate = raw.max(last + 1);
            match LAST_TOKEN.compare_exchange(last, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Self(candidate),
                Err(observed) => last = observed,
            }
        }
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<PgDb> for LockToken {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for LockToken {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let token = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(token))
    }
}

impl sqlx::Encode<'_, PgDb> for LockToken {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Event lifecycle status.
///
/// Events progress through these states during relay. Transitions out of
/// `Processing` require the caller to present the current lock token:
///
/// ```text
/// Pending -> Processing -> Completed
///         ^             -> Failed (retriable, re-claimed later)
///         |             -> DeadLetter (retries exhausted / permanent)
///         +-- reaper returns expired Processing leases
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Durable and waiting for a worker to claim it.
    Pending,

    /// Claimed under a live lease; exactly one worker holds the token.
    Processing,

    /// Successfully published. Terminal.
    Completed,

    /// Publish failed with a retriable error; eligible for re-claim once
    /// `visible_at` passes.
    Failed,

    /// Retries exhausted or failure permanent. Terminal until an operator
    /// redrives it.
    DeadLetter,
}

impl EventStatus {
    /// Database literal for this status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::DeadLetter => "DEAD_LETTER",
        }
    }

    /// Whether no further relay processing will touch this event.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for EventStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "DEAD_LETTER" => Ok(Self::DeadLetter),
            _ => Err(format!("invalid event status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for EventStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// One row of the outbox table.
///
/// The event is opaque to the relay: `payload` and `metadata` round-trip
/// byte-for-byte semantically and are never interpreted. Lease fields
/// (`locked_until`, `lock_token`) are non-null exactly while the row is
/// `Processing`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEvent {
    /// Server-assigned primary key and claim-ordering key.
    pub id: EventId,

    /// Idempotency key, unique across the table.
    pub tracking_id: TrackingId,

    /// Business correlation identifier; not interpreted by the relay.
    pub aggregate_id: String,

    /// Short tag classifying the aggregate.
    pub aggregate_type: String,

    /// Short tag used for routing, redrive scoping, and dead-letter stats.
    pub event_type: String,

    /// Opaque event body.
    pub payload: sqlx::types::Json<serde_json::Value>,

    /// Schema version, trace context, correlation and causation IDs.
    pub metadata: sqlx::types::Json<serde_json::Value>,

    /// Current lifecycle status.
    pub status: EventStatus,

    /// Failed publish attempts so far. Non-decreasing.
    pub retry_count: i32,

    /// Attempt cap before the dead-letter transition. Immutable after
    /// creation.
    pub max_retries: i32,

    /// Insert instant; claim order within a batch.
    pub created_at: DateTime<Utc>,

    /// Set on transition to a terminal status.
    pub processed_at: Option<DateTime<Utc>>,

    /// Earliest instant the row is eligible for claiming. Pushed into the
    /// future by the backoff policy after each failure.
    pub visible_at: DateTime<Utc>,

    /// Lease deadline; null unless `Processing`.
    pub locked_until: Option<DateTime<Utc>>,

    /// Fencing token of the leaseholder; null unless `Processing`.
    pub lock_token: Option<LockToken>,

    /// Most recent failure reason, truncated.
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// Event body as a JSON value.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload.0
    }

    /// Event metadata as a JSON value.
    pub fn metadata(&self) -> &serde_json::Value {
        &self.metadata.0
    }
}

/// Fields a producer supplies when inserting an event.
///
/// `id`, `created_at`, and `processed_at` are server-assigned; a missing
/// `tracking_id` is generated at insert.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    /// Idempotency key; generated when absent.
    pub tracking_id: Option<TrackingId>,

    /// Business correlation identifier.
    pub aggregate_id: String,

    /// Short tag classifying the aggregate.
    pub aggregate_type: String,

    /// Short tag classifying the event.
    pub event_type: String,

    /// Opaque event body.
    pub payload: serde_json::Value,

    /// Opaque event metadata.
    pub metadata: serde_json::Value,

    /// Attempt cap; falls back to the table default when absent.
    pub max_retries: Option<i32>,
}

impl NewOutboxEvent {
    /// Creates an insert request with empty metadata and default retry cap.
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            tracking_id: None,
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            max_retries: None,
        }
    }
}

/// Consumer-side deduplication record.
///
/// One row per `(tracking_id, consumer_id)` pair proves the consumer has
/// already handled the event.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InboxRecord {
    /// Server-assigned row ID.
    pub id: i64,

    /// Tracking ID of the processed event.
    pub tracking_id: TrackingId,

    /// Logical consumer that processed it.
    pub consumer_id: String,

    /// When the consumer marked it processed.
    pub processed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_literals_match_schema() {
        assert_eq!(EventStatus::Pending.to_string(), "PENDING");
        assert_eq!(EventStatus::Processing.to_string(), "PROCESSING");
        assert_eq!(EventStatus::Completed.to_string(), "COMPLETED");
        assert_eq!(EventStatus::Failed.to_string(), "FAILED");
        assert_eq!(EventStatus::DeadLetter.to_string(), "DEAD_LETTER");
    }

    #[test]
    fn terminal_statuses_identified() {
        assert!(EventStatus::Completed.is_terminal());
        assert!(EventStatus::DeadLetter.is_terminal());
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::Processing.is_terminal());
        assert!(!EventStatus::Failed.is_terminal());
    }

    #[test]
    fn lock_tokens_strictly_increase_within_process() {
        let a = LockToken::generate();
        let b = LockToken::generate();
        let c = LockToken::generate();
        assert!(b.0 > a.0);
        assert!(c.0 > b.0);
    }

    #[test]
    fn tracking_ids_are_unique() {
        let a = TrackingId::new();
        let b = TrackingId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn new_event_defaults() {
        let event = NewOutboxEvent::new("order-1", "order", "OrderCreated", serde_json::json!({}));
        assert!(event.tracking_id.is_none());
        assert!(event.max_retries.is_none());
        assert!(event.metadata.as_object().is_some_and(serde_json::Map::is_empty));
    }
}
