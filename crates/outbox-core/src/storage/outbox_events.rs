//! Repository for outbox event database operations.
//!
//! The narrow contract the relay is built on. Every operation here is atomic
//! at the database level: claiming uses `FOR UPDATE SKIP LOCKED` so
//! concurrent workers never serialize, and every transition out of
//! `PROCESSING` is a conditional update gated on the caller's fencing token.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{EventId, EventStatus, LockToken, NewOutboxEvent, OutboxEvent, TrackingId},
};

/// Retry cap applied when the producer does not supply one.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// `last_error` is truncated to this many bytes before persisting.
const MAX_ERROR_LEN: usize = 512;

/// Upper bound on a single `find_recent` page.
const MAX_PAGE_SIZE: i64 = 500;

const EVENT_COLUMNS: &str = "id, tracking_id, aggregate_id, aggregate_type, event_type, \
     payload, metadata, status, retry_count, max_retries, \
     created_at, processed_at, visible_at, locked_until, lock_token, last_error";

/// Cursor query for `find_recent`.
///
/// `after` selects rows newer than the cursor, `before` rows older; with
/// neither the newest rows are returned. Output is always descending by id.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecentQuery {
    /// Maximum rows per page.
    pub limit: i64,
    /// Exclusive lower bound on id.
    pub after: Option<EventId>,
    /// Exclusive upper bound on id.
    pub before: Option<EventId>,
}

/// One page of `find_recent` results.
#[derive(Debug, Clone)]
pub struct RecentPage {
    /// Events in descending id order.
    pub events: Vec<OutboxEvent>,
    /// Whether a further row existed beyond this page at query time.
    pub has_more: bool,
}

/// Per-event-type aggregate over the dead-letter population.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetterStat {
    /// Event type this row aggregates.
    pub event_type: String,
    /// Dead-lettered events of this type.
    pub count: i64,
    /// Age in seconds of the oldest dead-lettered event.
    pub oldest_age_seconds: i64,
    /// Age in seconds of the newest dead-lettered event.
    pub newest_age_seconds: i64,
    /// Up to three distinct truncated error samples.
    pub error_samples: Option<Vec<String>>,
}

/// Repository for outbox event database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new event, assigning id, tracking id, and timestamps.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` when the tracking id
    /// collides with an existing row.
    pub async fn insert(&self, event: &NewOutboxEvent) -> Result<OutboxEvent> {
        self.insert_impl(&*self.pool, event).await
    }

    /// Inserts a new event inside the caller's transaction.
    ///
    /// This is the producer-facing entry point of the outbox pattern: the
    /// event row and the business write commit or roll back together.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` on a tracking id collision.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &NewOutboxEvent,
    ) -> Result<OutboxEvent> {
        self.insert_impl(&mut **tx, event).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, event: &NewOutboxEvent) -> Result<OutboxEvent>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let tracking_id = event.tracking_id.unwrap_or_default();
        let max_retries = event.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(0);

        let inserted = sqlx::query_as::<_, OutboxEvent>(&format!(
            r"
            INSERT INTO outbox (
                tracking_id, aggregate_id, aggregate_type, event_type,
                payload, metadata, max_retries
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {EVENT_COLUMNS}
            "
        ))
        .bind(tracking_id)
        .bind(&event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(&event.event_type)
        .bind(sqlx::types::Json(&event.payload))
        .bind(sqlx::types::Json(&event.metadata))
        .bind(max_retries)
        .fetch_one(executor)
        .await?;

        Ok(inserted)
    }

    /// Atomically claims up to `batch_size` ready events for `lock_token`.
    ///
    /// Selects `PENDING` and `FAILED` rows whose `visible_at` has passed and
    /// whose lease (if any) has expired, oldest first, skipping rows locked
    /// by a concurrent claimer, then stamps them `PROCESSING` with a lease
    /// of `lease` from now. Returned events are ordered by `created_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_batch(
        &self,
        batch_size: usize,
        lease: Duration,
        lock_token: LockToken,
    ) -> Result<Vec<OutboxEvent>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r"
            SELECT id FROM outbox
            WHERE status IN ('PENDING', 'FAILED')
              AND visible_at <= NOW()
              AND (locked_until IS NULL OR locked_until < NOW())
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let mut events = sqlx::query_as::<_, OutboxEvent>(&format!(
            r"
            UPDATE outbox
            SET status = 'PROCESSING',
                locked_until = NOW() + make_interval(secs => $2),
                lock_token = $3
            WHERE id = ANY($1)
            RETURNING {EVENT_COLUMNS}
            "
        ))
        .bind(&ids)
        .bind(lease.as_secs_f64())
        .bind(lock_token)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        // UPDATE ... RETURNING carries no ordering guarantee.
        events.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        Ok(events)
    }

    /// Marks an event completed, gated on the fencing token.
    ///
    /// Sets `COMPLETED`, stamps `processed_at`, clears the lease.
    /// `last_error` is left untouched so a retried-then-succeeded event
    /// keeps its last failure reason for diagnosis.
    ///
    /// Returns `false` when the token no longer matches: the caller has
    /// lost the lease and must abandon the event.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_completed(&self, id: EventId, lock_token: LockToken) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET status = 'COMPLETED',
                processed_at = NOW(),
                locked_until = NULL,
                lock_token = NULL
            WHERE id = $1 AND lock_token = $2
            ",
        )
        .bind(id)
        .bind(lock_token)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Records a retriable failure, gated on the fencing token.
    ///
    /// Sets `FAILED`, increments `retry_count`, stores the truncated error,
    /// clears the lease, and pushes `visible_at` to `next_visible_at` so the
    /// backoff delay is honoured by subsequent claims.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(
        &self,
        id: EventId,
        lock_token: LockToken,
        error: &str,
        next_visible_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET status = 'FAILED',
                retry_count = retry_count + 1,
                last_error = $3,
                visible_at = $4,
                locked_until = NULL,
                lock_token = NULL
            WHERE id = $1 AND lock_token = $2
            ",
        )
        .bind(id)
        .bind(lock_token)
        .bind(truncate_error(error))
        .bind(next_visible_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Diverts an event to the dead-letter state, gated on the fencing
    /// token.
    ///
    /// Increments `retry_count` so an event dead-lettered on its final
    /// attempt reports the full attempt count, stores the truncated error,
    /// stamps `processed_at`, clears the lease.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_dead_letter(
        &self,
        id: EventId,
        lock_token: LockToken,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET status = 'DEAD_LETTER',
                retry_count = retry_count + 1,
                last_error = $3,
                processed_at = NOW(),
                locked_until = NULL,
                lock_token = NULL
            WHERE id = $1 AND lock_token = $2
            ",
        )
        .bind(id)
        .bind(lock_token)
        .bind(truncate_error(error))
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Extends the lease of an in-flight event, gated on the fencing token.
    ///
    /// A `false` return means the lease was lost (reaped or re-claimed);
    /// the worker must stop heartbeating and treat the in-flight side
    /// effect's outcome as unknown.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn renew_lease(
        &self,
        id: EventId,
        lock_token: LockToken,
        lease: Duration,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET locked_until = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND lock_token = $2 AND status = 'PROCESSING'
            ",
        )
        .bind(id)
        .bind(lock_token)
        .bind(lease.as_secs_f64())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns expired `PROCESSING` leases to `PENDING`.
    ///
    /// Clears the lease fields and preserves `retry_count`: reaping is
    /// neither a success nor an application-level failure.
    ///
    /// # Errors
    ///
    /// Returns error if the sweep fails.
    pub async fn recover_stale(&self) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET status = 'PENDING',
                locked_until = NULL,
                lock_token = NULL
            WHERE status = 'PROCESSING' AND locked_until < NOW()
            ",
        )
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Redrives every dead-lettered event of `event_type` back to pending.
    ///
    /// Resets the retry counter, clears the last error and terminal
    /// timestamp, and makes the rows immediately visible. Operator
    /// initiated; there is deliberately no unscoped variant.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn redrive_by_event_type(&self, event_type: &str) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET status = 'PENDING',
                retry_count = 0,
                last_error = NULL,
                processed_at = NULL,
                visible_at = NOW()
            WHERE status = 'DEAD_LETTER' AND event_type = $1
            ",
        )
        .bind(event_type)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Redrives a single dead-lettered event back to pending.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn redrive_by_id(&self, id: EventId) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET status = 'PENDING',
                retry_count = 0,
                last_error = NULL,
                processed_at = NULL,
                visible_at = NOW()
            WHERE status = 'DEAD_LETTER' AND id = $1
            ",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Counts events currently in the given status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self, status: EventStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE status = $1")
            .bind(status)
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }

    /// Pending events awaiting relay.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn pending_count(&self) -> Result<i64> {
        self.count_by_status(EventStatus::Pending).await
    }

    /// Events currently held under a lease.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn processing_count(&self) -> Result<i64> {
        self.count_by_status(EventStatus::Processing).await
    }

    /// Successfully relayed events still within retention.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn completed_count(&self) -> Result<i64> {
        self.count_by_status(EventStatus::Completed).await
    }

    /// Dead-lettered events awaiting operator redrive.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn dead_letter_count(&self) -> Result<i64> {
        self.count_by_status(EventStatus::DeadLetter).await
    }

    /// Age in seconds of the oldest pending event, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn oldest_pending_age_seconds(&self) -> Result<Option<i64>> {
        let age: Option<i64> = sqlx::query_scalar(
            r"
            SELECT EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT
            FROM outbox
            WHERE status = 'PENDING'
            ",
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(age)
    }

    /// Finds an event by primary key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: EventId) -> Result<Option<OutboxEvent>> {
        let event = sqlx::query_as::<_, OutboxEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Finds an event by tracking id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_tracking_id(
        &self,
        tracking_id: TrackingId,
    ) -> Result<Option<OutboxEvent>> {
        let event = sqlx::query_as::<_, OutboxEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox WHERE tracking_id = $1"
        ))
        .bind(tracking_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Lists events in a status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_status(
        &self,
        status: EventStatus,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>> {
        let events = sqlx::query_as::<_, OutboxEvent>(&format!(
            r"
            SELECT {EVENT_COLUMNS} FROM outbox
            WHERE status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "
        ))
        .bind(status)
        .bind(limit.clamp(1, MAX_PAGE_SIZE))
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Cursor-paginated listing, newest first.
    ///
    /// With `after = X` the page holds the rows immediately above the
    /// cursor (`id > X`); with `before = X` or no cursor, the rows below it.
    /// One extra row is requested to derive `has_more`, keeping pages
    /// stable under concurrent inserts.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_recent(&self, query: RecentQuery) -> Result<RecentPage> {
        let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
        let probe = limit + 1;

        if let Some(after) = query.after {
            let mut events = sqlx::query_as::<_, OutboxEvent>(&format!(
                r"
                SELECT {EVENT_COLUMNS} FROM outbox
                WHERE id > $1
                ORDER BY id ASC
                LIMIT $2
                "
            ))
            .bind(after)
            .bind(probe)
            .fetch_all(&*self.pool)
            .await?;

            let has_more = events.len() as i64 > limit;
            events.truncate(limit as usize);
            events.reverse();

            return Ok(RecentPage { events, has_more });
        }

        let mut events = if let Some(before) = query.before {
            sqlx::query_as::<_, OutboxEvent>(&format!(
                r"
                SELECT {EVENT_COLUMNS} FROM outbox
                WHERE id < $1
                ORDER BY id DESC
                LIMIT $2
                "
            ))
            .bind(before)
            .bind(probe)
            .fetch_all(&*self.pool)
            .await?
        } else {
            sqlx::query_as::<_, OutboxEvent>(&format!(
                r"
                SELECT {EVENT_COLUMNS} FROM outbox
                ORDER BY id DESC
                LIMIT $1
                "
            ))
            .bind(probe)
            .fetch_all(&*self.pool)
            .await?
        };

        let has_more = events.len() as i64 > limit;
        events.truncate(limit as usize);

        Ok(RecentPage { events, has_more })
    }

    /// Per-event-type aggregates over the dead-letter population.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn dead_letter_stats(&self) -> Result<Vec<DeadLetterStat>> {
        let stats = sqlx::query_as::<_, DeadLetterStat>(
            r"
            SELECT event_type,
                   COUNT(*) AS count,
                   EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT AS oldest_age_seconds,
                   EXTRACT(EPOCH FROM (NOW() - MAX(created_at)))::BIGINT AS newest_age_seconds,
                   (ARRAY_AGG(DISTINCT LEFT(last_error, 160))
                        FILTER (WHERE last_error IS NOT NULL))[1:3] AS error_samples
            FROM outbox
            WHERE status = 'DEAD_LETTER'
            GROUP BY event_type
            ORDER BY count DESC, event_type ASC
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(stats)
    }
}

/// Truncates an error message to the persisted limit on a char boundary.
fn truncate_error(error: &str) -> &str {
    if error.len() <= MAX_ERROR_LEN {
        return error;
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}
