//! Repository for consumer-side deduplication records.
//!
//! The inbox is the mirror image of the outbox: consumers record each
//! `(tracking_id, consumer_id)` pair they have handled so the at-least-once
//! relay never makes them act twice. The insert is race-safe by
//! construction: when two consumer instances mark simultaneously, exactly
//! one wins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{InboxRecord, TrackingId},
};

/// Repository for inbox deduplication operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Whether any consumer has recorded this tracking id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn is_processed(&self, tracking_id: TrackingId) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM inbox WHERE tracking_id = $1)")
                .bind(tracking_id)
                .fetch_one(&*self.pool)
                .await?;

        Ok(exists)
    }

    /// Records that `consumer_id` has processed `tracking_id`.
    ///
    /// Returns `true` iff this call inserted the record. A `false` return
    /// means a peer already holds the pair; the caller must skip the work
    /// on the assumption the peer does it (or has done it).
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails for reasons other than the
    /// uniqueness conflict.
    pub async fn mark_processed(
        &self,
        tracking_id: TrackingId,
        consumer_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO inbox (tracking_id, consumer_id)
            VALUES ($1, $2)
            ON CONFLICT (tracking_id, consumer_id) DO NOTHING
            ",
        )
        .bind(tracking_id)
        .bind(consumer_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Fetches the deduplication record for a tracking id, if present.
    ///
    /// When several consumers recorded the same tracking id the earliest
    /// record is returned.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn get_record(&self, tracking_id: TrackingId) -> Result<Option<InboxRecord>> {
        let record = sqlx::query_as::<_, InboxRecord>(
            r"
            SELECT id, tracking_id, consumer_id, processed_at
            FROM inbox
            WHERE tracking_id = $1
            ORDER BY processed_at ASC
            LIMIT 1
            ",
        )
        .bind(tracking_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Deletes records older than the retention cutoff.
    ///
    /// Inbox retention must be at least as long as outbox retention, or a
    /// redelivered event could slip past deduplication.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM inbox WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
