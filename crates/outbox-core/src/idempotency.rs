//! Consumer-side idempotent execution helper.
//!
//! Wraps the inbox repository's race-safe mark in a check -> mark -> run
//! sequence. The mark is deliberately not rolled back when the operation
//! fails: at-least-once delivery is preserved across crashes, so the
//! operation itself must be idempotent. Consumers are expected to forward
//! the tracking id as an idempotency key to downstream APIs.

use std::{future::Future, sync::Arc};

use crate::{error::Result, models::TrackingId, storage::inbox};

/// Result of an idempotent execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    /// This caller won the mark and ran the operation.
    Executed(T),

    /// The pair was already marked (here or by a peer); the operation was
    /// not run.
    Skipped,
}

impl<T> Outcome<T> {
    /// Whether the operation ran in this call.
    pub const fn was_executed(&self) -> bool {
        matches!(self, Self::Executed(_))
    }
}

/// Executes an operation at most once per `(tracking_id, consumer_id)`.
pub struct IdempotentExecutor {
    inbox: Arc<inbox::Repository>,
    consumer_id: String,
}

impl IdempotentExecutor {
    /// Creates an executor for a logical consumer.
    pub fn new(inbox: Arc<inbox::Repository>, consumer_id: impl Into<String>) -> Self {
        Self { inbox, consumer_id: consumer_id.into() }
    }

    /// The logical consumer this executor marks on behalf of.
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Runs `operation` iff this call wins the deduplication mark.
    ///
    /// When two instances race on the same tracking id, exactly one
    /// executes; the loser returns `Outcome::Skipped` and must assume the
    /// winner does the work.
    ///
    /// # Errors
    ///
    /// Returns error if the inbox lookup or mark fails. The operation's own
    /// outcome is carried inside `Outcome::Executed` untouched.
    pub async fn execute<F, Fut, T>(
        &self,
        tracking_id: TrackingId,
        operation: F,
    ) -> Result<Outcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.inbox.is_processed(tracking_id).await? {
            return Ok(Outcome::Skipped);
        }

        if !self.inbox.mark_processed(tracking_id, &self.consumer_id).await? {
            return Ok(Outcome::Skipped);
        }

        Ok(Outcome::Executed(operation().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_reports_execution() {
        assert!(Outcome::Executed(42).was_executed());
        assert!(!Outcome::<i32>::Skipped.was_executed());
    }
}
