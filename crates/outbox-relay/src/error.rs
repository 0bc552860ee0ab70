//! Error types for relay operations.
//!
//! Splits the publisher's failure modes (transient vs permanent, driving the
//! retry/dead-letter decision) from the relay's own operational errors.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Failure reported by a publisher implementation.
///
/// The variant decides the event's fate: transient failures count against
/// the retry budget, permanent failures divert straight to the dead-letter
/// state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// Temporary condition; the delivery may succeed later.
    #[error("transient publish failure: {reason}")]
    Transient {
        /// Failure reason recorded as the event's `last_error`.
        reason: String,
    },

    /// The destination will never accept this event as-is.
    #[error("permanent publish failure: {reason}")]
    Permanent {
        /// Failure reason recorded as the event's `last_error`.
        reason: String,
    },
}

impl PublishError {
    /// Creates a transient failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient { reason: reason.into() }
    }

    /// Creates a permanent failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent { reason: reason.into() }
    }

    /// Whether the failure counts against the retry budget rather than
    /// dead-lettering immediately.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// The failure reason.
    pub fn reason(&self) -> &str {
        match self {
            Self::Transient { reason } | Self::Permanent { reason } => reason,
        }
    }
}

/// Operational errors raised by the relay itself.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Database operation failed.
    #[error("database error: {message}")]
    Database {
        /// Database error message.
        message: String,
    },

    /// Relay configuration is invalid.
    #[error("invalid relay configuration: {message}")]
    Configuration {
        /// Configuration error message.
        message: String,
    },

    /// Workers did not finish within the shutdown deadline.
    #[error("shutdown timed out after {timeout:?}, abandoning in-flight events to the reaper")]
    ShutdownTimeout {
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanic {
        /// Worker that panicked.
        worker_id: usize,
        /// Join error message.
        message: String,
    },
}

impl RelayError {
    /// Creates a database error from a message.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a configuration error from a message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}

impl From<outbox_core::CoreError> for RelayError {
    fn from(err: outbox_core::CoreError) -> Self {
        Self::Database { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        assert!(PublishError::transient("timeout").is_retryable());
        assert!(!PublishError::permanent("schema invalid").is_retryable());
    }

    #[test]
    fn reason_preserved() {
        assert_eq!(PublishError::transient("broker unavailable").reason(), "broker unavailable");
        assert_eq!(PublishError::permanent("schema invalid").reason(), "schema invalid");
    }

    #[test]
    fn core_errors_map_to_database() {
        let err = RelayError::from(outbox_core::CoreError::Database("connection lost".into()));
        assert!(matches!(err, RelayError::Database { .. }));
    }
}
