//! Database access layer implementing the repository pattern for the
//! outbox and inbox tables.
//!
//! All database operations go through these repositories. Direct SQL
//! outside this module is forbidden: the repository layer is the only
//! writer of event rows, and its conditional updates are what make the
//! fencing-token protocol sound.

use std::sync::Arc;

use sqlx::PgPool;

pub mod inbox;
pub mod outbox_events;
pub mod schema;

use crate::error::Result;

/// Container for the repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for outbox event operations.
    pub outbox_events: Arc<outbox_events::Repository>,

    /// Repository for consumer-side deduplication records.
    pub inbox: Arc<inbox::Repository>,
}

impl Storage {
    /// Creates a new storage instance over the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            outbox_events: Arc::new(outbox_events::Repository::new(pool.clone())),
            inbox: Arc::new(inbox::Repository::new(pool)),
        }
    }

    /// Performs a lightweight connectivity check.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.outbox_events.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }
}
