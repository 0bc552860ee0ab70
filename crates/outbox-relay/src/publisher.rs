//! The publisher port consumed by the relay.
//!
//! The relay treats the external transport (broker, webhook, third-party
//! API) as an opaque capability behind this trait. Implementations live
//! outside the core; tests script one.

use async_trait::async_trait;
use outbox_core::OutboxEvent;

use crate::error::PublishError;

/// Capability to deliver one event to an external destination.
///
/// The contract is at-least-once: the relay may invoke `publish` more than
/// once for the same event (after a crash, a lost lease, or a reaped
/// abandonment), and consumers deduplicate on the tracking id.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Delivers the event.
    ///
    /// # Errors
    ///
    /// `PublishError::Transient` failures are retried within the event's
    /// budget; `PublishError::Permanent` failures dead-letter immediately.
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError>;

    /// Whether the destination currently looks reachable.
    ///
    /// Advisory only; the relay keeps claiming regardless and lets publish
    /// outcomes drive the lifecycle.
    fn is_healthy(&self) -> bool {
        true
    }
}
