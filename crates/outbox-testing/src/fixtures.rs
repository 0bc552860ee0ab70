//! Fixture builders for outbox events.

use outbox_core::{
    storage::outbox_events::Repository, NewOutboxEvent, OutboxEvent, Result, TrackingId,
};

/// Fluent builder producing `NewOutboxEvent` fixtures.
///
/// Defaults describe a plausible order-created event; override what the
/// test cares about.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event: NewOutboxEvent,
}

impl EventBuilder {
    /// Creates a builder with default fixture values.
    pub fn new() -> Self {
        Self {
            event: NewOutboxEvent::new(
                "order-1",
                "order",
                "OrderCreated",
                serde_json::json!({"order_id": 1, "total_cents": 1299}),
            ),
        }
    }

    /// Sets an explicit tracking id.
    #[must_use]
    pub fn tracking_id(mut self, tracking_id: TrackingId) -> Self {
        self.event.tracking_id = Some(tracking_id);
        self
    }

    /// Sets the aggregate id.
    #[must_use]
    pub fn aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.event.aggregate_id = aggregate_id.into();
        self
    }

    /// Sets the aggregate type.
    #[must_use]
    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.event.aggregate_type = aggregate_type.into();
        self
    }

    /// Sets the event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event.event_type = event_type.into();
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.event.payload = payload;
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.event.metadata = metadata;
        self
    }

    /// Sets the retry cap.
    #[must_use]
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.event.max_retries = Some(max_retries);
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> NewOutboxEvent {
        self.event
    }

    /// Builds and inserts, returning the persisted row.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert(self, repository: &Repository) -> Result<OutboxEvent> {
        repository.insert(&self.build()).await
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}
