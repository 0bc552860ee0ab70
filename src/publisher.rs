//! Default HTTP webhook transport for the daemon.
//!
//! POSTs the event envelope as JSON to a configured destination. Status
//! codes drive the retry decision: 2xx succeeds, 408/429 and 5xx are
//! transient, every other 4xx is permanent. Transport-level failures
//! (timeouts, refused connections, DNS) are always transient.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use outbox_core::OutboxEvent;
use outbox_relay::{PublishError, Publisher};
use reqwest::StatusCode;
use tracing::debug;

/// Header carrying the idempotency key to the destination.
const TRACKING_HEADER: &str = "X-Tracking-Id";

/// Publisher delivering events over HTTP.
pub struct WebhookPublisher {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl WebhookPublisher {
    /// Creates a publisher for the given destination.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or the client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = url.parse().with_context(|| format!("invalid publisher URL: {url}"))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("outboxd/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;

        Ok(Self { client, url })
    }

    fn envelope(event: &OutboxEvent) -> serde_json::Value {
        serde_json::json!({
            "tracking_id": event.tracking_id,
            "aggregate_id": event.aggregate_id,
            "aggregate_type": event.aggregate_type,
            "event_type": event.event_type,
            "payload": event.payload(),
            "metadata": event.metadata(),
            "created_at": event.created_at,
        })
    }

    fn classify(status: StatusCode) -> Result<(), PublishError> {
        if status.is_success() {
            return Ok(());
        }

        let reason = format!("HTTP {status}");
        if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            Err(PublishError::transient(reason))
        } else {
            Err(PublishError::permanent(reason))
        }
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(TRACKING_HEADER, event.tracking_id.to_string())
            .json(&Self::envelope(event))
            .send()
            .await
            .map_err(|e| PublishError::transient(e.to_string()))?;

        let status = response.status();
        debug!(
            tracking_id = %event.tracking_id,
            event_type = %event.event_type,
            status = status.as_u16(),
            "webhook publish attempted"
        );

        Self::classify(status)
    }
}
