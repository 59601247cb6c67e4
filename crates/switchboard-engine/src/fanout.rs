//! Outbound side of the engine: the live broadcast channel and webhook
//! delivery. Failures here are logged by the caller and never reach an API
//! response.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::trace;

use switchboard_core::events::DomainEvent;
use switchboard_core::SessionId;
use switchboard_settings::WebhookSettings;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("webhook request failed: {0}")]
    Request(String),

    #[error("webhook endpoint returned {0}")]
    Status(u16),
}

/// Live broadcast of domain events to any number of subscribers.
/// Slow subscribers lag and lose the oldest events; publishers never wait.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<DomainEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: DomainEvent) -> usize {
        let name = event.event_name();
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                trace!(event = name, "no live subscribers");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Webhook sink. Delivery and retry semantics belong to the implementation.
#[async_trait]
pub trait WebhookDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        session_id: &SessionId,
        event: &str,
        payload: Value,
    ) -> Result<(), DeliveryError>;
}

/// Used when no webhook URL is configured.
pub struct NoopWebhook;

#[async_trait]
impl WebhookDispatcher for NoopWebhook {
    async fn dispatch(&self, _: &SessionId, _: &str, _: Value) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// POSTs `{sessionId, event, data, timestamp}` to a single endpoint.
pub struct HttpWebhookDispatcher {
    client: reqwest::Client,
    url: String,
}

impl HttpWebhookDispatcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("switchboard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeliveryError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// `None` when the settings carry no URL.
    pub fn from_settings(settings: &WebhookSettings) -> Result<Option<Self>, DeliveryError> {
        settings
            .url
            .as_ref()
            .map(|url| Self::new(url.clone(), Duration::from_millis(settings.timeout_ms)))
            .transpose()
    }
}

#[async_trait]
impl WebhookDispatcher for HttpWebhookDispatcher {
    async fn dispatch(
        &self,
        session_id: &SessionId,
        event: &str,
        payload: Value,
    ) -> Result<(), DeliveryError> {
        let body = json!({
            "sessionId": session_id,
            "event": event,
            "data": payload,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        Ok(())
    }
}
