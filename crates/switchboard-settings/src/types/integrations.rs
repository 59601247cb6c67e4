//! Outbound collaborators: reverse geocoding and webhook delivery.

use serde::{Deserialize, Serialize};

/// Reverse-geocoding lookups for location messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeocoderSettings {
    pub enabled: bool,
    /// Nominatim-compatible endpoint root.
    pub base_url: String,
    /// Nominatim rejects requests without an identifying agent.
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl Default for GeocoderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: format!("switchboard/{}", env!("CARGO_PKG_VERSION")),
            timeout_ms: 10_000,
        }
    }
}

/// Webhook delivery target.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookSettings {
    /// No webhooks are sent when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 10_000,
        }
    }
}
