use serde::{Deserialize, Serialize};

/// Session lifecycle tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Root directory for per-session credential material.
    pub credentials_dir: String,
    /// Fixed delay before the single reconnect attempt after a transient close.
    pub reconnect_delay_ms: u64,
    /// Minimum spacing between two mutating operations on one session.
    pub operation_spacing_ms: u64,
    /// Capacity of the live broadcast channel.
    pub broadcast_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            credentials_dir: "auth_sessions".to_string(),
            reconnect_delay_ms: 5_000,
            operation_spacing_ms: 10_000,
            broadcast_capacity: 1024,
        }
    }
}
