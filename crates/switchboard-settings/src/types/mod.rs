//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section is `#[serde(default)]`
//! so a settings file only has to name the values it changes.

mod integrations;
mod sessions;

pub use integrations::*;
pub use sessions::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "sessions": { "reconnectDelayMs": 2000 },
///   "webhook": { "url": "https://hooks.example.com/wa" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwitchboardSettings {
    pub sessions: SessionSettings,
    pub store: StoreSettings,
    pub geocoder: GeocoderSettings,
    pub webhook: WebhookSettings,
    pub logging: LoggingSettings,
}

/// Durable store location.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// SQLite database path.
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "switchboard.db".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Persist WARN and ERROR records to SQLite.
    pub persist_warnings: bool,
    /// Database for persisted log records.
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            persist_warnings: true,
            log_db_path: "switchboard-logs.db".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_serialize_camel_case() {
        let v = serde_json::to_value(SwitchboardSettings::default()).unwrap();
        assert_eq!(v["sessions"]["reconnectDelayMs"], 5000);
        assert_eq!(v["sessions"]["operationSpacingMs"], 10_000);
        assert_eq!(v["store"]["dbPath"], "switchboard.db");
        assert_eq!(v["logging"]["persistWarnings"], true);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: SwitchboardSettings =
            serde_json::from_str(r#"{"sessions": {"credentialsDir": "/var/lib/creds"}}"#).unwrap();
        assert_eq!(s.sessions.credentials_dir, "/var/lib/creds");
        assert_eq!(s.sessions.reconnect_delay_ms, 5000);
        assert!(s.geocoder.enabled);
        assert!(s.webhook.url.is_none());
    }
}
