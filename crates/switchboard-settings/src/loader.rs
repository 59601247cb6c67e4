//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SwitchboardSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `SWITCHBOARD_*` environment overrides (highest priority)
//! 4. Validate values that would otherwise fail at runtime

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::SwitchboardSettings;

/// Resolve the settings file path: `$SWITCHBOARD_CONFIG`, else `./switchboard.json`.
pub fn settings_path() -> PathBuf {
    std::env::var("SWITCHBOARD_CONFIG")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("switchboard.json"))
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SwitchboardSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SwitchboardSettings> {
    let mut settings = read_layers(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn read_layers(path: &Path) -> Result<SwitchboardSettings> {
    let defaults = serde_json::to_value(SwitchboardSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning and the file/default value is kept.
pub fn apply_env_overrides(settings: &mut SwitchboardSettings) {
    // ── Sessions ────────────────────────────────────────────────────
    if let Some(v) = read_env_string("SWITCHBOARD_CREDENTIALS_DIR") {
        settings.sessions.credentials_dir = v;
    }
    if let Some(v) = read_env_u64("SWITCHBOARD_RECONNECT_DELAY_MS", 0, 3_600_000) {
        settings.sessions.reconnect_delay_ms = v;
    }
    if let Some(v) = read_env_u64("SWITCHBOARD_OPERATION_SPACING_MS", 0, 3_600_000) {
        settings.sessions.operation_spacing_ms = v;
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = read_env_string("SWITCHBOARD_DB_PATH") {
        settings.store.db_path = v;
    }

    // ── Integrations ────────────────────────────────────────────────
    if let Some(v) = read_env_bool("SWITCHBOARD_GEOCODER_ENABLED") {
        settings.geocoder.enabled = v;
    }
    if let Some(v) = read_env_string("SWITCHBOARD_WEBHOOK_URL") {
        settings.webhook.url = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("SWITCHBOARD_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Reject values that cannot be used to build channels or clients.
pub fn validate(settings: &SwitchboardSettings) -> Result<()> {
    if settings.sessions.broadcast_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "sessions.broadcastCapacity must be greater than 0".to_string(),
        ));
    }
    if settings.sessions.credentials_dir.trim().is_empty() {
        return Err(SettingsError::InvalidValue(
            "sessions.credentialsDir must not be empty".to_string(),
        ));
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
