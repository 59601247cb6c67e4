use std::path::PathBuf;
use std::time::Duration;

use switchboard_settings::SwitchboardSettings;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Root of the per-session credential directories.
    pub credentials_dir: PathBuf,
    pub reconnect_delay: Duration,
    pub operation_spacing: Duration,
    pub broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&SwitchboardSettings::default())
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &SwitchboardSettings) -> Self {
        let s = &settings.sessions;
        Self {
            credentials_dir: PathBuf::from(&s.credentials_dir),
            reconnect_delay: Duration::from_millis(s.reconnect_delay_ms),
            operation_spacing: Duration::from_millis(s.operation_spacing_ms),
            broadcast_capacity: s.broadcast_capacity.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let config = EngineConfig::default();
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.operation_spacing, Duration::from_secs(10));
        assert_eq!(config.credentials_dir, PathBuf::from("auth_sessions"));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut settings = SwitchboardSettings::default();
        settings.sessions.broadcast_capacity = 0;
        assert_eq!(EngineConfig::from_settings(&settings).broadcast_capacity, 1);
    }
}
