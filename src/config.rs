// Coordinator configuration
//
// One JSON document with a section per component. Every field has a default, so a
// partial file (or no file at all) is valid.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audio::devices::monitor::{MAX_POLL_INTERVAL, MIN_POLL_INTERVAL};
use crate::audio::devices::DeviceMonitorConfig;
use crate::audio::error::ConfigError;
use crate::audio::playback::PlaybackConfig;
use crate::audio::recording::RecordingGuardConfig;
use crate::audio::streams::StreamLifecycleConfig;

pub const CONFIG_DIR_NAME: &str = "voice-coordinator";
pub const CONFIG_FILE_NAME: &str = "audio.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set
    pub directive: String,
    /// Enable the verbose `audio_debug!` / `device_debug!` output
    pub audio_debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directive: "info".to_string(),
            audio_debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub monitor: DeviceMonitorConfig,
    pub streams: StreamLifecycleConfig,
    pub playback: PlaybackConfig,
    pub recording: RecordingGuardConfig,
    pub logging: LoggingConfig,
    pub event_bus_capacity: usize,
    /// Open the default input and record until shutdown
    pub capture_on_start: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            monitor: DeviceMonitorConfig::default(),
            streams: StreamLifecycleConfig::default(),
            playback: PlaybackConfig::default(),
            recording: RecordingGuardConfig::default(),
            logging: LoggingConfig::default(),
            event_bus_capacity: 256,
            capture_on_start: true,
        }
    }
}

impl CoordinatorConfig {
    /// Where `load_default` looks
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Load from the platform config directory, falling back to defaults when absent
    pub fn load_default() -> anyhow::Result<Self> {
        let Some(path) = Self::default_path() else {
            warn!("⚠️ No platform config directory, using default configuration");
            return Ok(Self::default());
        };
        if !path.exists() {
            info!("📄 No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let config = Self::load(&path).with_context(|| format!("Failed to load {}", path.display()))?;
        info!("📄 Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Clamp soft limits, reject values that cannot work
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let min_poll = MIN_POLL_INTERVAL.as_millis() as u64;
        let max_poll = MAX_POLL_INTERVAL.as_millis() as u64;
        let clamped = self.monitor.poll_interval_ms.clamp(min_poll, max_poll);
        if clamped != self.monitor.poll_interval_ms {
            warn!(
                "⚠️ monitor.poll_interval_ms {} out of range, using {}",
                self.monitor.poll_interval_ms, clamped
            );
            self.monitor.poll_interval_ms = clamped;
        }

        if self.monitor.debounce_ms == 0 {
            return Err(invalid("monitor.debounce_ms", "must be greater than zero"));
        }
        if self.streams.max_retries == 0 {
            return Err(invalid("streams.max_retries", "at least one attempt is required"));
        }
        if !self.streams.bt_backoff_multiplier.is_finite() || self.streams.bt_backoff_multiplier < 1.0 {
            return Err(invalid("streams.bt_backoff_multiplier", "must be a finite value >= 1.0"));
        }
        if self.streams.close_confirm_timeout_ms == 0 {
            return Err(invalid("streams.close_confirm_timeout_ms", "must be greater than zero"));
        }
        if self.playback.watchdog_timeout_ms == 0 {
            return Err(invalid("playback.watchdog_timeout_ms", "must be greater than zero"));
        }
        if self.recording.hardware_stop_timeout_ms == 0 {
            return Err(invalid("recording.hardware_stop_timeout_ms", "must be greater than zero"));
        }
        if self.event_bus_capacity == 0 {
            return Err(invalid("event_bus_capacity", "must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::error::{DEVICE_UNAVAILABLE, INTERNAL_HOST_ERROR};
    use crate::audio::playback::WatchdogPolicy;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.monitor.debounce_ms, 300);
        assert_eq!(config.streams.bt_settle_ms, 2_500);
        assert_eq!(config.streams.wired_settle_ms, 300);
        assert_eq!(config.streams.backoff_base_ms, 500);
        assert_eq!(config.streams.bt_backoff_multiplier, 2.0);
        assert_eq!(
            config.streams.transient_error_codes,
            vec![DEVICE_UNAVAILABLE, INTERNAL_HOST_ERROR]
        );
        assert_eq!(config.playback.watchdog_timeout_ms, 10_000);
        assert_eq!(config.playback.watchdog_policy, WatchdogPolicy::ForceComplete);
        assert_eq!(config.recording.grace_delay_ms, 100);
        assert!(config.capture_on_start);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "monitor": {{ "poll_interval_ms": 250 }},
                "playback": {{ "watchdog_policy": "reconcile_with_producer" }},
                "streams": {{ "bt_settle_ms": 4000 }}
            }}"#
        )
        .unwrap();

        let config = CoordinatorConfig::load(file.path()).unwrap();
        // Clamped into the 1-5 s range
        assert_eq!(config.monitor.poll_interval_ms, 1_000);
        assert_eq!(config.monitor.debounce_ms, 300);
        assert_eq!(config.playback.watchdog_policy, WatchdogPolicy::ReconcileWithProducer);
        assert_eq!(config.streams.bt_settle_ms, 4_000);
        assert_eq!(config.streams.max_retries, 3);
    }

    #[test]
    fn test_rejects_unusable_values() {
        let err = CoordinatorConfig::from_json_str(r#"{"streams": {"bt_backoff_multiplier": 0.5}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "streams.bt_backoff_multiplier", .. }));

        let err = CoordinatorConfig::from_json_str(r#"{"streams": {"max_retries": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "streams.max_retries", .. }));

        let err = CoordinatorConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CoordinatorConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);

        let mut config = CoordinatorConfig::default();
        config.logging.audio_debug = true;
        config.streams.max_retries = 5;
        config.save(&path).unwrap();

        let loaded = CoordinatorConfig::load(&path).unwrap();
        assert!(loaded.logging.audio_debug);
        assert_eq!(loaded.streams.max_retries, 5);
    }
}
