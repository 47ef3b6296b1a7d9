//! Session settings, read from an optional TOML file.
//!
//! Every field has a default, so an empty file (or none at all) yields the
//! stock capture setup:
//!
//! ```toml
//! client_process = "CaptureClient"
//! server_process = "CaptureServer"
//! version = "1"
//! heartbeat_hz = 5.0
//! never_arrived_timeout_secs = 20.0
//! lost_timeout_secs = 5.0
//! ```

use serde::{Deserialize, Serialize};
use situate_core::HeartbeatThresholds;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Process name the capture client registers under.
    pub client_process: String,
    /// Process name the capture server registers under.
    pub server_process: String,
    /// Both sides must advertise the same version.
    pub version: String,
    /// Name of the server's heartbeat stream.
    pub heartbeat_stream: String,
    pub heartbeat_hz: f64,
    pub never_arrived_timeout_secs: f64,
    pub lost_timeout_secs: f64,
    /// Keep running when heartbeats stop after having arrived.
    pub ignore_heartbeat_loss: bool,
    pub clock_sync_timeout_secs: f64,
    /// Interface the client's clock and stream endpoints listen on.
    pub bind_host: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            client_process: "CaptureClient".to_string(),
            server_process: "CaptureServer".to_string(),
            version: "1".to_string(),
            heartbeat_stream: "Heartbeat".to_string(),
            heartbeat_hz: 5.0,
            never_arrived_timeout_secs: 20.0,
            lost_timeout_secs: 5.0,
            ignore_heartbeat_loss: false,
            clock_sync_timeout_secs: 10.0,
            bind_host: "0.0.0.0".to_string(),
        }
    }
}

impl SessionSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` when given, otherwise use the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, SettingsError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    pub fn thresholds(&self) -> HeartbeatThresholds {
        HeartbeatThresholds {
            never_arrived_timeout: secs(self.never_arrived_timeout_secs),
            lost_timeout: secs(self.lost_timeout_secs),
            ignore_loss: self.ignore_heartbeat_loss,
        }
    }

    pub fn heartbeat_period(&self) -> Duration {
        if self.heartbeat_hz > 0.0 {
            secs(1.0 / self.heartbeat_hz)
        } else {
            Duration::from_millis(200)
        }
    }

    pub fn clock_sync_wait(&self) -> Duration {
        secs(self.clock_sync_timeout_secs)
    }
}

/// Negative or non-finite values read as zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_means_defaults() {
        let settings: SessionSettings = toml::from_str("").unwrap();
        assert_eq!(settings, SessionSettings::default());
        assert_eq!(settings.heartbeat_period(), Duration::from_millis(200));
        assert_eq!(settings.thresholds(), HeartbeatThresholds::default());
    }

    #[test]
    fn partial_override() {
        let settings: SessionSettings = toml::from_str(
            r#"
            version = "2"
            lost_timeout_secs = 1.5
            ignore_heartbeat_loss = true
            "#,
        )
        .unwrap();
        assert_eq!(settings.version, "2");
        assert_eq!(settings.client_process, "CaptureClient");
        let thresholds = settings.thresholds();
        assert_eq!(thresholds.lost_timeout, Duration::from_millis(1500));
        assert!(thresholds.ignore_loss);
    }

    #[test]
    fn bad_durations_clamp_to_zero() {
        let settings = SessionSettings {
            clock_sync_timeout_secs: -3.0,
            heartbeat_hz: 0.0,
            ..Default::default()
        };
        assert_eq!(settings.clock_sync_wait(), Duration::ZERO);
        assert_eq!(settings.heartbeat_period(), Duration::from_millis(200));
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = std::env::temp_dir().join("situate-settings-does-not-exist.toml");
        assert!(matches!(
            SessionSettings::load(&path),
            Err(SettingsError::Read { .. })
        ));
        assert!(SessionSettings::load_or_default(None).is_ok());
    }
}
