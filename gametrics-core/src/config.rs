//! Configuration loading and management
//!
//! The SDK is normally configured in code by the host game; a TOML file can
//! be used instead (`Config::load_from`). Paths follow the XDG Base
//! Directory Specification:
//! - Data (event queue database): `$XDG_DATA_HOME/gametrics/`
//! - State/Logs: `$XDG_STATE_HOME/gametrics/`

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Game key supplied at registration; routes events to the right account
    pub app_key: String,

    /// Secret key supplied at registration; signs every upload
    pub secret_key: String,

    /// Host application version attached to every event
    #[serde(default = "default_build")]
    pub build: String,

    /// Collector base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Custom user id; overrides the generated one
    #[serde(default)]
    pub user_id: Option<String>,

    /// Stable device identifier the user id is derived from when no custom
    /// id is set. Falls back to a random UUID when absent.
    #[serde(default)]
    pub device_id: Option<String>,

    /// Milliseconds between automatic batch uploads
    #[serde(default = "default_send_interval")]
    pub send_interval_ms: u64,

    /// Milliseconds between connectivity polls while offline
    #[serde(default = "default_network_poll_interval")]
    pub network_poll_interval_ms: u64,

    /// Milliseconds of inactivity after `stop_session` before a new session
    /// id is generated
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,

    /// Maximum number of locally stored events; 0 = unlimited. Further
    /// events are silently dropped once the cap is reached.
    #[serde(default)]
    pub max_event_storage: u32,

    /// Keep events queued while offline (true) or discard them when a batch
    /// comes due with no connection (false)
    #[serde(default = "default_true")]
    pub cache_locally: bool,

    /// Upload batches automatically on the send interval; when false only
    /// `flush()` sends
    #[serde(default = "default_true")]
    pub auto_batch: bool,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Minimum milliseconds between FPS start/stop for an average to count
    #[serde(default = "default_minimum_fps_period")]
    pub minimum_fps_period_ms: u64,

    /// Average FPS below this logs an additional critical-FPS event
    #[serde(default = "default_critical_fps_limit")]
    pub critical_fps_limit: u32,

    /// Event queue database path; defaults to the XDG data directory
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Device/OS attributes reported with the one-time session info events
    #[serde(default)]
    pub device: DeviceInfo,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Host-supplied device and OS attributes.
///
/// The SDK has no platform APIs of its own; whatever the host fills in here
/// is reported verbatim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceInfo {
    /// e.g. "android", "ios"
    pub platform: Option<String>,
    /// Device model, e.g. "Pixel 9"
    pub device: Option<String>,
    /// OS name + major version, e.g. "Android 16"
    pub os_major: Option<String>,
    /// Full OS version string
    pub os_minor: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    /// Development logging: every event creation and batch is logged
    pub fn verbose() -> Self {
        Self {
            level: "debug".to_string(),
        }
    }

    /// Release logging: warnings and errors only (the default)
    pub fn release() -> Self {
        Self::default()
    }
}

fn default_build() -> String {
    "unknown".to_string()
}

fn default_base_url() -> String {
    "https://api.gameanalytics.example/1".to_string()
}

fn default_send_interval() -> u64 {
    20_000
}

fn default_network_poll_interval() -> u64 {
    60_000
}

fn default_session_timeout() -> u64 {
    20_000
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30
}

fn default_minimum_fps_period() -> u64 {
    5_000
}

fn default_critical_fps_limit() -> u32 {
    30
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    /// Create a configuration with the given credentials and all defaults
    pub fn new(app_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            secret_key: secret_key.into(),
            build: default_build(),
            base_url: default_base_url(),
            user_id: None,
            device_id: None,
            send_interval_ms: default_send_interval(),
            network_poll_interval_ms: default_network_poll_interval(),
            session_timeout_ms: default_session_timeout(),
            max_event_storage: 0,
            cache_locally: true,
            auto_batch: true,
            request_timeout_secs: default_request_timeout(),
            minimum_fps_period_ms: default_minimum_fps_period(),
            critical_fps_limit: default_critical_fps_limit(),
            database_path: None,
            device: DeviceInfo::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning an error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.app_key.is_empty() {
            return Err(Error::Config("app_key must not be empty".to_string()));
        }
        if self.secret_key.is_empty() {
            return Err(Error::Config("secret_key must not be empty".to_string()));
        }
        if self.base_url.is_empty() {
            return Err(Error::Config("base_url must not be empty".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the data directory path (for the event queue database)
    ///
    /// `$XDG_DATA_HOME/gametrics/` (~/.local/share/gametrics/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("gametrics")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/gametrics/` (~/.local/state/gametrics/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("gametrics")
    }

    /// Returns the event queue database path, honoring the override
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("events.db"))
    }
}
