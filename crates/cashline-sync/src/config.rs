//! # Sync Configuration
//!
//! Configuration management for the sync engine and its scheduler.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CASHLINE_DEVICE_ID=register-01                                     │
//! │     CASHLINE_REMOTE_URL=https://api.example.com/v1                     │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/cashline-pos/sync.toml (Linux)                           │
//! │     ~/Library/Application Support/com.cashline.pos/sync.toml (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     generated device id, 300s lease, 30s poll                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "register-01"
//! name = "Front Register"
//!
//! [remote]
//! base_url = "https://api.example.com/v1"
//! api_token = "..."
//! request_timeout_secs = 30
//!
//! [engine]
//! lock_timeout_secs = 300
//! max_attempts = 10      # 0 = retry a failed head forever
//! retention_days = 30    # 0 = keep finished commands
//!
//! [schedule]
//! enabled = true
//! poll_interval_secs = 30
//! initial_backoff_ms = 1000
//! max_backoff_secs = 300
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use cashline_core::{DEFAULT_LOCK_TIMEOUT_SECS, DEFAULT_MAX_ATTEMPTS};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
///
/// The device id doubles as the owner identity of the sync lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier.
    /// Generated (UUID v4) when not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Front Register").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "POS Register".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Remote Settings
// =============================================================================

/// Backend API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Base URL of the backend API, e.g. `https://api.example.com/v1`.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token sent with every request.
    #[serde(default)]
    pub api_token: Option<String>,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            base_url: None,
            api_token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Engine Settings
// =============================================================================

/// Sync engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Lease duration of the sync lock (seconds).
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Dispatches a failed head command gets before it is parked for an
    /// operator. 0 retries forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Finished commands older than this are deleted after a clean run.
    /// 0 disables cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_lock_timeout() -> u64 {
    DEFAULT_LOCK_TIMEOUT_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retention_days() -> u32 {
    30
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            lock_timeout_secs: default_lock_timeout(),
            max_attempts: default_max_attempts(),
            retention_days: default_retention_days(),
        }
    }
}

impl EngineSettings {
    /// Returns the lease duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

// =============================================================================
// Schedule Settings
// =============================================================================

/// When the scheduler runs the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    /// Run the engine periodically. Explicit triggers work either way.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between runs (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// First delay after a blocked or failed run (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound for the delay between retries (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    30
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    300
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        ScheduleSettings {
            enabled: true,
            poll_interval_secs: default_poll_interval(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Backend API settings.
    #[serde(default)]
    pub remote: RemoteSettings,

    /// Engine settings.
    #[serde(default)]
    pub engine: EngineSettings,

    /// Scheduler settings.
    #[serde(default)]
    pub schedule: ScheduleSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if let Some(ref url) = self.remote.base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(SyncError::InvalidUrl(format!(
                    "Remote URL must start with http:// or https://, got: {}",
                    url
                )));
            }
        }

        if self.engine.lock_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "lock_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.schedule.poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }

        if self.remote.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        // The lease is renewed around each command, so one remote call must
        // fit inside it.
        if self.engine.lock_timeout_secs <= self.remote.request_timeout_secs {
            return Err(SyncError::InvalidConfig(format!(
                "lock_timeout_secs ({}) must exceed request_timeout_secs ({})",
                self.engine.lock_timeout_secs, self.remote.request_timeout_secs
            )));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("CASHLINE_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("CASHLINE_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(url) = std::env::var("CASHLINE_REMOTE_URL") {
            debug!(url = %url, "Overriding remote URL from environment");
            self.remote.base_url = Some(url);
        }

        if let Ok(token) = std::env::var("CASHLINE_API_TOKEN") {
            self.remote.api_token = Some(token);
        }

        if let Ok(secs) = std::env::var("CASHLINE_LOCK_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.engine.lock_timeout_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid CASHLINE_LOCK_TIMEOUT_SECS"),
            }
        }

        if let Ok(secs) = std::env::var("CASHLINE_POLL_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.schedule.poll_interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid CASHLINE_POLL_INTERVAL_SECS"),
            }
        }

        if let Ok(n) = std::env::var("CASHLINE_MAX_ATTEMPTS") {
            match n.parse::<u32>() {
                Ok(n) => self.engine.max_attempts = n,
                Err(_) => warn!(value = %n, "Ignoring invalid CASHLINE_MAX_ATTEMPTS"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "cashline", "pos")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// Returns the default database path (`cashline.db` in the data dir).
    pub fn default_database_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "cashline", "pos")
            .map(|dirs| dirs.data_dir().join("cashline.db"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the remote base URL if configured.
    pub fn remote_url(&self) -> Option<&str> {
        self.remote.base_url.as_deref()
    }

    /// Returns the poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.poll_interval_secs)
    }
}
