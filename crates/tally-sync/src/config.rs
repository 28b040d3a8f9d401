//! # Replication Settings
//!
//! Resolved once at startup from three layers, each overriding the one
//! before it:
//!
//! ```text
//!   built-in defaults      3 attempts, 1000ms fixed delay, 5000ms interval
//!         │
//!         ▼
//!   sync.toml              <config dir>/sync.toml via directories::ProjectDirs
//!         │                (~/.config/tally on Linux)
//!         ▼
//!   TALLY_* variables      TALLY_DEVICE_ID, TALLY_RETRY_ATTEMPTS, ...
//!         │
//!         ▼
//!   validate()             rejected settings never reach the agent
//! ```
//!
//! ## sync.toml
//! ```toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Pixel 8"
//!
//! [sync]
//! retry_attempts = 3
//! retry_delay_ms = 1000
//! backoff = "fixed"            # fixed | exponential
//! sync_interval_ms = 5000
//! batch_size = 100
//! remote_timeout_ms = 15000
//! conflict_strategy = "remote_wins"
//!
//! [storage]
//! database_path = "/data/tally.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tally_core::ConflictPolicy;

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;

// =============================================================================
// Device Configuration
// =============================================================================

/// Identity of the replica this process owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable replica id. A fresh UUID when no file provides one, so
    /// `save` should run once after first launch.
    pub id: String,

    #[serde(default = "unnamed_device")]
    pub name: String,
}

fn unnamed_device() -> String {
    "Tally Device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: unnamed_device(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay between every attempt.
    #[default]
    Fixed,
    /// Delay multiplied after every attempt, capped.
    Exponential,
}

impl std::str::FromStr for BackoffKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" | "constant" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(SyncError::InvalidConfig(format!(
                "backoff must be fixed or exponential, got '{other}'"
            ))),
        }
    }
}

/// Replication behavior settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Total reconcile attempts per pass, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between attempts (milliseconds). Initial delay for exponential.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Fixed or exponential delays.
    #[serde(default)]
    pub backoff: BackoffKind,

    /// Growth factor for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Cap for exponential backoff (milliseconds).
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,

    /// Interval between scheduled sync checks (milliseconds).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,

    /// Records per pull/push page.
    #[serde(default = "default_page_size")]
    pub batch_size: u32,

    /// Upper bound for any single remote call (milliseconds).
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_ms: u64,

    /// How concurrent modifications are settled.
    #[serde(default)]
    pub conflict_strategy: ConflictPolicy,
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    1000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_retry_delay() -> u64 {
    30_000
}
fn default_sync_interval() -> u64 {
    5000
}
fn default_page_size() -> u32 {
    100
}
fn default_remote_timeout() -> u64 {
    15_000
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay(),
            backoff: BackoffKind::default(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay(),
            sync_interval_ms: default_sync_interval(),
            batch_size: default_page_size(),
            remote_timeout_ms: default_remote_timeout(),
            conflict_strategy: ConflictPolicy::default(),
        }
    }
}

impl SyncSettings {
    /// Builds the retry policy these settings describe.
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.retry_delay_ms);
        match self.backoff {
            BackoffKind::Fixed => RetryPolicy::Fixed { delay },
            BackoffKind::Exponential => RetryPolicy::Exponential {
                initial: delay,
                multiplier: self.backoff_multiplier,
                max: Duration::from_millis(self.max_retry_delay_ms),
            },
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Local storage settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file. Defaults to `tally.db` in the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

// =============================================================================
// SyncConfig
// =============================================================================

/// Everything the agent needs besides its backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    /// Defaults with a freshly generated device id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves defaults, then `path` (or the platform `sync.toml`), then
    /// `TALLY_*` variables, and validates the result.
    ///
    /// A missing file is not an error; an unreadable or malformed one is.
    pub fn load(path: Option<PathBuf>) -> SyncResult<Self> {
        let file = path.or_else(Self::default_config_path);
        let mut config = match file.as_deref() {
            Some(file) if file.exists() => {
                let text = std::fs::read_to_string(file)?;
                let parsed: SyncConfig = toml::from_str(&text)?;
                info!(path = %file.display(), device_id = %parsed.device.id, "Read sync.toml");
                parsed
            }
            Some(file) => {
                debug!(path = %file.display(), "No sync.toml, starting from defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Like [`SyncConfig::load`], but falls back to defaults on any error.
    pub fn load_or_default(path: Option<PathBuf>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(error) => {
                warn!(%error, "Unusable sync config, falling back to defaults");
                Self::default()
            }
        }
    }

    /// Writes pretty TOML to `path` (or the platform `sync.toml`), creating
    /// parent directories.
    pub fn save(&self, path: Option<PathBuf>) -> SyncResult<()> {
        let Some(file) = path.or_else(Self::default_config_path) else {
            return Err(SyncError::ConfigSaveFailed(
                "no writable config directory on this platform".into(),
            ));
        };

        let write = |file: &std::path::Path| -> std::io::Result<()> {
            if let Some(dir) = file.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(file, toml::to_string_pretty(self).map_err(std::io::Error::other)?)
        };
        write(&file).map_err(|e| SyncError::ConfigSaveFailed(format!("{}: {e}", file.display())))?;

        info!(path = %file.display(), "Wrote sync.toml");
        Ok(())
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        let sync = &self.sync;
        let invalid = |msg: String| Err(SyncError::InvalidConfig(msg));

        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }
        if sync.retry_attempts == 0 {
            return invalid("retry_attempts counts the first attempt and must be >= 1".into());
        }
        if sync.batch_size == 0 {
            return invalid("batch_size must be > 0".into());
        }
        if sync.sync_interval_ms == 0 {
            return invalid("sync_interval_ms must be > 0".into());
        }
        // Unbounded remote calls could leave the tracker in Syncing forever.
        if sync.remote_timeout_ms == 0 {
            return invalid("remote_timeout_ms must be > 0".into());
        }
        if sync.backoff == BackoffKind::Exponential && !(sync.backoff_multiplier >= 1.0) {
            return invalid(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                sync.backoff_multiplier
            ));
        }
        Ok(())
    }

    /// Applies `TALLY_*` overrides read through `var`.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(id) = var("TALLY_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(name) = var("TALLY_DEVICE_NAME") {
            self.device.name = name;
        }

        let parse_u64 = |key: &str| -> Option<u64> {
            let raw = var(key)?;
            match raw.parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring non-numeric environment override");
                    None
                }
            }
        };

        if let Some(v) = parse_u64("TALLY_RETRY_ATTEMPTS") {
            self.sync.retry_attempts = v.min(u32::MAX as u64) as u32;
        }
        if let Some(v) = parse_u64("TALLY_RETRY_DELAY_MS") {
            self.sync.retry_delay_ms = v;
        }
        if let Some(v) = parse_u64("TALLY_SYNC_INTERVAL_MS") {
            self.sync.sync_interval_ms = v;
        }
        if let Some(v) = parse_u64("TALLY_BATCH_SIZE") {
            self.sync.batch_size = v.min(u32::MAX as u64) as u32;
        }

        if let Some(backoff) = var("TALLY_BACKOFF") {
            match backoff.parse() {
                Ok(kind) => self.sync.backoff = kind,
                Err(_) => warn!(backoff = %backoff, "Unknown backoff in environment"),
            }
        }

        if let Some(strategy) = var("TALLY_CONFLICT_STRATEGY") {
            match strategy.parse() {
                Ok(policy) => {
                    debug!(strategy = %strategy, "Overriding conflict strategy from environment");
                    self.sync.conflict_strategy = policy;
                }
                Err(_) => warn!(strategy = %strategy, "Unknown conflict strategy in environment"),
            }
        }

        if let Some(path) = var("TALLY_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("app", "tally", "tally")
    }

    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// Configured SQLite file, else `tally.db` in the platform data dir.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.storage
            .database_path
            .clone()
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("tally.db")))
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.sync.conflict_strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert!(Uuid::parse_str(config.device_id()).is_ok());
        assert_eq!(config.sync.retry_attempts, 3);
        assert_eq!(config.sync.retry_delay_ms, 1000);
        assert_eq!(config.sync.sync_interval_ms, 5000);
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.sync.backoff, BackoffKind::Fixed);
        assert_eq!(config.conflict_policy(), ConflictPolicy::RemoteWins);
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let mut config = SyncConfig::default();
        assert!(config.validate().is_ok());

        config.device.id = String::new();
        assert_eq!(config.validate(), Err(SyncError::MissingDeviceId));

        config.device.id = "phone".to_string();
        config.sync.retry_attempts = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        config.sync.retry_attempts = 1;
        config.sync.batch_size = 0;
        assert!(config.validate().is_err());

        config.sync.batch_size = 10;
        config.sync.remote_timeout_ms = 0;
        assert!(config.validate().is_err());

        config.sync.remote_timeout_ms = 100;
        config.sync.backoff = BackoffKind::Exponential;
        config.sync.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TALLY_DEVICE_ID", "device-7"),
            ("TALLY_RETRY_ATTEMPTS", "5"),
            ("TALLY_RETRY_DELAY_MS", "250"),
            ("TALLY_BATCH_SIZE", "not-a-number"),
            ("TALLY_CONFLICT_STRATEGY", "local_wins"),
            ("TALLY_DATABASE_PATH", "/tmp/tally-test.db"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.device_id(), "device-7");
        assert_eq!(config.sync.retry_attempts, 5);
        assert_eq!(config.sync.retry_delay_ms, 250);
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.conflict_policy(), ConflictPolicy::LocalWins);
        assert_eq!(
            config.database_path(),
            Some(PathBuf::from("/tmp/tally-test.db"))
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "abc"

            [sync]
            retry_attempts = 4
            conflict_strategy = "manual"
            "#,
        )
        .unwrap();

        assert_eq!(config.device.name, "Tally Device");
        assert_eq!(config.sync.retry_attempts, 4);
        assert_eq!(config.sync.retry_delay_ms, 1000);
        assert_eq!(config.conflict_policy(), ConflictPolicy::Manual);
    }

    #[test]
    fn test_retry_policy_from_settings() {
        let mut settings = SyncSettings::default();
        assert_eq!(
            settings.retry_policy(),
            RetryPolicy::Fixed {
                delay: Duration::from_millis(1000)
            }
        );

        settings.backoff = BackoffKind::Exponential;
        assert!(matches!(
            settings.retry_policy(),
            RetryPolicy::Exponential { .. }
        ));
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let path = std::env::temp_dir().join(format!("tally-absent-{}.toml", Uuid::new_v4()));
        let config = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(config.sync.batch_size, 100);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("tally-sync-{}.toml", Uuid::new_v4()));
        let mut config = SyncConfig::default();
        config.sync.batch_size = 42;
        config.save(Some(path.clone())).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[device]"));
        let loaded: SyncConfig = toml::from_str(&text).unwrap();
        assert_eq!(loaded, config);
        std::fs::remove_file(path).ok();
    }
}
