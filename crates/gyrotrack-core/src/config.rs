//! Application configuration management.
//!
//! Handles loading, saving, and validating gyrotrack configuration including:
//! - Rolling window and leaderboard sizes
//! - GATT service and characteristic carrying telemetry
//! - Scan duration and advertisement filter
//! - Leaderboard storage location
//!
//! Values are read from a TOML file and can be overridden by environment
//! variables of the form `GYROTRACK__TELEMETRY__WINDOW_CAPACITY=30`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::discovery::{DEFAULT_SCAN_TIMEOUT, MAX_SCAN_TIMEOUT};
use crate::error::{MonitorError, Result};
use crate::leaderboard::{DEFAULT_LEADERBOARD_KEY, DEFAULT_LEADERBOARD_SIZE};
use crate::storage::{default_data_dir, FileStore};
use crate::window::{DEFAULT_WINDOW_CAPACITY, MAX_WINDOW_CAPACITY};

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "GYROTRACK";

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("static regex is valid")
});

static KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex is valid"));

/// Returns `true` if `value` is a 128-bit UUID in canonical hyphenated form.
#[must_use]
pub fn is_valid_uuid(value: &str) -> bool {
    UUID_RE.is_match(value)
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Telemetry decoding and ranking.
    pub telemetry: TelemetryConfig,

    /// Device scanning.
    pub discovery: DiscoveryConfig,

    /// Leaderboard persistence.
    pub storage: StorageConfig,
}

/// Telemetry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Readings kept for the rolling average.
    pub window_capacity: usize,

    /// Records kept on the leaderboard.
    pub leaderboard_size: usize,

    /// GATT service exposing the telemetry characteristic.
    pub service_uuid: String,

    /// Characteristic that notifies telemetry frames.
    pub characteristic_uuid: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            leaderboard_size: DEFAULT_LEADERBOARD_SIZE,
            service_uuid: "0000ffe0-0000-1000-8000-00805f9b34fb".to_string(),
            characteristic_uuid: "0000ffe1-0000-1000-8000-00805f9b34fb".to_string(),
        }
    }
}

/// Scan settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// How long a scan runs before delivering results.
    pub scan_timeout_secs: u64,

    /// Only advertisements for these services are reported.
    pub service_uuids: Vec<String>,
}

impl DiscoveryConfig {
    /// Scan duration as a [`Duration`].
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT.as_secs(),
            // Trainers advertise as HID devices.
            service_uuids: vec!["00001812-0000-1000-8000-00805f9b34fb".to_string()],
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for stored data; platform default when unset.
    pub data_dir: Option<PathBuf>,

    /// Store key of the leaderboard blob.
    pub leaderboard_key: String,
}

impl StorageConfig {
    /// Open the file store this configuration points at.
    ///
    /// # Errors
    ///
    /// Returns an error if no data directory is configured and the platform
    /// default cannot be determined.
    pub fn file_store(&self) -> Result<FileStore> {
        match &self.data_dir {
            Some(dir) => Ok(FileStore::new(dir)),
            None => Ok(FileStore::new(default_data_dir()?)),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            leaderboard_key: DEFAULT_LEADERBOARD_KEY.to_string(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from `path`, applying environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::ConfigNotFound`] if the file does not exist, or
    /// a parse or validation error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MonitorError::ConfigNotFound(path.to_path_buf()));
        }
        Self::build(path)
    }

    /// Load configuration from `path` if it exists, else use defaults.
    /// Environment overrides apply in both cases.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed, or if the
    /// result fails validation.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        Self::build(path)
    }

    fn build(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("discovery.service_uuids"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path` as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check every setting and report all problems at once.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::ConfigValidationError`] listing each invalid
    /// field.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if !(1..=MAX_WINDOW_CAPACITY).contains(&self.telemetry.window_capacity) {
            problems.push(format!(
                "telemetry.window_capacity: must be between 1 and {MAX_WINDOW_CAPACITY}"
            ));
        }
        if self.telemetry.leaderboard_size == 0 {
            problems.push("telemetry.leaderboard_size: must be at least 1".to_string());
        }
        for (field, value) in [
            ("telemetry.service_uuid", &self.telemetry.service_uuid),
            ("telemetry.characteristic_uuid", &self.telemetry.characteristic_uuid),
        ] {
            if !is_valid_uuid(value) {
                problems.push(format!("{field}: '{value}' is not a UUID"));
            }
        }
        let max_scan_secs = MAX_SCAN_TIMEOUT.as_secs();
        if !(1..=max_scan_secs).contains(&self.discovery.scan_timeout_secs) {
            problems.push(format!(
                "discovery.scan_timeout_secs: must be between 1 and {max_scan_secs}"
            ));
        }
        for value in &self.discovery.service_uuids {
            if !is_valid_uuid(value) {
                problems.push(format!("discovery.service_uuids: '{value}' is not a UUID"));
            }
        }
        if !KEY_RE.is_match(&self.storage.leaderboard_key) {
            problems.push(format!(
                "storage.leaderboard_key: '{}' must be letters, digits, '-' or '_'",
                self.storage.leaderboard_key
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MonitorError::ConfigValidationError(problems.join("; ")))
        }
    }
}

/// Default configuration file location, e.g. `~/.config/gyrotrack/config.toml`.
#[must_use]
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "gyrotrack").map_or_else(
        || PathBuf::from("gyrotrack.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.telemetry.window_capacity, 60);
        assert_eq!(config.telemetry.leaderboard_size, 10);
        assert_eq!(config.discovery.scan_timeout(), Duration::from_secs(10));
        assert_eq!(config.storage.leaderboard_key, "records");
    }

    #[test]
    fn test_uuid_validation() {
        assert!(is_valid_uuid("0000ffe1-0000-1000-8000-00805f9b34fb"));
        assert!(is_valid_uuid("CB8A781F-6F1A-4158-A52E-CCDD8D35EDC9"));
        assert!(!is_valid_uuid("ffe1"));
        assert!(!is_valid_uuid("0000ffe1-0000-1000-8000-00805f9b34fz"));
    }

    #[test]
    fn test_validation_reports_every_problem() {
        let mut config = MonitorConfig::default();
        config.telemetry.window_capacity = 0;
        config.discovery.scan_timeout_secs = 0;
        config.storage.leaderboard_key = "../escape".to_string();

        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("window_capacity"));
        assert!(message.contains("scan_timeout_secs"));
        assert!(message.contains("leaderboard_key"));
    }

    #[test]
    fn test_oversized_values_are_rejected() {
        let mut config = MonitorConfig::default();
        config.telemetry.window_capacity = usize::MAX / 2;
        config.discovery.scan_timeout_secs = u64::MAX;

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("window_capacity"));
        assert!(message.contains("scan_timeout_secs"));

        config.telemetry.window_capacity = MAX_WINDOW_CAPACITY;
        config.discovery.scan_timeout_secs = MAX_SCAN_TIMEOUT.as_secs();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitorConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.telemetry, TelemetryConfig::default());
    }

    #[test]
    fn test_load_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = MonitorConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, MonitorError::ConfigNotFound(_)));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[discovery]\nscan_timeout_secs = 4\n").unwrap();

        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config.discovery.scan_timeout_secs, 4);
        assert_eq!(config.discovery.service_uuids, DiscoveryConfig::default().service_uuids);
        assert_eq!(config.telemetry.window_capacity, 60);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = MonitorConfig::default();
        config.telemetry.leaderboard_size = 5;
        config.storage.data_dir = Some(dir.path().join("data"));

        config.save(&path).unwrap();
        assert_eq!(MonitorConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[telemetry]\nwindow_capacity = 0\n").unwrap();

        let err = MonitorConfig::load(&path).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_file_store_uses_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..StorageConfig::default()
        };
        assert_eq!(storage.file_store().unwrap().data_dir(), dir.path());
    }
}
