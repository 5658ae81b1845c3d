//! Unified error types for the gyrotrack core library.
//!
//! This module provides a unified error type [`MonitorError`] that covers every
//! failure mode of the telemetry engine, the leaderboard store, device discovery
//! and configuration loading.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **Degrade, don't abort**: Callers skip the event or treat data as empty
//!
//! # Example
//!
//! ```rust
//! use gyrotrack_core::error::{MonitorError, Result};
//!
//! fn check_payload(payload: &[u8]) -> Result<()> {
//!     if payload.len() < 11 {
//!         return Err(MonitorError::MalformedFrame { len: payload.len() });
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all gyrotrack operations.
///
/// No variant is fatal to the process. Frame errors drop one notification,
/// persistence errors leave the leaderboard empty or unsaved, and discovery
/// errors reject a single command.
#[derive(Debug, Error)]
pub enum MonitorError {
    // =========================================================================
    // TELEMETRY ERRORS
    // =========================================================================
    /// A notification payload was too short to contain a full reading.
    #[error("Malformed frame: expected at least 11 bytes, got {len}")]
    MalformedFrame {
        /// Length of the rejected payload.
        len: usize,
    },

    /// An average was requested from a rolling window that holds no readings.
    #[error("Rolling window is empty; no average is defined before the first sample")]
    EmptyWindow,

    // =========================================================================
    // PERSISTENCE ERRORS
    // =========================================================================
    /// The key/value store failed to read or write the leaderboard.
    #[error("Persistence error: {0}")]
    PersistenceFailure(String),

    /// The stored leaderboard blob could not be interpreted.
    #[error("Stored leaderboard is unreadable: {0}")]
    CorruptLeaderboard(String),

    // =========================================================================
    // DISCOVERY ERRORS
    // =========================================================================
    /// A scan was requested while another scan is still running.
    #[error("A device scan is already in progress. Stop it before starting another.")]
    ScanAlreadyActive,

    /// A scan operation was requested while no scan is running.
    #[error("No device scan is in progress")]
    NoActiveScan,

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // I/O ERRORS
    // =========================================================================
    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for gyrotrack operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

impl MonitorError {
    /// Returns `true` if this error rejected a single notification payload.
    #[inline]
    #[must_use]
    pub const fn is_frame_error(&self) -> bool {
        matches!(self, Self::MalformedFrame { .. })
    }

    /// Returns `true` if this error is related to reading or writing stored data.
    #[inline]
    #[must_use]
    pub const fn is_persistence_error(&self) -> bool {
        matches!(
            self,
            Self::PersistenceFailure(_) | Self::CorruptLeaderboard(_) | Self::IoError(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to device discovery.
    #[inline]
    #[must_use]
    pub const fn is_discovery_error(&self) -> bool {
        matches!(self, Self::ScanAlreadyActive | Self::NoActiveScan)
    }

    /// Returns `true` if the caller broke a precondition rather than hitting a
    /// runtime condition.
    #[inline]
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        matches!(self, Self::EmptyWindow)
    }

    /// Returns `true` if processing can simply continue with the next event.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame { .. }
                | Self::PersistenceFailure(_)
                | Self::CorruptLeaderboard(_)
                | Self::ScanAlreadyActive
                | Self::NoActiveScan
        )
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedFrame { .. } => "MALFORMED_FRAME",
            Self::EmptyWindow => "EMPTY_WINDOW",
            Self::PersistenceFailure(_) => "PERSISTENCE_FAILURE",
            Self::CorruptLeaderboard(_) => "CORRUPT_LEADERBOARD",
            Self::ScanAlreadyActive => "SCAN_ALREADY_ACTIVE",
            Self::NoActiveScan => "NO_ACTIVE_SCAN",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM DEPENDENCY ERRORS
// =============================================================================

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        Self::CorruptLeaderboard(err.to_string())
    }
}

impl From<config::ConfigError> for MonitorError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigParseError(err.to_string())
    }
}

impl From<toml::ser::Error> for MonitorError {
    fn from(err: toml::ser::Error) -> Self {
        Self::ConfigParseError(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
