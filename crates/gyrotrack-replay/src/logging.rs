//! Tracing setup for the replay tool.
//!
//! Everything goes to stderr so the summary on stdout stays machine-readable.
//! In production mode a JSON copy is also written to daily files under
//! `<data_dir>/logs`, next to the leaderboard it describes.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use gyrotrack_core::{default_data_dir, StorageConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "gyrotrack-replay";

/// Keeps the file writer flushing until the process exits.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Pretty stderr output with span events.
    Development,
    /// Compact stderr plus JSON files.
    Production,
}

impl LogMode {
    /// Read `GYROTRACK_ENV`; anything but `production` means development.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("GYROTRACK_ENV") {
            Ok(v) if v.eq_ignore_ascii_case("production") => Self::Production,
            _ => Self::Development,
        }
    }
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Output style.
    pub mode: LogMode,

    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,

    /// Directory for log files in production mode.
    pub log_dir: PathBuf,
}

impl LogSettings {
    /// Settings from `GYROTRACK_ENV` and `GYROTRACK_LOG_LEVEL`, with log files
    /// placed beside the configured leaderboard storage.
    #[must_use]
    pub fn from_env(storage: &StorageConfig) -> Self {
        Self {
            mode: LogMode::from_env(),
            default_filter: std::env::var("GYROTRACK_LOG_LEVEL")
                .unwrap_or_else(|_| "info".to_string()),
            log_dir: log_dir(storage),
        }
    }
}

fn log_dir(storage: &StorageConfig) -> PathBuf {
    storage
        .data_dir
        .clone()
        .or_else(|| default_data_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("logs")
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter is invalid, the log directory cannot be
/// created, or a subscriber is already installed.
pub fn init(settings: &LogSettings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.default_filter))
        .with_context(|| format!("Invalid log filter '{}'", settings.default_filter))?;

    match settings.mode {
        LogMode::Development => {
            let stderr = tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .try_init()?;
        }
        LogMode::Production => {
            std::fs::create_dir_all(&settings.log_dir).with_context(|| {
                format!("Failed to create log directory {}", settings.log_dir.display())
            })?;
            let appender =
                RollingFileAppender::new(Rotation::DAILY, &settings.log_dir, LOG_FILE_PREFIX);
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);

            let file = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            let stderr = tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_ansi(false);

            tracing_subscriber::registry()
                .with(filter)
                .with(file)
                .with(stderr)
                .try_init()?;
        }
    }

    Ok(())
}
