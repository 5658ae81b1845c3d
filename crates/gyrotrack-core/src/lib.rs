//! # gyrotrack-core
//!
//! Core telemetry engine for the gyrotrack gyro-trainer companion.
//!
//! This crate provides:
//! - Decoding of the trainer's BLE notification frames
//! - Workout segmentation from the trainer's duration counter
//! - Rolling RPM averages, peak tracking and strength estimates
//! - A persisted top-ten leaderboard of completed workouts
//! - Bounded, deduplicated device discovery
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`frame`] - Notification payload decoding
//! - [`window`] - Fixed-capacity rolling window of RPM readings
//! - [`session`] - Run state, workout boundary detection and derived metrics
//! - [`leaderboard`] - Ranked, versioned, persisted workout records
//! - [`storage`] - Key/value blob stores backing the leaderboard
//! - [`monitor`] - Event-driven pipeline for one connected trainer
//! - [`discovery`] - Scan state machine and its timeout-owning driver
//! - [`config`] - Configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate
//!
//! The BLE transport itself lives outside this crate. It feeds
//! [`monitor::TelemetryEvent`]s and [`discovery::ScanCommand`]s into the
//! drivers over channels.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod leaderboard;
pub mod monitor;
pub mod session;
pub mod storage;
pub mod window;

// Re-export primary types for convenience
pub use crate::config::{
    default_config_path, is_valid_uuid, DiscoveryConfig, MonitorConfig, StorageConfig,
    TelemetryConfig,
};
pub use discovery::{
    run_discovery, AdapterState, Advertisement, DeviceSelection, DiscoveryController,
    DiscoveryState, DiscoveryUpdate, ScanCommand, ScanId, ScanOutcome, StopReason,
    DEFAULT_SCAN_TIMEOUT, MAX_SCAN_TIMEOUT,
};
pub use error::{MonitorError, Result};
pub use frame::{decode_frame, hex_dump, parse_hex_frame, Sample, MIN_FRAME_LEN};
pub use leaderboard::{Leaderboard, DEFAULT_LEADERBOARD_KEY, DEFAULT_LEADERBOARD_SIZE};
pub use monitor::{run_telemetry, Subscription, TelemetryEvent, TelemetryMonitor, TelemetryUpdate};
pub use session::{strength, RunInfo, RunRecord, SessionSegmenter};
pub use storage::{default_data_dir, FileStore, KeyValueStore, MemoryStore};
pub use window::{RollingWindow, DEFAULT_WINDOW_CAPACITY, MAX_WINDOW_CAPACITY};
