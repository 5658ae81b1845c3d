//! # gyrotrack-replay
//!
//! Replays a capture of trainer notifications through the gyrotrack engine and
//! prints the resulting leaderboard as JSON.
//!
//! ## Running
//!
//! ```bash
//! # From a file
//! gyrotrack-replay capture.txt
//!
//! # From stdin
//! cat capture.txt | gyrotrack-replay
//! ```
//!
//! ## Environment Variables
//!
//! - `GYROTRACK_CONFIG`: Optional. Config file path (default: platform config dir)
//! - `GYROTRACK_DEVICE_ID`: Optional. Device id recorded on runs (default: "replay")
//! - `GYROTRACK_ENV`: Optional. "production" adds JSON file logging under the data dir
//! - `RUST_LOG` / `GYROTRACK_LOG_LEVEL`: Optional. Log filter (default: info)

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::Context;
use gyrotrack_core::{default_config_path, MonitorConfig, TelemetryMonitor};
use gyrotrack_replay::logging::{self, LogSettings};
use gyrotrack_replay::replay;
use tracing::info;

const DEFAULT_DEVICE_ID: &str = "replay";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var_os("GYROTRACK_CONFIG")
        .map_or_else(default_config_path, PathBuf::from);
    let config = MonitorConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    logging::init(&LogSettings::from_env(&config.storage))?;

    let device_id =
        std::env::var("GYROTRACK_DEVICE_ID").unwrap_or_else(|_| DEFAULT_DEVICE_ID.to_string());

    let input: Box<dyn BufRead> = match std::env::args_os().nth(1) {
        Some(path) => {
            let file = File::open(&path)
                .with_context(|| format!("Failed to open capture {}", path.to_string_lossy()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(std::io::stdin().lock()),
    };
    let events = replay::parse_capture(input)?;

    let store = config
        .storage
        .file_store()
        .context("Failed to open leaderboard storage")?;
    info!(
        device_id = %device_id,
        events = events.len(),
        data_dir = %store.data_dir().display(),
        "Starting replay"
    );

    let monitor =
        TelemetryMonitor::from_config(device_id, store, &config.telemetry, &config.storage);
    let subscription = monitor.subscription();
    info!(
        service = %subscription.service_uuid,
        characteristic = %subscription.characteristic_uuid,
        "Frames are interpreted as notifications of this characteristic"
    );
    let summary = replay::replay(monitor, events).await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
