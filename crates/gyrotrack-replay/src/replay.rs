//! Capture parsing and replay.
//!
//! A capture is plain text with one notification per line, hex encoded:
//!
//! ```text
//! # warm-up
//! f0 0d 00 07 e8 03 03 0a 00 05 00
//! f0 0d 00 07 d0 07 03 14 00 0a 00
//! disconnect
//! ```
//!
//! Blank lines and `#` comments are skipped. Lines that are not hex are logged
//! and skipped. The engine stops at the first `disconnect`; anything after it
//! is reported and ignored.

use std::io::BufRead;

use anyhow::Context;
use gyrotrack_core::{
    parse_hex_frame, run_telemetry, KeyValueStore, RunRecord, TelemetryEvent, TelemetryMonitor,
    TelemetryUpdate,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Channel depth between the reader, the engine and the reporter.
const CHANNEL_CAPACITY: usize = 64;

/// Outcome of replaying one capture.
#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    /// Events fed to the engine, up to and including the first disconnect.
    pub events: usize,

    /// Events after the first disconnect that were not replayed.
    pub ignored_events: usize,

    /// Workouts completed during the replay.
    pub completed_runs: usize,

    /// The last workout completed during the replay.
    pub last_run: Option<RunRecord>,

    /// Leaderboard after the replay.
    pub leaderboard: Vec<RunRecord>,
}

/// Interpret one capture line.
///
/// Returns `None` for blank lines, comments and lines that are not hex.
#[must_use]
pub fn parse_line(line_no: usize, line: &str) -> Option<TelemetryEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if line.eq_ignore_ascii_case("disconnect") {
        return Some(TelemetryEvent::Disconnected);
    }
    let parsed = parse_hex_frame(line).map(TelemetryEvent::Notification);
    if parsed.is_none() {
        warn!(line = line_no, content = line, "Skipping line that is not hex");
    }
    parsed
}

/// Read a whole capture.
///
/// # Errors
///
/// Returns an error if the reader fails.
pub fn parse_capture<R: BufRead>(reader: R) -> anyhow::Result<Vec<TelemetryEvent>> {
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read capture line {}", idx + 1))?;
        events.extend(parse_line(idx + 1, &line));
    }
    Ok(events)
}

/// Cut `events` after the first disconnect. Returns how many were dropped.
fn truncate_at_disconnect(events: &mut Vec<TelemetryEvent>) -> usize {
    let Some(pos) = events.iter().position(|e| *e == TelemetryEvent::Disconnected) else {
        return 0;
    };
    let ignored = events.len() - (pos + 1);
    if ignored > 0 {
        warn!(ignored, "Ignoring capture events after disconnect");
        events.truncate(pos + 1);
    }
    ignored
}

/// Run `events` through `monitor` and summarize the result.
pub async fn replay<S>(
    monitor: TelemetryMonitor<S>,
    mut events: Vec<TelemetryEvent>,
) -> ReplaySummary
where
    S: KeyValueStore + Clone + Send + 'static,
{
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (update_tx, mut update_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let ignored_events = truncate_at_disconnect(&mut events);
    let event_count = events.len();

    let feeder = tokio::spawn(async move {
        for event in events {
            if event_tx.send(event).await.is_err() {
                break;
            }
        }
    });

    let reporter = tokio::spawn(async move {
        let mut completed_runs = 0;
        while let Some(update) = update_rx.recv().await {
            match update {
                TelemetryUpdate::LeaderboardLoaded(records) => {
                    info!(entries = records.len(), "Existing leaderboard");
                }
                TelemetryUpdate::RunCompleted { record, leaderboard } => {
                    completed_runs += 1;
                    let rank = leaderboard.iter().position(|r| r.id() == record.id());
                    let average_rpm = format!("{:.0}", record.average_rpm());
                    let average_strength = format!("{:.2}", record.average_strength());
                    info!(
                        %average_rpm,
                        %average_strength,
                        max_rpm = record.max_rpm(),
                        duration_secs = record.duration_secs(),
                        rotations = record.rotations(),
                        rank = ?rank.map(|r| r + 1),
                        "Run completed"
                    );
                }
                TelemetryUpdate::LeaderboardUnavailable { reason } => {
                    warn!(%reason, "Leaderboard unavailable");
                }
                TelemetryUpdate::Disconnected => info!("Trainer disconnected"),
                TelemetryUpdate::RunUpdated(_) => {}
            }
        }
        completed_runs
    });

    let monitor = run_telemetry(monitor, event_rx, update_tx).await;
    feeder.abort();
    let completed_runs = reporter.await.unwrap_or_else(|e| {
        warn!(error = %e, "Reporter task failed");
        0
    });

    ReplaySummary {
        events: event_count,
        ignored_events,
        completed_runs,
        last_run: monitor.last_run().cloned(),
        leaderboard: monitor.leaderboard().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use gyrotrack_core::{FileStore, MemoryStore};

    const CAPTURE: &str = "\
# two workouts, the second one unfinished
f0 0d 00 07 e8 03 03 0a 00 05 00
f0 0d 00 07 d0 07 03 14 00 0a 00
not a frame

f0 0d 00 07 64 00 03 02 00 01 00
disconnect
";

    #[test]
    fn test_parse_line_kinds() {
        assert_eq!(parse_line(1, "   "), None);
        assert_eq!(parse_line(1, "# note"), None);
        assert_eq!(parse_line(1, "DISCONNECT"), Some(TelemetryEvent::Disconnected));
        assert_eq!(
            parse_line(1, "0a ff"),
            Some(TelemetryEvent::Notification(vec![0x0a, 0xff]))
        );
        assert_eq!(parse_line(1, "xyz"), None);
    }

    #[test]
    fn test_parse_capture_skips_noise() {
        let events = parse_capture(CAPTURE.as_bytes()).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events.last(), Some(&TelemetryEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_replay_ranks_completed_workout() {
        let store = Arc::new(MemoryStore::new());
        let events = parse_capture(CAPTURE.as_bytes()).unwrap();

        let summary = replay(TelemetryMonitor::new("capture", store), events).await;

        assert_eq!(summary.events, 4);
        assert_eq!(summary.ignored_events, 0);
        assert_eq!(summary.completed_runs, 1);
        assert_eq!(summary.leaderboard.len(), 1);
        let run = summary.last_run.unwrap();
        assert!((run.average_rpm() - 1500.0).abs() < f64::EPSILON);
        assert_eq!(run.duration_ticks(), 20);
    }

    #[tokio::test]
    async fn test_replay_persists_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        for _ in 0..2 {
            let events = parse_capture(CAPTURE.as_bytes()).unwrap();
            replay(TelemetryMonitor::new("capture", FileStore::new(dir.path())), events).await;
        }

        let monitor = TelemetryMonitor::new("capture", FileStore::new(dir.path()));
        let summary = replay(monitor, Vec::new()).await;
        assert_eq!(summary.leaderboard.len(), 2);
        assert_eq!(summary.completed_runs, 0);
    }

    #[tokio::test]
    async fn test_events_after_disconnect_are_not_counted() {
        let trailing = "f0 0d 00 07 e8 03 03 0a 00 05 00\nf0 0d 00 07 64 00 03 02 00 01 00\n";
        let capture = format!("{CAPTURE}{trailing}");
        let events = parse_capture(capture.as_bytes()).unwrap();
        assert_eq!(events.len(), 6);

        let monitor = TelemetryMonitor::new("capture", Arc::new(MemoryStore::new()));
        let summary = replay(monitor, events).await;

        assert_eq!(summary.events, 4);
        assert_eq!(summary.ignored_events, 2);
        assert_eq!(summary.completed_runs, 1);
    }
}
