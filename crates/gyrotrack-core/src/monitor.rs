//! Telemetry pipeline for one connected trainer.
//!
//! Notifications flow through [`decode_frame`], the [`SessionSegmenter`] and,
//! when a workout completes, into the [`Leaderboard`]. Each event is handled
//! to completion before the next one is looked at.
//!
//! [`run_telemetry`] keeps store I/O off the event path: the stored
//! leaderboard is read on the blocking pool and rankings are written by a
//! dedicated writer that only ever persists the newest blob.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{StorageConfig, TelemetryConfig};
use crate::error::{MonitorError, Result};
use crate::frame::{decode_frame, hex_dump};
use crate::leaderboard::Leaderboard;
use crate::session::{RunInfo, RunRecord, SessionSegmenter};
use crate::storage::KeyValueStore;

/// Input from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// One notification payload, already decoded from its transport encoding.
    Notification(Vec<u8>),
    /// The trainer disconnected.
    Disconnected,
}

/// Output for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryUpdate {
    /// The stored leaderboard was read.
    LeaderboardLoaded(Vec<RunRecord>),
    /// The in-progress run changed.
    RunUpdated(RunInfo),
    /// A workout finished and was ranked.
    RunCompleted {
        /// The finished workout.
        record: RunRecord,
        /// The leaderboard after ranking it.
        leaderboard: Vec<RunRecord>,
    },
    /// The leaderboard could not be read or written.
    LeaderboardUnavailable {
        /// Human-readable cause.
        reason: String,
    },
    /// The connection ended; the unfinished run was dropped.
    Disconnected,
}

/// GATT characteristic the transport subscribes to for telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Service exposing the characteristic.
    pub service_uuid: String,
    /// Characteristic notifying telemetry frames.
    pub characteristic_uuid: String,
}

impl From<&TelemetryConfig> for Subscription {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            service_uuid: config.service_uuid.clone(),
            characteristic_uuid: config.characteristic_uuid.clone(),
        }
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::from(&TelemetryConfig::default())
    }
}

/// Updates for the presentation layer plus the ranked blob still to persist.
type Processed = (Vec<TelemetryUpdate>, Option<Vec<u8>>);

/// Decoding, segmentation and ranking for one connection.
#[derive(Debug)]
pub struct TelemetryMonitor<S> {
    subscription: Subscription,
    segmenter: SessionSegmenter,
    leaderboard: Leaderboard<S>,
    last_run: Option<RunRecord>,
}

impl<S: KeyValueStore> TelemetryMonitor<S> {
    /// Create a monitor with default window and leaderboard sizes.
    pub fn new(device_id: impl Into<String>, store: S) -> Self {
        Self {
            subscription: Subscription::default(),
            segmenter: SessionSegmenter::new(device_id),
            leaderboard: Leaderboard::new(store),
            last_run: None,
        }
    }

    /// Create a monitor from configuration.
    pub fn from_config(
        device_id: impl Into<String>,
        store: S,
        telemetry: &TelemetryConfig,
        storage: &StorageConfig,
    ) -> Self {
        Self {
            subscription: Subscription::from(telemetry),
            segmenter: SessionSegmenter::with_window_capacity(
                device_id,
                telemetry.window_capacity,
            ),
            leaderboard: Leaderboard::with_settings(
                store,
                &storage.leaderboard_key,
                telemetry.leaderboard_size,
            ),
            last_run: None,
        }
    }

    /// Read the stored leaderboard.
    pub fn load_leaderboard(&mut self) -> TelemetryUpdate {
        let stored = self.leaderboard.store().get(self.leaderboard.key());
        self.restore_leaderboard(stored)
    }

    fn restore_leaderboard(&mut self, stored: Result<Option<Vec<u8>>>) -> TelemetryUpdate {
        match self.leaderboard.restore(stored) {
            Ok(records) => {
                debug!(entries = records.len(), "Leaderboard loaded");
                TelemetryUpdate::LeaderboardLoaded(records.to_vec())
            }
            Err(e) => leaderboard_unavailable(&e),
        }
    }

    /// Process one transport event, writing any new ranking to the store
    /// before returning.
    pub fn handle(&mut self, event: TelemetryEvent) -> Vec<TelemetryUpdate> {
        let (mut updates, blob) = self.process(event);
        if let Some(blob) = blob {
            if let Err(e) = self.leaderboard.store().set(self.leaderboard.key(), &blob) {
                updates.push(leaderboard_unavailable(&e));
            }
        }
        updates
    }

    /// Process one event in memory.
    fn process(&mut self, event: TelemetryEvent) -> Processed {
        match event {
            TelemetryEvent::Notification(payload) => self.process_notification(&payload),
            TelemetryEvent::Disconnected => {
                self.segmenter.disconnect();
                (vec![TelemetryUpdate::Disconnected], None)
            }
        }
    }

    fn process_notification(&mut self, payload: &[u8]) -> Processed {
        debug!(frame = %hex_dump(payload), "Notification");

        let sample = match decode_frame(payload) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Dropping notification");
                return (Vec::new(), None);
            }
        };

        let completed = match self.segmenter.apply_sample(&sample) {
            Ok(completed) => completed,
            Err(e) => {
                warn!(error = %e, "Dropping sample");
                return (Vec::new(), None);
            }
        };

        let mut updates = Vec::with_capacity(3);
        let mut blob = None;
        if let Some(record) = completed {
            self.last_run = Some(record.clone());
            match self.leaderboard.rank(record.clone()) {
                Ok(encoded) => blob = Some(encoded),
                Err(e) => updates.push(leaderboard_unavailable(&e)),
            }
            info!(
                average_rpm = record.average_rpm(),
                max_rpm = record.max_rpm(),
                "Run completed"
            );
            updates.push(TelemetryUpdate::RunCompleted {
                record,
                leaderboard: self.leaderboard.entries().to_vec(),
            });
        }
        if let Some(run) = self.segmenter.current() {
            updates.push(TelemetryUpdate::RunUpdated(run.clone()));
        }
        (updates, blob)
    }

    /// Characteristic the transport should subscribe to.
    #[must_use]
    pub const fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// The run in progress.
    #[must_use]
    pub const fn current_run(&self) -> Option<&RunInfo> {
        self.segmenter.current()
    }

    /// The most recently completed run of this connection.
    #[must_use]
    pub const fn last_run(&self) -> Option<&RunRecord> {
        self.last_run.as_ref()
    }

    /// Ranked records, best first.
    #[must_use]
    pub fn leaderboard(&self) -> &[RunRecord] {
        self.leaderboard.entries()
    }
}

fn leaderboard_unavailable(e: &MonitorError) -> TelemetryUpdate {
    warn!(error = %e, "Leaderboard unavailable");
    TelemetryUpdate::LeaderboardUnavailable {
        reason: e.to_string(),
    }
}

/// Load the leaderboard, then process events in order until the channel
/// closes or the trainer disconnects.
///
/// Store reads and writes run on the blocking pool. Returns the monitor once
/// the last ranking has been written, so callers can inspect the final state.
pub async fn run_telemetry<S>(
    mut monitor: TelemetryMonitor<S>,
    mut events: mpsc::Receiver<TelemetryEvent>,
    updates: mpsc::Sender<TelemetryUpdate>,
) -> TelemetryMonitor<S>
where
    S: KeyValueStore + Clone + Send + 'static,
{
    let store = monitor.leaderboard.store().clone();
    let key = monitor.leaderboard.key().to_owned();

    let stored = {
        let (store, key) = (store.clone(), key.clone());
        tokio::task::spawn_blocking(move || store.get(&key))
            .await
            .unwrap_or_else(|e| {
                Err(MonitorError::PersistenceFailure(format!(
                    "Leaderboard read task failed: {e}"
                )))
            })
    };
    let loaded = monitor.restore_leaderboard(stored);

    let (blobs, writer) = spawn_writer(store, key, updates.clone());
    if updates.send(loaded).await.is_ok() {
        pump(&mut monitor, &mut events, &updates, &blobs).await;
    }

    drop(blobs);
    if let Err(e) = writer.await {
        warn!(error = %e, "Leaderboard writer failed");
    }
    monitor
}

async fn pump<S: KeyValueStore>(
    monitor: &mut TelemetryMonitor<S>,
    events: &mut mpsc::Receiver<TelemetryEvent>,
    updates: &mpsc::Sender<TelemetryUpdate>,
    blobs: &mpsc::UnboundedSender<Vec<u8>>,
) {
    while let Some(event) = events.recv().await {
        let disconnected = event == TelemetryEvent::Disconnected;
        let (batch, blob) = monitor.process(event);
        if let Some(blob) = blob {
            if blobs.send(blob).is_err() {
                warn!("Leaderboard writer stopped, ranking kept in memory only");
            }
        }
        for update in batch {
            if updates.send(update).await.is_err() {
                debug!("Telemetry listener dropped, stopping");
                return;
            }
        }
        if disconnected {
            return;
        }
    }
}

/// Persist ranked blobs on the blocking pool until `blobs` closes.
fn spawn_writer<S>(
    store: S,
    key: String,
    updates: mpsc::Sender<TelemetryUpdate>,
) -> (mpsc::UnboundedSender<Vec<u8>>, JoinHandle<()>)
where
    S: KeyValueStore + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::task::spawn_blocking(move || {
        while let Some(mut blob) = rx.blocking_recv() {
            // Only the newest ranking matters.
            while let Ok(newer) = rx.try_recv() {
                blob = newer;
            }
            match store.set(&key, &blob) {
                Ok(()) => debug!(key = %key, bytes = blob.len(), "Leaderboard persisted"),
                Err(e) => {
                    let _ = updates.blocking_send(leaderboard_unavailable(&e));
                }
            }
        }
    });
    (tx, writer)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::leaderboard::DEFAULT_LEADERBOARD_KEY;
    use crate::storage::MemoryStore;

    fn frame(rpm: u16, duration: u16, rotation: u16) -> Vec<u8> {
        let mut payload = vec![0xf0, 0x0d, 0x00, 0x07];
        payload.extend_from_slice(&rpm.to_le_bytes());
        payload.push(3);
        payload.extend_from_slice(&duration.to_le_bytes());
        payload.extend_from_slice(&rotation.to_le_bytes());
        payload
    }

    fn notify<S: KeyValueStore>(
        monitor: &mut TelemetryMonitor<S>,
        rpm: u16,
        duration: u16,
    ) -> Vec<TelemetryUpdate> {
        monitor.handle(TelemetryEvent::Notification(frame(rpm, duration, duration)))
    }

    async fn send_all(tx: &mpsc::Sender<TelemetryEvent>, samples: &[(u16, u16)]) {
        for &(rpm, duration) in samples {
            tx.send(TelemetryEvent::Notification(frame(rpm, duration, 0)))
                .await
                .unwrap();
        }
    }

    /// Store whose writes wait until the test releases them.
    #[derive(Clone)]
    struct GatedStore {
        inner: Arc<MemoryStore>,
        gate: Arc<Mutex<std::sync::mpsc::Receiver<()>>>,
    }

    impl KeyValueStore for GatedStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> Result<()> {
            let _ = self.gate.lock().unwrap().recv();
            self.inner.set(key, value)
        }
    }

    #[derive(Clone)]
    struct ReadOnlyStore;

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Err(MonitorError::PersistenceFailure("read-only".into()))
        }
    }

    #[test]
    fn test_malformed_frame_changes_nothing() {
        let store = MemoryStore::new();
        let mut monitor = TelemetryMonitor::new("dev", &store);
        notify(&mut monitor, 1000, 10);
        let before = monitor.current_run().cloned();

        let updates = monitor.handle(TelemetryEvent::Notification(vec![1, 2, 3]));
        assert!(updates.is_empty());
        assert_eq!(monitor.current_run().cloned(), before);
    }

    #[test]
    fn test_boundary_ranks_and_persists_run() {
        let store = MemoryStore::new();
        let mut monitor = TelemetryMonitor::new("dev", &store);
        notify(&mut monitor, 1000, 10);
        notify(&mut monitor, 3000, 20);
        let updates = notify(&mut monitor, 500, 1);

        assert_eq!(updates.len(), 2);
        let TelemetryUpdate::RunCompleted { record, leaderboard } = &updates[0] else {
            panic!("expected completion, got {updates:?}");
        };
        assert!((record.average_rpm() - 2000.0).abs() < f64::EPSILON);
        assert_eq!(leaderboard.len(), 1);
        assert!(matches!(&updates[1], TelemetryUpdate::RunUpdated(run) if run.latest_rpm() == 500));
        assert_eq!(monitor.last_run(), Some(record));
        assert!(store.get(DEFAULT_LEADERBOARD_KEY).unwrap().is_some());
    }

    #[test]
    fn test_disconnect_drops_unfinished_run() {
        let store = MemoryStore::new();
        let mut monitor = TelemetryMonitor::new("dev", &store);
        notify(&mut monitor, 1000, 10);

        let updates = monitor.handle(TelemetryEvent::Disconnected);
        assert_eq!(updates, vec![TelemetryUpdate::Disconnected]);
        assert!(monitor.current_run().is_none());
        assert!(monitor.leaderboard().is_empty());
        assert!(store.get(DEFAULT_LEADERBOARD_KEY).unwrap().is_none());
    }

    #[test]
    fn test_load_leaderboard_reads_earlier_runs() {
        let store = MemoryStore::new();
        let mut first = TelemetryMonitor::new("dev", &store);
        notify(&mut first, 2000, 10);
        notify(&mut first, 100, 1);

        let mut second = TelemetryMonitor::new("dev", &store);
        match second.load_leaderboard() {
            TelemetryUpdate::LeaderboardLoaded(records) => assert_eq!(records.len(), 1),
            other => panic!("unexpected update: {other:?}"),
        }
        assert_eq!(second.leaderboard().len(), 1);
    }

    #[test]
    fn test_from_config_applies_sizes() {
        let store = MemoryStore::new();
        let telemetry = TelemetryConfig {
            window_capacity: 2,
            leaderboard_size: 1,
            ..TelemetryConfig::default()
        };
        let mut monitor =
            TelemetryMonitor::from_config("dev", &store, &telemetry, &StorageConfig::default());

        for rpm in [100, 200, 300] {
            notify(&mut monitor, rpm, rpm);
        }
        assert_eq!(monitor.current_run().unwrap().rpm_window().len(), 2);

        notify(&mut monitor, 10, 0);
        notify(&mut monitor, 10, 0);
        notify(&mut monitor, 10, 1);
        notify(&mut monitor, 10, 0);
        assert_eq!(monitor.leaderboard().len(), 1);
        assert!((monitor.leaderboard()[0].average_rpm() - 250.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_config_exposes_subscription() {
        let telemetry = TelemetryConfig {
            service_uuid: "0000fff0-0000-1000-8000-00805f9b34fb".into(),
            characteristic_uuid: "0000fff4-0000-1000-8000-00805f9b34fb".into(),
            ..TelemetryConfig::default()
        };
        let monitor = TelemetryMonitor::from_config(
            "dev",
            MemoryStore::new(),
            &telemetry,
            &StorageConfig::default(),
        );

        assert_eq!(monitor.subscription().service_uuid, telemetry.service_uuid);
        assert_eq!(
            monitor.subscription().characteristic_uuid,
            telemetry.characteristic_uuid
        );
        assert_eq!(
            TelemetryMonitor::new("dev", MemoryStore::new()).subscription(),
            &Subscription::default()
        );
    }

    #[tokio::test]
    async fn test_run_telemetry_processes_in_order() {
        let store = Arc::new(MemoryStore::new());
        let (event_tx, event_rx) = mpsc::channel(16);
        let (update_tx, mut update_rx) = mpsc::channel(16);

        send_all(&event_tx, &[(1000, 5), (2000, 10), (100, 2)]).await;
        event_tx.send(TelemetryEvent::Disconnected).await.unwrap();

        let monitor = TelemetryMonitor::new("dev", Arc::clone(&store));
        let monitor = run_telemetry(monitor, event_rx, update_tx).await;

        let mut received = Vec::new();
        while let Ok(update) = update_rx.try_recv() {
            received.push(update);
        }
        assert!(matches!(
            received.first(),
            Some(TelemetryUpdate::LeaderboardLoaded(r)) if r.is_empty()
        ));
        assert!(received.iter().any(|u| matches!(u, TelemetryUpdate::RunCompleted { .. })));
        assert_eq!(received.last(), Some(&TelemetryUpdate::Disconnected));
        assert_eq!(monitor.leaderboard().len(), 1);
        assert!(store.get(DEFAULT_LEADERBOARD_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_telemetry_reloads_previous_sessions() {
        let store = Arc::new(MemoryStore::new());
        let mut first = TelemetryMonitor::new("dev", Arc::clone(&store));
        notify(&mut first, 4000, 10);
        notify(&mut first, 100, 1);

        let (event_tx, event_rx) = mpsc::channel(1);
        let (update_tx, mut update_rx) = mpsc::channel(4);
        drop(event_tx);
        run_telemetry(TelemetryMonitor::new("dev", store), event_rx, update_tx).await;

        match update_rx.recv().await {
            Some(TelemetryUpdate::LeaderboardLoaded(records)) => assert_eq!(records.len(), 1),
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_store_does_not_hold_up_samples() {
        let (release, gate) = std::sync::mpsc::channel();
        let inner = Arc::new(MemoryStore::new());
        let store = GatedStore {
            inner: Arc::clone(&inner),
            gate: Arc::new(Mutex::new(gate)),
        };
        let (event_tx, event_rx) = mpsc::channel(16);
        let (update_tx, mut update_rx) = mpsc::channel(16);
        let engine = tokio::spawn(run_telemetry(
            TelemetryMonitor::new("dev", store),
            event_rx,
            update_tx,
        ));

        // The second sample completes a run; the third arrives while its
        // write is still blocked.
        send_all(&event_tx, &[(1000, 5), (100, 1), (200, 2)]).await;
        let mut received = Vec::new();
        while received.len() < 5 {
            received.push(update_rx.recv().await.unwrap());
        }
        assert!(matches!(
            received.last(),
            Some(TelemetryUpdate::RunUpdated(run)) if run.latest_rpm() == 200
        ));
        assert!(inner.get(DEFAULT_LEADERBOARD_KEY).unwrap().is_none());

        release.send(()).unwrap();
        drop(event_tx);
        let monitor = engine.await.unwrap();
        assert_eq!(monitor.leaderboard().len(), 1);
        assert!(inner.get(DEFAULT_LEADERBOARD_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_write_failure_reported_and_ranking_kept() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (update_tx, mut update_rx) = mpsc::channel(16);

        send_all(&event_tx, &[(1000, 5), (100, 1)]).await;
        event_tx.send(TelemetryEvent::Disconnected).await.unwrap();
        let monitor =
            run_telemetry(TelemetryMonitor::new("dev", ReadOnlyStore), event_rx, update_tx).await;

        let mut received = Vec::new();
        while let Ok(update) = update_rx.try_recv() {
            received.push(update);
        }
        assert!(received.iter().any(|u| matches!(
            u,
            TelemetryUpdate::LeaderboardUnavailable { reason } if reason.contains("read-only")
        )));
        assert_eq!(monitor.leaderboard().len(), 1);
    }
}
