//! Top-N ranking of completed workouts.
//!
//! Records are ranked by average RPM, highest first. Ties keep insertion order.
//! The ranked list is persisted as one versioned JSON blob:
//!
//! ```json
//! { "version": 1, "records": [ { "id": "…", "device_id": "…", "average_rpm": 4120.5, … } ] }
//! ```
//!
//! Blobs written by the first mobile release (a bare array with a raw
//! `rpmWindow` per entry) are migrated on load.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};
use crate::session::RunRecord;
use crate::storage::KeyValueStore;
use crate::window::RollingWindow;

/// Current blob schema version.
pub const LEADERBOARD_VERSION: u32 = 1;

/// Default number of ranked records kept.
pub const DEFAULT_LEADERBOARD_SIZE: usize = 10;

/// Default store key for the leaderboard blob.
pub const DEFAULT_LEADERBOARD_KEY: &str = "records";

#[derive(Serialize)]
struct VersionedBlobRef<'a> {
    version: u32,
    records: &'a [RunRecord],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredBlob {
    Versioned {
        version: u32,
        records: serde_json::Value,
    },
    Legacy(Vec<LegacyRun>),
}

/// Entry layout of the unversioned format.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRun {
    device_id: String,
    v1: u8,
    rpm: u16,
    rpm_window: Vec<u16>,
    max_rpm: u16,
    duration: u16,
    rotation: u16,
}

impl LegacyRun {
    fn migrate(self) -> Option<RunRecord> {
        let mut window = RollingWindow::new(self.rpm_window.len());
        for rpm in self.rpm_window {
            window.push(rpm);
        }
        let average_rpm = window.average().ok()?;
        Some(RunRecord::restore(
            self.device_id,
            self.v1,
            self.rpm,
            average_rpm,
            self.max_rpm,
            self.duration,
            self.rotation,
        ))
    }
}

/// Serialize records into the current blob format.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(records: &[RunRecord]) -> Result<Vec<u8>> {
    let blob = VersionedBlobRef {
        version: LEADERBOARD_VERSION,
        records,
    };
    Ok(serde_json::to_vec(&blob)?)
}

/// Parse a stored blob in the current or legacy format.
///
/// # Errors
///
/// Returns [`MonitorError::CorruptLeaderboard`] if the blob is not valid JSON,
/// does not match a known layout, or carries an unknown version.
pub fn decode(bytes: &[u8]) -> Result<Vec<RunRecord>> {
    match serde_json::from_slice::<StoredBlob>(bytes)? {
        StoredBlob::Versioned { version, records } if version == LEADERBOARD_VERSION => {
            Ok(serde_json::from_value(records)?)
        }
        StoredBlob::Versioned { version, .. } => Err(MonitorError::CorruptLeaderboard(format!(
            "unsupported leaderboard version {version}"
        ))),
        StoredBlob::Legacy(runs) => {
            debug!(entries = runs.len(), "Migrating unversioned leaderboard");
            Ok(runs.into_iter().filter_map(LegacyRun::migrate).collect())
        }
    }
}

/// Ranked, persisted list of the best workouts.
#[derive(Debug)]
pub struct Leaderboard<S> {
    store: S,
    key: String,
    capacity: usize,
    entries: Vec<RunRecord>,
}

impl<S: KeyValueStore> Leaderboard<S> {
    /// Create an empty leaderboard using the default key and size.
    ///
    /// Call [`Leaderboard::load`] to read what the store already holds.
    pub fn new(store: S) -> Self {
        Self::with_settings(store, DEFAULT_LEADERBOARD_KEY, DEFAULT_LEADERBOARD_SIZE)
    }

    /// Create an empty leaderboard stored under `key` and keeping `capacity`
    /// records.
    pub fn with_settings(store: S, key: impl Into<String>, capacity: usize) -> Self {
        Self {
            store,
            key: key.into(),
            capacity,
            entries: Vec::new(),
        }
    }

    /// Load the persisted leaderboard into memory.
    ///
    /// A missing or unreadable blob loads as an empty leaderboard.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store itself fails; the in-memory entries
    /// are left unchanged in that case.
    pub fn load(&mut self) -> Result<&[RunRecord]> {
        let stored = self.store.get(&self.key);
        self.restore(stored)
    }

    /// Replace the entries with the outcome of a store read done elsewhere.
    pub(crate) fn restore(&mut self, stored: Result<Option<Vec<u8>>>) -> Result<&[RunRecord]> {
        self.entries = match stored? {
            None => Vec::new(),
            Some(bytes) => match decode(&bytes) {
                Ok(mut records) => {
                    sort_ranked(&mut records);
                    records.truncate(self.capacity);
                    records
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Ignoring unreadable leaderboard");
                    Vec::new()
                }
            },
        };
        Ok(&self.entries)
    }

    /// Rank `record` among the current entries and persist the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails. The in-memory ranking still
    /// includes `record`.
    pub fn insert(&mut self, record: RunRecord) -> Result<()> {
        let blob = self.rank(record)?;
        self.store.set(&self.key, &blob)
    }

    /// Rank `record` among the current entries without touching the store.
    ///
    /// Returns the encoded blob for the caller to persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the ranked list cannot be serialized.
    pub fn rank(&mut self, record: RunRecord) -> Result<Vec<u8>> {
        self.entries.push(record);
        sort_ranked(&mut self.entries);
        self.entries.truncate(self.capacity);
        encode(&self.entries)
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Store key of the blob.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Ranked records, best first.
    #[must_use]
    pub fn entries(&self) -> &[RunRecord] {
        &self.entries
    }

    /// Maximum number of records kept.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Stable sort, highest average first; ties keep their current order.
fn sort_ranked(records: &mut [RunRecord]) {
    records.sort_by(|a, b| b.average_rpm().total_cmp(&a.average_rpm()));
}
