//! Opaque key/value persistence.
//!
//! The leaderboard is stored as a single blob under one key. [`FileStore`]
//! keeps one JSON file per key; [`MemoryStore`] is for tests and embedding in
//! hosts that persist elsewhere. Stores are shared with the leaderboard writer
//! task, so cloneable handles (`FileStore`, `Arc<MemoryStore>`) are the norm.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{MonitorError, Result};

/// Minimal blob store the leaderboard persists through.
pub trait KeyValueStore {
    /// Read the blob stored under `key`, or `None` if nothing was stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for &S {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).set(key, value)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).set(key, value)
    }
}

/// File-backed store writing `<data_dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `data_dir`.
    ///
    /// The directory is created on first write.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Create a store at the platform default location.
    ///
    /// # Errors
    ///
    /// Returns an error if no data directory can be determined.
    pub fn at_default_location() -> Result<Self> {
        Ok(Self::new(default_data_dir()?))
    }

    /// Directory holding the stored blobs.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{key}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MonitorError::PersistenceFailure(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.key_path(key);
        std::fs::create_dir_all(&self.data_dir).map_err(|e| {
            MonitorError::PersistenceFailure(format!(
                "Failed to create directory {}: {e}",
                self.data_dir.display()
            ))
        })?;

        // Write beside the target and rename so readers never see a torn blob.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)
            .and_then(|()| std::fs::rename(&tmp, &path))
            .map_err(|e| {
                MonitorError::PersistenceFailure(format!(
                    "Failed to write {}: {e}",
                    path.display()
                ))
            })
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_owned(), value.to_vec());
        Ok(())
    }
}

/// Platform data directory for gyrotrack, e.g. `~/.local/share/gyrotrack`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn default_data_dir() -> Result<PathBuf> {
    directories::ProjectDirs::from("", "", "gyrotrack")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| MonitorError::PersistenceFailure("Cannot determine data directory".into()))
}
