//! Snapshot persistence
//!
//! Gateways serialise their full state to JSON at every commit point, before
//! handing the resulting message to the channel. A restarted gateway loads the
//! last snapshot and replays in-flight messages with their original ids.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{BridgeError, Result};

pub trait SnapshotStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn save(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

pub fn save_json<T: Serialize>(store: &dyn SnapshotStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| BridgeError::Storage(format!("failed to serialise {}: {}", key, e)))?;
    store.save(key, &bytes)
}

pub fn load_json<T: DeserializeOwned>(store: &dyn SnapshotStore, key: &str) -> Result<Option<T>> {
    match store.load(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| BridgeError::Storage(format!("failed to parse {}: {}", key, e))),
        None => Ok(None),
    }
}

/// Volatile store for tests and single-run simulations
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| BridgeError::Storage("memory store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BridgeError::Storage("memory store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// One JSON file per key inside a directory
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves the previous snapshot intact.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            BridgeError::Storage(format!("failed to create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(BridgeError::Storage(format!("invalid snapshot key: {:?}", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl SnapshotStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BridgeError::Storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(|e| {
            BridgeError::Storage(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            BridgeError::Storage(format!("failed to rename {}: {}", tmp.display(), e))
        })?;
        Ok(())
    }
}
