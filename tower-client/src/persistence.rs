//! Board persistence through a key-value store.
//!
//! Three keys are used:
//! - `history`: the operation log as `[[sequenceKey, event], ...]`
//! - `lastSnapshot`: the latest snapshot, `{id, elements, elementHash}`
//! - `selfId`: this peer's id, so it survives restarts
//!
//! [`MemoryStore`] keeps values in memory (tests, ephemeral sessions);
//! [`FileStore`] writes one `<key>.json` file per key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tower_core::{OperationLog, Snapshot};
use tower_types::{HistoryEntries, PeerId};
use tracing::debug;

/// Key holding the operation log.
pub const HISTORY_KEY: &str = "history";
/// Key holding the latest snapshot.
pub const SNAPSHOT_KEY: &str = "lastSnapshot";
/// Key holding this peer's id.
pub const SELF_ID_KEY: &str = "selfId";

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying storage failed.
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be parsed.
    #[error("stored {key} is corrupt: {source}")]
    Corrupt {
        /// Key whose value is unreadable.
        key: String,
        /// Parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be serialized.
    #[error("could not serialize value: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// A string key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Value under `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Replace the value under `key`.
    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete `key`. Missing keys are not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<String, String>,
    saves: usize,
    fail_next_save: Option<String>,
}

/// In-memory store.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves so far.
    pub fn saves(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.saves
    }

    /// Raw value under `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(key).cloned()
    }

    /// Cause the next save() to fail.
    pub fn fail_next_save(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_save = Some(error.to_string());
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_save.take() {
            return Err(StoreError::Io(std::io::Error::other(error)));
        }

        inner.entries.insert(key.to_string(), value.to_string());
        inner.saves += 1;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(key);
        Ok(())
    }
}

/// Store writing `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Store under `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        // Readers only ever see a complete file.
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, self.path(key)).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// What a store holds for one board.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StoredBoard {
    /// Persisted log entries.
    pub history: HistoryEntries,
    /// Persisted snapshot.
    pub snapshot: Option<Snapshot>,
}

/// Load the persisted log and snapshot. Missing keys load as empty.
pub async fn load_board(store: &dyn KeyValueStore) -> Result<StoredBoard, StoreError> {
    let history = match store.load(HISTORY_KEY).await? {
        Some(json) => serde_json::from_str(&json).map_err(|source| StoreError::Corrupt {
            key: HISTORY_KEY.to_string(),
            source,
        })?,
        None => Vec::new(),
    };
    let snapshot = match store.load(SNAPSHOT_KEY).await? {
        Some(json) => Some(serde_json::from_str(&json).map_err(|source| StoreError::Corrupt {
            key: SNAPSHOT_KEY.to_string(),
            source,
        })?),
        None => None,
    };
    Ok(StoredBoard { history, snapshot })
}

/// Persist the log and snapshot. Skipped while the log is empty; returns
/// whether anything was written.
pub async fn save_board(
    store: &dyn KeyValueStore,
    log: &OperationLog,
    snapshot: Option<&Snapshot>,
) -> Result<bool, StoreError> {
    if log.is_empty() {
        return Ok(false);
    }

    let history = serde_json::to_string(&log.to_entries()).map_err(StoreError::Serialize)?;
    store.save(HISTORY_KEY, &history).await?;
    if let Some(snapshot) = snapshot {
        let json = serde_json::to_string(snapshot).map_err(StoreError::Serialize)?;
        store.save(SNAPSHOT_KEY, &json).await?;
    }
    debug!("saved {} log entries", log.len());
    Ok(true)
}

/// Remove the persisted log and snapshot.
pub async fn clear_board(store: &dyn KeyValueStore) -> Result<(), StoreError> {
    store.remove(HISTORY_KEY).await?;
    store.remove(SNAPSHOT_KEY).await
}

/// This peer's persisted id, generating and saving one on first use.
pub async fn load_or_create_peer_id(store: &dyn KeyValueStore) -> Result<PeerId, StoreError> {
    if let Some(json) = store.load(SELF_ID_KEY).await? {
        return serde_json::from_str(&json).map_err(|source| StoreError::Corrupt {
            key: SELF_ID_KEY.to_string(),
            source,
        });
    }

    let id = PeerId::generate();
    let json = serde_json::to_string(&id).map_err(StoreError::Serialize)?;
    store.save(SELF_ID_KEY, &json).await?;
    debug!("generated peer id {}", id);
    Ok(id)
}
