//! Persistent key-value stores for mirroring the cache
//!
//! Provides the `PersistentStore` seam plus two implementations: a
//! `FileStore` that keeps one JSON file per key in an XDG-compliant cache
//! directory, and an in-process `MemoryStore`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use directories::ProjectDirs;
use thiserror::Error;

/// Errors reported by a persistent store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem access failed
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The store cannot be used right now
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Asynchronous string key-value storage
///
/// Both operations may fail independently; the repository ignores failures.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Reads the value stored under `key`, `None` if nothing was stored
    async fn get_item(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Stores values as files on disk
///
/// Uses `~/.cache/flagsync/` on Linux, or the equivalent XDG path on other
/// platforms. Each key maps to `<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    /// Directory where values are stored
    dir: PathBuf,
}

impl FileStore {
    /// Creates a FileStore in the XDG cache directory
    ///
    /// Returns `None` if the cache directory cannot be determined (e.g., no home directory).
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "flagsync")?;
        Some(Self {
            dir: project_dirs.cache_dir().to_path_buf(),
        })
    }

    /// Creates a FileStore rooted at a custom directory
    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Returns the file backing `key`
    fn path(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.path(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path(key), value).await?;
        Ok(())
    }
}

/// Keeps values in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        let items = self
            .items
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))?;
        Ok(items.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
