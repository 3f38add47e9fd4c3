//! In-memory feature payload cache
//!
//! `CacheStore` maps cache keys to the latest payload seen for them, along
//! with the payload version and the instant it goes stale. The whole map can
//! be serialized to a single JSON document and mirrored to a
//! [`PersistentStore`], which is how a later process picks the cache back up.

mod persist;

pub use persist::{FileStore, MemoryStore, PersistentStore, StoreError};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached payload with its freshness metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// The feature payload as returned by the API
    pub payload: Value,
    /// Payload version (`dateUpdated`), empty if the payload carries none
    pub version: String,
    /// When the payload stops being fresh
    pub stale_at: DateTime<Utc>,
    /// Whether the backend for this entry supports streaming updates
    pub stream_capable: bool,
}

impl CacheEntry {
    /// Builds an entry for `payload` that goes stale at `stale_at`
    pub fn new(payload: Value, stale_at: DateTime<Utc>, stream_capable: bool) -> Self {
        let version = payload_version(&payload).to_string();
        Self {
            payload,
            version,
            stale_at,
            stream_capable,
        }
    }
}

/// Extracts the version string of a payload
pub fn payload_version(payload: &Value) -> &str {
    payload
        .get("dateUpdated")
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Map from cache key to cached payload
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: HashMap<String, CacheEntry>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: CacheEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Removes the entries that go stale first until at most `max_entries` remain
    ///
    /// Returns the number of evicted entries.
    pub fn evict_to(&mut self, max_entries: usize) -> usize {
        let excess = self.entries.len().saturating_sub(max_entries);
        if excess == 0 {
            return 0;
        }

        let mut by_staleness: Vec<(DateTime<Utc>, String)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.stale_at, key.clone()))
            .collect();
        by_staleness.sort();

        for (_, key) in by_staleness.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        excess
    }

    /// Snapshot of every entry, ordered by key
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        let mut entries: Vec<(String, CacheEntry)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Serializes the cache as a JSON array of `[key, entry]` pairs
    pub fn to_json(&self) -> serde_json::Result<String> {
        let pairs: Vec<(&String, &CacheEntry)> = self.entries.iter().collect();
        serde_json::to_string(&pairs)
    }

    /// Loads entries from the JSON produced by [`CacheStore::to_json`]
    ///
    /// Existing entries with the same key are replaced. Returns the number of
    /// entries read.
    pub fn hydrate(&mut self, json: &str) -> serde_json::Result<usize> {
        let pairs: Vec<(String, CacheEntry)> = serde_json::from_str(json)?;
        let count = pairs.len();
        self.entries.extend(pairs);
        Ok(count)
    }
}
