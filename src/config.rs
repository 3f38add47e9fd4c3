//! Cache configuration
//!
//! `CacheSettings` holds the tunables shared by every component of the
//! repository. `CacheSettingsOverrides` is the partial form accepted by
//! `FeatureRepository::configure_cache`.

use std::time::Duration;

/// Default storage key for the persisted cache
pub const DEFAULT_PERSIST_KEY: &str = "featuresCache";

/// Tunables for caching, persistence and background sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// How long a fetched payload is considered fresh
    pub stale_ttl: Duration,
    /// Upper bound on the age of a cached payload that may still be served
    pub max_age: Duration,
    /// Key under which the cache is mirrored in the persistent store
    pub persist_key: String,
    /// Whether streams and pollers keep payloads up to date
    pub background_sync: bool,
    /// Maximum number of cached payloads
    pub max_entries: usize,
    /// Skip the idle watcher that suspends streams while hidden
    pub disable_idle_streams: bool,
    /// How long the app must stay hidden before streams are suspended
    pub idle_stream_interval: Duration,
    /// Bypass the cache entirely
    pub disable_cache: bool,
    /// Polling interval used when a key cannot be streamed
    pub poll_interval: Option<Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            stale_ttl: Duration::from_secs(60),
            max_age: Duration::from_secs(60 * 60 * 4), // 4 hours
            persist_key: DEFAULT_PERSIST_KEY.to_string(),
            background_sync: true,
            max_entries: 10,
            disable_idle_streams: false,
            idle_stream_interval: Duration::from_secs(20),
            disable_cache: false,
            poll_interval: None,
        }
    }
}

/// Partial settings merged into the current `CacheSettings`
///
/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct CacheSettingsOverrides {
    pub stale_ttl: Option<Duration>,
    pub max_age: Option<Duration>,
    pub persist_key: Option<String>,
    pub background_sync: Option<bool>,
    pub max_entries: Option<usize>,
    pub disable_idle_streams: Option<bool>,
    pub idle_stream_interval: Option<Duration>,
    pub disable_cache: Option<bool>,
    /// `Some(None)` turns polling off
    pub poll_interval: Option<Option<Duration>>,
}

impl CacheSettingsOverrides {
    /// Merges the set fields into `settings`
    pub fn apply(self, settings: &mut CacheSettings) {
        if let Some(v) = self.stale_ttl {
            settings.stale_ttl = v;
        }
        if let Some(v) = self.max_age {
            settings.max_age = v;
        }
        if let Some(v) = self.persist_key {
            settings.persist_key = v;
        }
        if let Some(v) = self.background_sync {
            settings.background_sync = v;
        }
        if let Some(v) = self.max_entries {
            settings.max_entries = v;
        }
        if let Some(v) = self.disable_idle_streams {
            settings.disable_idle_streams = v;
        }
        if let Some(v) = self.idle_stream_interval {
            settings.idle_stream_interval = v;
        }
        if let Some(v) = self.disable_cache {
            settings.disable_cache = v;
        }
        if let Some(v) = self.poll_interval {
            settings.poll_interval = v;
        }
    }
}

/// Converts a std duration into a chrono delta for timestamp arithmetic
pub(crate) fn to_delta(duration: Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}
