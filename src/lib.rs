//! flagsync
//!
//! Client-side synchronization of remote feature payloads: a local cache with
//! stale-while-revalidate reads, one network request per cache key at a time,
//! and live updates over server-sent events with reconnect backoff.

pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod refresh;
pub mod transport;

mod fetch;
mod repository;
mod stream;
mod subscription;

#[cfg(test)]
mod testing;

pub use cache::{CacheEntry, FileStore, MemoryStore, PersistentStore, StoreError};
pub use config::{CacheSettings, CacheSettingsOverrides};
pub use consumer::FeatureConsumer;
pub use fetch::{FetchError, FetchResult, Source};
pub use refresh::Visibility;
pub use repository::{FeatureRepository, FetchOptions, RepositoryBuilder};
pub use stream::{ChannelState, StreamingError, StreamingOptions, FEATURES_EVENT, FEATURES_UPDATED_EVENT};
