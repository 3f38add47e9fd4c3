//! Feature repository
//!
//! `FeatureRepository` is the public entry point. It owns every piece of
//! shared state (cache, in-flight fetches, subscriptions, stream channels)
//! and applies the stale-while-revalidate policy: cached payloads are served
//! immediately, stale ones are refreshed in the background, and only a miss
//! waits on the network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::cache::{CacheEntry, CacheStore, PersistentStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{to_delta, CacheSettings, CacheSettingsOverrides};
use crate::consumer::{cache_key, subscription_key, FeatureConsumer};
use crate::fetch::{ActiveFetch, FetchResult};
use crate::refresh::{IdleWatcher, Visibility};
use crate::stream::{ChannelState, Poller, StreamChannel, StreamingError, StreamingOptions};
use crate::subscription::SubscriptionRegistry;
use crate::transport::{HttpTransport, ReqwestTransport, StreamTransport};

/// Options for [`FeatureRepository::get_data`]
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Give up waiting on the network after this long; zero means no limit
    pub timeout: Option<Duration>,
    /// Ignore the cached payload
    pub skip_cache: bool,
    /// Serve a stale payload instead of waiting on the network
    pub allow_stale: bool,
    /// Setting this to false turns background sync off for the repository
    pub background_sync: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            skip_cache: false,
            allow_stale: false,
            background_sync: true,
        }
    }
}

/// Mutable state shared by all components
#[derive(Default)]
pub(crate) struct State {
    pub(crate) settings: CacheSettings,
    pub(crate) cache: CacheStore,
    pub(crate) active_fetches: HashMap<String, ActiveFetch>,
    pub(crate) subscriptions: SubscriptionRegistry,
    /// Subscription keys whose backend supports streaming
    pub(crate) stream_capable: HashSet<String>,
    pub(crate) channels: HashMap<String, StreamChannel>,
    pub(crate) pollers: HashMap<String, Poller>,
    pub(crate) idle_watcher: Option<IdleWatcher>,
    persist_seq: u64,
}

/// A snapshot of the cache waiting to be written to the persistent store
struct PendingWrite {
    store: Arc<dyn PersistentStore>,
    key: String,
    value: String,
    seq: u64,
    written_seq: Arc<tokio::sync::Mutex<u64>>,
}

impl PendingWrite {
    /// Writes the snapshot unless a newer one has already been written
    async fn run(self) {
        let mut written = self.written_seq.lock().await;
        if *written > self.seq {
            return;
        }
        if let Err(e) = self.store.set_item(&self.key, &self.value).await {
            debug!(error = %e, "ignoring persistent cache write failure");
        }
        *written = self.seq;
    }
}

pub(crate) struct RepositoryInner {
    state: Mutex<State>,
    pub(crate) http: Arc<dyn HttpTransport>,
    pub(crate) stream: Option<Arc<dyn StreamTransport>>,
    store: Option<Arc<dyn PersistentStore>>,
    clock: Arc<dyn Clock>,
    visibility: Option<watch::Receiver<Visibility>>,
    /// Whether the cache has been hydrated from the persistent store
    initialized: tokio::sync::Mutex<bool>,
    written_seq: Arc<tokio::sync::Mutex<u64>>,
    ids: AtomicU64,
}

impl RepositoryInner {
    /// Locks the shared state; never held across an await
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    fn snapshot(&self, state: &mut State) -> Option<PendingWrite> {
        let store = self.store.clone()?;
        let value = match state.cache.to_json() {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "cache snapshot failed");
                return None;
            }
        };
        state.persist_seq += 1;
        Some(PendingWrite {
            store,
            key: state.settings.persist_key.clone(),
            value,
            seq: state.persist_seq,
            written_seq: Arc::clone(&self.written_seq),
        })
    }

    /// Mirrors the cache to the persistent store without waiting for it
    pub(crate) fn schedule_persist(&self, state: &mut State) {
        if let Some(write) = self.snapshot(state) {
            tokio::spawn(write.run());
        }
    }

    /// Hydrates the cache from the persistent store, once
    async fn initialize(self: &Arc<Self>) {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return;
        }
        *initialized = true;

        let (persist_key, disable_cache) = {
            let state = self.lock();
            (state.settings.persist_key.clone(), state.settings.disable_cache)
        };

        if let Some(store) = &self.store {
            match store.get_item(&persist_key).await {
                Ok(Some(value)) if !disable_cache => {
                    let mut state = self.lock();
                    match state.cache.hydrate(&value) {
                        Ok(count) => {
                            let max_entries = state.settings.max_entries;
                            let evicted = state.cache.evict_to(max_entries);
                            debug!(count, evicted, "hydrated feature cache");
                        }
                        Err(e) => debug!(error = %e, "ignoring malformed persisted cache"),
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "ignoring persistent cache read failure"),
            }
        }

        let mut state = self.lock();
        if !state.settings.disable_idle_streams {
            if let Some(visibility) = &self.visibility {
                let idle_after = state.settings.idle_stream_interval;
                state.idle_watcher = Some(IdleWatcher::spawn(
                    Arc::downgrade(self),
                    visibility.clone(),
                    idle_after,
                ));
            }
        }
    }
}

/// Builder for [`FeatureRepository`]
#[derive(Default)]
pub struct RepositoryBuilder {
    settings: CacheSettings,
    http: Option<Arc<dyn HttpTransport>>,
    stream: Option<Arc<dyn StreamTransport>>,
    store: Option<Arc<dyn PersistentStore>>,
    clock: Option<Arc<dyn Clock>>,
    visibility: Option<watch::Receiver<Visibility>>,
}

impl RepositoryBuilder {
    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    /// HTTP transport; defaults to [`ReqwestTransport`]
    pub fn http(mut self, http: Arc<dyn HttpTransport>) -> Self {
        self.http = Some(http);
        self
    }

    /// Stream transport; without one, nothing is streamed
    pub fn stream(mut self, stream: Arc<dyn StreamTransport>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Persistent store; without one, the cache lives in memory only
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Visibility signals driving idle stream suspension
    pub fn visibility(mut self, visibility: watch::Receiver<Visibility>) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn build(self) -> FeatureRepository {
        let state = State {
            settings: self.settings,
            ..State::default()
        };
        FeatureRepository {
            inner: Arc::new(RepositoryInner {
                state: Mutex::new(state),
                http: self
                    .http
                    .unwrap_or_else(|| Arc::new(ReqwestTransport::new())),
                stream: self.stream,
                store: self.store,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                visibility: self.visibility,
                initialized: tokio::sync::Mutex::new(false),
                written_seq: Arc::new(tokio::sync::Mutex::new(0)),
                ids: AtomicU64::new(1),
            }),
        }
    }
}

/// Feature payload cache with background synchronization
///
/// Cloning is cheap; clones share state. Methods that start background work
/// must be called from within a tokio runtime.
#[derive(Clone)]
pub struct FeatureRepository {
    inner: Arc<RepositoryInner>,
}

impl Default for FeatureRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureRepository {
    /// Repository with default settings, reqwest HTTP and no persistence
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RepositoryBuilder {
        RepositoryBuilder::default()
    }

    /// Returns the consumer's payload, from cache when possible
    ///
    /// # Behavior
    /// - A fresh cached payload is returned and background sync is confirmed
    /// - A stale cached payload (when still within `max_age`, and either
    ///   `allow_stale` is set or it is merely past `stale_at`) is returned
    ///   while a refresh runs in the background
    /// - Otherwise the network is awaited, up to `timeout`
    ///
    /// Failures are reported through the returned `FetchResult`.
    pub async fn get_data(
        &self,
        consumer: &Arc<dyn FeatureConsumer>,
        options: FetchOptions,
    ) -> FetchResult {
        let inner = &self.inner;
        if !options.background_sync {
            inner.lock().settings.background_sync = false;
        }
        inner.initialize().await;

        let key = subscription_key(consumer.as_ref());
        let cache_key = cache_key(consumer.as_ref());
        let now = inner.now();

        let cached = {
            let mut guard = inner.lock();
            let state = &mut *guard;
            let settings = &state.settings;
            // Entries older than max_age - stale_ttl are treated as expired
            let min_stale_at = now
                .checked_sub_signed(to_delta(settings.max_age))
                .and_then(|t| t.checked_add_signed(to_delta(settings.stale_ttl)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let existing = if settings.disable_cache || options.skip_cache {
                None
            } else {
                state.cache.get(&cache_key).cloned()
            };

            match existing {
                Some(entry)
                    if (options.allow_stale || entry.stale_at > now)
                        && entry.stale_at > min_stale_at =>
                {
                    if entry.stream_capable {
                        state.stream_capable.insert(key);
                    }
                    Some(entry)
                }
                _ => None,
            }
        };

        if let Some(entry) = cached {
            if entry.stale_at < now {
                debug!(%cache_key, "serving stale features, refreshing in background");
                inner.refresh_in_background(Arc::clone(consumer));
            } else {
                debug!(%cache_key, "serving features from cache");
                inner.start_auto_refresh(consumer, false);
            }
            return FetchResult::cached(entry.payload);
        }

        debug!(%cache_key, "cache miss, fetching features");
        let fetch = inner.fetch_features(Arc::clone(consumer));
        match options.timeout.filter(|timeout| !timeout.is_zero()) {
            Some(timeout) => tokio::time::timeout(timeout, fetch)
                .await
                .unwrap_or_else(|_| {
                    debug!(%cache_key, ?timeout, "fetch timed out");
                    FetchResult::timeout()
                }),
            None => fetch.await,
        }
    }

    /// Merges new settings; turning background sync off stops all streams
    pub fn configure_cache(&self, overrides: CacheSettingsOverrides) {
        let mut state = self.inner.lock();
        overrides.apply(&mut state.settings);
        if !state.settings.background_sync {
            state.clear_auto_refresh();
        }
    }

    /// Forgets every cached payload and background sync, and persists the empty cache
    pub async fn clear_cache(&self) {
        let inner = &self.inner;
        let mut initialized = inner.initialized.lock().await;
        let write = {
            let mut state = inner.lock();
            state.cache.clear();
            state.active_fetches.clear();
            state.clear_auto_refresh();
            inner.snapshot(&mut state)
        };
        *initialized = false;
        drop(initialized);

        if let Some(write) = write {
            write.run().await;
        }
    }

    /// Subscribes a consumer to live updates
    ///
    /// # Errors
    /// Returns `StreamingError::MissingClientKey` if streaming is requested
    /// for a consumer without a client key.
    pub fn start_streaming(
        &self,
        consumer: &Arc<dyn FeatureConsumer>,
        options: StreamingOptions,
    ) -> Result<(), StreamingError> {
        if !options.streaming {
            return Ok(());
        }
        if consumer.client_key().is_empty() {
            return Err(StreamingError::MissingClientKey);
        }
        if options.payload_provided {
            self.inner.start_auto_refresh(consumer, true);
        }
        self.inner.lock().subscriptions.subscribe(consumer);
        Ok(())
    }

    /// Stops pushing updates to a consumer
    pub fn unsubscribe(&self, consumer: &Arc<dyn FeatureConsumer>) {
        self.inner.lock().subscriptions.unsubscribe(consumer);
    }

    /// Suspends every stream, e.g. while the application is hidden
    pub fn on_hidden(&self) {
        self.inner.on_hidden();
    }

    /// Resumes suspended streams immediately
    pub fn on_visible(&self) {
        self.inner.on_visible();
    }

    pub fn settings(&self) -> CacheSettings {
        self.inner.lock().settings.clone()
    }

    /// Snapshot of the cached entries, ordered by cache key
    pub fn cache_entries(&self) -> Vec<(String, CacheEntry)> {
        self.inner.lock().cache.entries()
    }

    /// Whether a stream channel or poller keeps this consumer's key up to date
    pub fn is_auto_refreshing(&self, consumer: &dyn FeatureConsumer) -> bool {
        let key = subscription_key(consumer);
        let state = self.inner.lock();
        state.channels.contains_key(&key) || state.pollers.contains_key(&key)
    }

    /// State of the stream channel serving this consumer, if any
    pub fn channel_state(&self, consumer: &dyn FeatureConsumer) -> Option<ChannelState> {
        let key = subscription_key(consumer);
        self.inner.lock().channels.get(&key).map(StreamChannel::state)
    }
}
