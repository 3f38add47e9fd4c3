//! Fetch coordination
//!
//! Network retrieval of feature payloads. Every cache key has at most one
//! request in flight: the request runs as a shared future, spawned on its own
//! task, and every caller that asks for the same cache key while it is
//! pending awaits the same result. Failures come back as `FetchResult`
//! values rather than errors.

use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{payload_version, CacheEntry};
use crate::config::to_delta;
use crate::consumer::{cache_key, remote_eval_body, subscription_key, FeatureConsumer};
use crate::repository::{RepositoryInner, State};
use crate::transport::{HttpRequest, Method, TransportError};

/// Response header advertising streaming support
const STREAM_SUPPORT_HEADER: &str = "x-sse-support";

/// Errors carried by a failed `FetchResult`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The API answered with a non-2xx status
    #[error("HTTP error: {0}")]
    Status(u16),

    /// The request never produced a response
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body is not valid JSON
    #[error("invalid payload: {0}")]
    Parse(String),

    /// No response arrived within the caller's timeout
    #[error("Timeout")]
    Timeout,
}

impl From<TransportError> for FetchError {
    fn from(e: TransportError) -> Self {
        FetchError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Parse(e.to_string())
    }
}

/// Where a `FetchResult` came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Network,
    Error,
    Timeout,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Cache => "cache",
            Source::Network => "network",
            Source::Error => "error",
            Source::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of asking the repository for a payload
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub data: Option<Value>,
    pub success: bool,
    pub source: Source,
    pub error: Option<FetchError>,
}

impl FetchResult {
    pub(crate) fn cached(data: Value) -> Self {
        Self {
            data: Some(data),
            success: true,
            source: Source::Cache,
            error: None,
        }
    }

    pub(crate) fn network(data: Value) -> Self {
        Self {
            data: Some(data),
            success: true,
            source: Source::Network,
            error: None,
        }
    }

    pub(crate) fn failed(error: FetchError) -> Self {
        Self {
            data: None,
            success: false,
            source: Source::Error,
            error: Some(error),
        }
    }

    pub(crate) fn timeout() -> Self {
        Self {
            data: None,
            success: false,
            source: Source::Timeout,
            error: Some(FetchError::Timeout),
        }
    }
}

/// Handle on an in-flight fetch, cloneable by every waiter
pub(crate) type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

pub(crate) struct ActiveFetch {
    id: u64,
    result: SharedFetch,
}

/// Builds the API request for a consumer
fn build_request(consumer: &dyn FeatureConsumer) -> HttpRequest {
    let host = consumer.api_host();
    let client_key = consumer.client_key();
    let mut headers = consumer.api_request_headers();

    if consumer.is_remote_eval() {
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "application/json".to_string());
        HttpRequest {
            method: Method::Post,
            url: format!("{}/api/eval/{}", host, client_key),
            headers,
            body: Some(remote_eval_body(consumer).to_string()),
        }
    } else {
        HttpRequest {
            method: Method::Get,
            url: format!("{}/api/features/{}", host, client_key),
            headers,
            body: None,
        }
    }
}

impl RepositoryInner {
    /// Starts a fetch for the consumer's cache key, or joins the one in flight
    ///
    /// The fetch runs to completion even if the returned handle is dropped.
    pub(crate) fn fetch_features(self: &Arc<Self>, consumer: Arc<dyn FeatureConsumer>) -> SharedFetch {
        let key = subscription_key(consumer.as_ref());
        let cache_key = cache_key(consumer.as_ref());

        let mut state = self.lock();
        if let Some(active) = state.active_fetches.get(&cache_key) {
            debug!(%cache_key, "joining in-flight fetch");
            return active.result.clone();
        }

        let id = self.next_id();
        let request = build_request(consumer.as_ref());
        let inner = Arc::clone(self);
        let fetch_key = cache_key.clone();
        let result = async move { inner.run_fetch(id, consumer, request, key, fetch_key).await }
            .boxed()
            .shared();
        state.active_fetches.insert(
            cache_key,
            ActiveFetch {
                id,
                result: result.clone(),
            },
        );
        drop(state);

        tokio::spawn(result.clone());
        result
    }

    /// Fire-and-forget variant of [`RepositoryInner::fetch_features`]
    pub(crate) fn refresh_in_background(self: &Arc<Self>, consumer: Arc<dyn FeatureConsumer>) {
        let _pending = self.fetch_features(consumer);
    }

    async fn run_fetch(
        self: Arc<Self>,
        id: u64,
        consumer: Arc<dyn FeatureConsumer>,
        request: HttpRequest,
        key: String,
        cache_key: String,
    ) -> FetchResult {
        let url = request.url.clone();

        let result = match self.retrieve(&key, request).await {
            Ok(payload) => {
                {
                    let mut state = self.lock();
                    self.apply_new_data(&mut state, &key, &cache_key, payload.clone());
                }
                self.start_auto_refresh(&consumer, false);
                debug!(%url, "fetched features");
                FetchResult::network(payload)
            }
            Err(error) => {
                consumer.log(
                    "Error fetching features",
                    &json!({
                        "apiHost": consumer.api_host(),
                        "clientKey": consumer.client_key(),
                        "error": error.to_string(),
                    }),
                );
                warn!(%url, %error, "fetching features failed");
                FetchResult::failed(error)
            }
        };

        self.finish_fetch(&cache_key, id);
        result
    }

    async fn retrieve(&self, key: &str, request: HttpRequest) -> Result<Value, FetchError> {
        let response = self.http.send(request).await?;
        if !response.ok() {
            return Err(FetchError::Status(response.status));
        }
        if response.header(STREAM_SUPPORT_HEADER) == Some("enabled") {
            self.lock().stream_capable.insert(key.to_string());
        }
        Ok(response.json()?)
    }

    /// Drops the in-flight record unless a newer fetch already replaced it
    fn finish_fetch(&self, cache_key: &str, id: u64) {
        let mut state = self.lock();
        if state.active_fetches.get(cache_key).map(|active| active.id) == Some(id) {
            state.active_fetches.remove(cache_key);
        }
    }

    /// Stores a freshly received payload and fans it out to subscribers
    ///
    /// A payload whose version matches the cached one only extends the
    /// cached entry's freshness; subscribers are not notified.
    pub(crate) fn apply_new_data(
        self: &Arc<Self>,
        state: &mut State,
        key: &str,
        cache_key: &str,
        payload: Value,
    ) {
        let now = self.now();
        let stale_at = now
            .checked_add_signed(to_delta(state.settings.stale_ttl))
            .unwrap_or(now);

        if !state.settings.disable_cache {
            let version = payload_version(&payload);
            if let Some(existing) = state.cache.get_mut(cache_key) {
                if !version.is_empty() && existing.version == version {
                    existing.stale_at = stale_at;
                    debug!(%cache_key, %version, "payload unchanged, extending freshness");
                    self.schedule_persist(state);
                    return;
                }
            }

            let stream_capable = state.stream_capable.contains(key);
            state.cache.insert(
                cache_key,
                CacheEntry::new(payload.clone(), stale_at, stream_capable),
            );
            let max_entries = state.settings.max_entries;
            let evicted = state.cache.evict_to(max_entries);
            if evicted > 0 {
                debug!(evicted, max_entries, "evicted cache entries over capacity");
            }
        }

        self.schedule_persist(state);
        state.subscriptions.notify(key, Some(payload));
    }
}
