//! Streaming updates
//!
//! One channel per subscription key keeps a server-sent event connection
//! open while background sync is on. Channels move between three states:
//!
//! - `Active`: connected and receiving events
//! - `Disabled`: connection dropped after repeated errors, waiting for a
//!   scheduled reconnect
//! - `Idle`: suspended because the application is hidden; only a visibility
//!   change brings it back
//!
//! Keys that cannot be streamed fall back to polling when a poll interval is
//! configured.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::consumer::{cache_key, subscription_key, FeatureConsumer};
use crate::repository::{RepositoryInner, State};
use crate::transport::StreamEvent;

/// Full payload replacement
pub const FEATURES_EVENT: &str = "features";
/// Signal that the payload changed and must be re-fetched
pub const FEATURES_UPDATED_EVENT: &str = "features-updated";

/// Consecutive errors tolerated before backing off
const ERROR_THRESHOLD: u32 = 3;
const MAX_BACKOFF_MS: f64 = 300_000.0;

/// Misconfiguration detected when starting a stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamingError {
    #[error("Must specify clientKey to enable streaming")]
    MissingClientKey,
}

/// Lifecycle state of a stream channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Active,
    Disabled,
    Idle,
}

/// Options for `FeatureRepository::start_streaming`
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamingOptions {
    /// Whether the consumer wants live updates at all
    pub streaming: bool,
    /// The consumer was initialized with a payload, so no fetch will start
    /// the stream on its behalf
    pub payload_provided: bool,
}

/// Delay before reconnecting after `errors` consecutive failures
///
/// `jitter_ms` is expected in `[1000, 2000)`.
pub(crate) fn backoff_delay(errors: u32, jitter_ms: f64) -> Duration {
    let exponent = i32::try_from(errors).unwrap_or(i32::MAX) - ERROR_THRESHOLD as i32;
    let ms = (3f64.powi(exponent) * jitter_ms).min(MAX_BACKOFF_MS);
    Duration::from_millis(ms as u64)
}

fn jitter_ms() -> f64 {
    rand::rng().random_range(1000.0..2000.0)
}

/// An open connection; dropping it stops the reader and closes the stream
struct Connection {
    id: u64,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub(crate) struct StreamChannel {
    id: u64,
    key: String,
    cache_key: String,
    host: String,
    client_key: String,
    headers: HashMap<String, String>,
    errors: u32,
    state: ChannelState,
    connection: Option<Connection>,
    /// Consumer that opened the channel, used for diagnostics
    logger: Weak<dyn FeatureConsumer>,
}

impl StreamChannel {
    fn disable(&mut self) {
        if self.connection.take().is_none() {
            return;
        }
        if self.state == ChannelState::Active {
            self.state = ChannelState::Disabled;
        }
    }

    /// Counts an error and returns the reconnect delay once the channel must back off
    fn record_error(&mut self, closed: bool) -> Option<Duration> {
        if self.state == ChannelState::Idle {
            return None;
        }
        self.errors += 1;
        if self.errors > ERROR_THRESHOLD || closed {
            Some(backoff_delay(self.errors, jitter_ms()))
        } else {
            None
        }
    }

    fn connection_id(&self) -> Option<u64> {
        self.connection.as_ref().map(|connection| connection.id)
    }

    fn log(&self, message: &str, error: &str) {
        if let Some(consumer) = self.logger.upgrade() {
            consumer.log(
                message,
                &json!({
                    "streamingHost": self.host,
                    "clientKey": self.client_key,
                    "error": error,
                }),
            );
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }
}

/// Background poll loop; aborted on drop
pub(crate) struct Poller(JoinHandle<()>);

impl Drop for Poller {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl State {
    /// Stops every stream and poller and forgets all subscriptions
    pub(crate) fn clear_auto_refresh(&mut self) {
        self.stream_capable.clear();
        for (_, mut channel) in self.channels.drain() {
            channel.disable();
        }
        self.pollers.clear();
        self.subscriptions.clear();
        self.idle_watcher = None;
    }
}

impl RepositoryInner {
    /// Makes sure the consumer's payload is kept up to date in the background
    ///
    /// Streams when the key supports it (or `force_stream` is set), otherwise
    /// polls if a poll interval is configured.
    pub(crate) fn start_auto_refresh(
        self: &Arc<Self>,
        consumer: &Arc<dyn FeatureConsumer>,
        force_stream: bool,
    ) {
        let key = subscription_key(consumer.as_ref());

        let mut guard = self.lock();
        let state = &mut *guard;
        if force_stream {
            state.stream_capable.insert(key.clone());
        }
        if !state.settings.background_sync {
            return;
        }

        if state.stream_capable.contains(&key) && self.stream.is_some() {
            if state.channels.contains_key(&key) {
                return;
            }
            state.pollers.remove(&key);

            let mut channel = StreamChannel {
                id: self.next_id(),
                key: key.clone(),
                cache_key: cache_key(consumer.as_ref()),
                host: consumer.streaming_host(),
                client_key: consumer.client_key(),
                headers: consumer.streaming_headers(),
                errors: 0,
                state: ChannelState::Active,
                connection: None,
                logger: Arc::downgrade(consumer),
            };
            self.enable_channel(&mut channel);
            state.channels.insert(key, channel);
            return;
        }

        if let Some(every) = state.settings.poll_interval {
            if !state.pollers.contains_key(&key) {
                debug!(%key, ?every, "polling for feature updates");
                let poller = self.spawn_poller(key.clone(), every);
                state.pollers.insert(key, poller);
            }
        }
    }

    fn enable_channel(self: &Arc<Self>, channel: &mut StreamChannel) {
        let Some(transport) = &self.stream else {
            return;
        };

        let url = format!("{}/sub/{}", channel.host, channel.client_key);
        let mut events = transport.open(url, channel.headers.clone());
        let connection_id = self.next_id();
        let key = channel.key.clone();
        let weak = Arc::downgrade(self);

        // Events are handled one at a time, in arrival order
        let reader = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_stream_event(&key, connection_id, event);
            }
        });

        channel.connection = Some(Connection {
            id: connection_id,
            reader,
        });
        channel.state = ChannelState::Active;
        debug!(key = %channel.key, "stream channel enabled");
    }

    fn handle_stream_event(self: &Arc<Self>, key: &str, connection_id: u64, event: StreamEvent) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(channel) = state.channels.get_mut(key) else {
            return;
        };
        if channel.connection_id() != Some(connection_id) {
            return;
        }

        match event {
            StreamEvent::Open => channel.errors = 0,
            StreamEvent::Error { closed } => self.on_stream_error(channel, closed),
            StreamEvent::Message { event, data } => match event.as_str() {
                FEATURES_EVENT => match serde_json::from_str::<Value>(&data) {
                    Ok(payload) => {
                        channel.errors = 0;
                        let cache_key = channel.cache_key.clone();
                        self.apply_new_data(state, key, &cache_key, payload);
                    }
                    Err(e) => {
                        channel.log("SSE Error", &e.to_string());
                        warn!(%key, error = %e, "unparseable stream payload");
                        self.on_stream_error(channel, false);
                    }
                },
                FEATURES_UPDATED_EVENT => {
                    channel.errors = 0;
                    let subscribers = state.subscriptions.subscribers(key);
                    drop(guard);
                    for consumer in subscribers {
                        self.refresh_in_background(consumer);
                    }
                }
                _ => {}
            },
        }
    }

    fn on_stream_error(self: &Arc<Self>, channel: &mut StreamChannel, closed: bool) {
        let Some(delay) = channel.record_error(closed) else {
            return;
        };
        warn!(key = %channel.key, errors = channel.errors, ?delay, "stream failing, reconnecting later");
        channel.disable();
        self.schedule_reenable(channel.key.clone(), channel.id, delay);
    }

    fn schedule_reenable(self: &Arc<Self>, key: String, channel_id: u64, delay: Duration) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.lock();
            if let Some(channel) = state.channels.get_mut(&key) {
                // A newer disable, idle or destroy wins over the timer
                if channel.id == channel_id && channel.state == ChannelState::Disabled {
                    inner.enable_channel(channel);
                }
            }
        });
    }

    fn spawn_poller(self: &Arc<Self>, key: String, every: Duration) -> Poller {
        let weak = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));
        Poller(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // Skip the first tick (immediate)
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let subscribers = inner.lock().subscriptions.subscribers(&key);
                for consumer in subscribers {
                    inner.refresh_in_background(consumer);
                }
            }
        }))
    }

    /// Suspends every channel
    pub(crate) fn on_hidden(&self) {
        let mut state = self.lock();
        for channel in state.channels.values_mut() {
            channel.state = ChannelState::Idle;
            channel.disable();
        }
    }

    /// Reconnects every suspended channel right away
    pub(crate) fn on_visible(self: &Arc<Self>) {
        let mut state = self.lock();
        for channel in state.channels.values_mut() {
            if channel.state == ChannelState::Idle {
                self.enable_channel(channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_by_powers_of_three() {
        assert_eq!(backoff_delay(4, 1000.0), Duration::from_millis(3000));
        assert_eq!(backoff_delay(5, 1000.0), Duration::from_millis(9000));
        assert_eq!(backoff_delay(6, 1500.0), Duration::from_millis(40_500));
    }

    #[test]
    fn test_backoff_is_capped_at_five_minutes() {
        assert_eq!(backoff_delay(12, 1999.0), Duration::from_millis(300_000));
        assert_eq!(backoff_delay(u32::MAX, 1000.0), Duration::from_millis(300_000));
    }

    #[test]
    fn test_backoff_before_threshold_is_a_fraction_of_jitter() {
        // A closed connection backs off even on its first error
        assert_eq!(backoff_delay(1, 1800.0), Duration::from_millis(200));
    }

    #[test]
    fn test_jitter_range() {
        for _ in 0..100 {
            let j = jitter_ms();
            assert!((1000.0..2000.0).contains(&j));
        }
    }

    fn test_channel() -> StreamChannel {
        let logger: Weak<dyn FeatureConsumer> = Weak::<crate::testing::TestConsumer>::new();
        StreamChannel {
            id: 1,
            key: "h||k".to_string(),
            cache_key: "h||k".to_string(),
            host: "h".to_string(),
            client_key: "k".to_string(),
            headers: HashMap::new(),
            errors: 0,
            state: ChannelState::Active,
            connection: None,
            logger,
        }
    }

    #[test]
    fn test_record_error_backs_off_after_fourth_error() {
        let mut channel = test_channel();
        assert!(channel.record_error(false).is_none());
        assert!(channel.record_error(false).is_none());
        assert!(channel.record_error(false).is_none());
        let delay = channel.record_error(false).expect("fourth error backs off");
        assert!(delay >= Duration::from_millis(3000) && delay < Duration::from_millis(6000));
    }

    #[test]
    fn test_record_error_ignored_while_idle() {
        let mut channel = test_channel();
        channel.state = ChannelState::Idle;
        assert!(channel.record_error(true).is_none());
        assert_eq!(channel.errors, 0);
    }

    #[test]
    fn test_disable_without_connection_keeps_state() {
        let mut channel = test_channel();
        channel.disable();
        assert_eq!(channel.state(), ChannelState::Active);
    }
}
