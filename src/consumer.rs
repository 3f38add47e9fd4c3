//! Consumer contract and cache identities
//!
//! A consumer is anything that wants a feature payload: usually one SDK
//! client per targeting context. Several consumers pointing at the same API
//! host and client key share a subscription key; under remote evaluation the
//! cache key additionally captures the targeting context, because the server
//! computes a different payload for each.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

/// Capabilities the repository needs from a payload consumer
///
/// Standard consumers only implement the identity and payload methods.
/// Remote-evaluation consumers return `true` from [`is_remote_eval`] and
/// provide their targeting context.
///
/// [`is_remote_eval`]: FeatureConsumer::is_remote_eval
#[async_trait]
pub trait FeatureConsumer: Send + Sync {
    /// Base URL of the features API
    fn api_host(&self) -> String;

    /// Client key identifying the SDK connection
    fn client_key(&self) -> String;

    /// Extra headers sent with API requests
    fn api_request_headers(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Base URL of the streaming endpoint
    fn streaming_host(&self) -> String {
        self.api_host()
    }

    /// Extra headers sent when opening a stream
    fn streaming_headers(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Whether payloads are evaluated server-side for this consumer
    fn is_remote_eval(&self) -> bool {
        false
    }

    fn attributes(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Attribute names that affect the payload, `None` meaning all of them
    fn cache_key_attributes(&self) -> Option<Vec<String>> {
        None
    }

    fn forced_variations(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Forced feature values, in insertion order
    fn forced_features(&self) -> Vec<(String, Value)> {
        Vec::new()
    }

    fn url(&self) -> String {
        String::new()
    }

    /// The payload currently applied, if any
    fn payload(&self) -> Option<Value>;

    /// Applies a new payload
    ///
    /// Failures are the consumer's own business; the repository never retries.
    async fn set_payload(&self, payload: Value);

    /// Diagnostic hook for fetch and stream failures
    fn log(&self, message: &str, context: &Value) {
        tracing::debug!(%context, "{}", message);
    }
}

/// Identity shared by every consumer of one API host and client key
pub fn subscription_key(consumer: &dyn FeatureConsumer) -> String {
    format!("{}||{}", consumer.api_host(), consumer.client_key())
}

/// Identity of a distinct cached payload
pub fn cache_key(consumer: &dyn FeatureConsumer) -> String {
    let base = subscription_key(consumer);
    if !consumer.is_remote_eval() {
        return base;
    }

    let attributes = consumer.attributes();
    let names = consumer
        .cache_key_attributes()
        .unwrap_or_else(|| attributes.keys().cloned().collect());
    let ca: Map<String, Value> = names
        .into_iter()
        .filter_map(|name| attributes.get(&name).cloned().map(|value| (name, value)))
        .collect();

    // serde_json's Map keeps keys sorted, which makes the key canonical
    let context = json!({
        "ca": ca,
        "fv": consumer.forced_variations(),
        "url": consumer.url(),
    });
    format!("{}||{}", base, context)
}

/// Body of a remote evaluation request
pub(crate) fn remote_eval_body(consumer: &dyn FeatureConsumer) -> Value {
    let forced_features: Vec<Value> = consumer
        .forced_features()
        .into_iter()
        .map(|(key, value)| json!([key, value]))
        .collect();
    json!({
        "attributes": consumer.attributes(),
        "forcedVariations": consumer.forced_variations(),
        "forcedFeatures": forced_features,
        "url": consumer.url(),
    })
}
