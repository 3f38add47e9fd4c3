//! Subscription registry
//!
//! Tracks which consumers want updates for which subscription key. The
//! registry only holds weak references: consumers are owned by the
//! application, and one that has been dropped is skipped silently.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::consumer::{subscription_key, FeatureConsumer};

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    subscribers: HashMap<String, Vec<Weak<dyn FeatureConsumer>>>,
}

fn same_consumer(weak: &Weak<dyn FeatureConsumer>, consumer: &Arc<dyn FeatureConsumer>) -> bool {
    std::ptr::eq(
        weak.as_ptr() as *const (),
        Arc::as_ptr(consumer) as *const (),
    )
}

impl SubscriptionRegistry {
    pub(crate) fn subscribe(&mut self, consumer: &Arc<dyn FeatureConsumer>) {
        let key = subscription_key(consumer.as_ref());
        let set = self.subscribers.entry(key).or_default();
        set.retain(|weak| weak.strong_count() > 0);
        if !set.iter().any(|weak| same_consumer(weak, consumer)) {
            set.push(Arc::downgrade(consumer));
        }
    }

    /// Removes the consumer from every set; a no-op if it was never subscribed
    pub(crate) fn unsubscribe(&mut self, consumer: &Arc<dyn FeatureConsumer>) {
        for set in self.subscribers.values_mut() {
            set.retain(|weak| !same_consumer(weak, consumer) && weak.strong_count() > 0);
        }
        self.subscribers.retain(|_, set| !set.is_empty());
    }

    /// Live consumers subscribed under `key`
    pub(crate) fn subscribers(&self, key: &str) -> Vec<Arc<dyn FeatureConsumer>> {
        self.subscribers
            .get(key)
            .map(|set| set.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Pushes a payload to every consumer under `key`
    ///
    /// Each consumer gets its own task. Without a payload, consumers re-apply
    /// the one they already have.
    pub(crate) fn notify(&self, key: &str, payload: Option<Value>) {
        for consumer in self.subscribers(key) {
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Some(payload) = payload.or_else(|| consumer.payload()) {
                    consumer.set_payload(payload).await;
                }
            });
        }
    }

    pub(crate) fn clear(&mut self) {
        self.subscribers.clear();
    }

    #[cfg(test)]
    pub(crate) fn key_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settle, TestConsumer};
    use serde_json::json;

    fn consumer(host: &str, key: &str) -> (Arc<TestConsumer>, Arc<dyn FeatureConsumer>) {
        let concrete = Arc::new(TestConsumer::new(host, key));
        let erased: Arc<dyn FeatureConsumer> = concrete.clone();
        (concrete, erased)
    }

    #[test]
    fn test_subscribe_groups_by_subscription_key() {
        let mut registry = SubscriptionRegistry::default();
        let (_a, a) = consumer("h", "k1");
        let (_b, b) = consumer("h", "k1");
        let (_c, c) = consumer("h", "k2");

        registry.subscribe(&a);
        registry.subscribe(&b);
        registry.subscribe(&c);
        registry.subscribe(&a);

        assert_eq!(registry.subscribers("h||k1").len(), 2);
        assert_eq!(registry.subscribers("h||k2").len(), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_drops_empty_sets() {
        let mut registry = SubscriptionRegistry::default();
        let (_a, a) = consumer("h", "k");
        let (_b, b) = consumer("h", "other");

        registry.subscribe(&a);
        registry.unsubscribe(&a);
        registry.unsubscribe(&a);
        registry.unsubscribe(&b);

        assert!(registry.subscribers("h||k").is_empty());
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn test_dropped_consumers_are_not_returned() {
        let mut registry = SubscriptionRegistry::default();
        let (concrete, erased) = consumer("h", "k");
        registry.subscribe(&erased);

        drop(erased);
        drop(concrete);

        assert!(registry.subscribers("h||k").is_empty());
    }

    #[tokio::test]
    async fn test_notify_pushes_payload_to_each_subscriber() {
        let mut registry = SubscriptionRegistry::default();
        let (a_concrete, a) = consumer("h", "k");
        let (b_concrete, b) = consumer("h", "k");
        registry.subscribe(&a);
        registry.subscribe(&b);

        registry.notify("h||k", Some(json!({ "features": { "x": 1 } })));
        settle().await;

        assert_eq!(a_concrete.applied(), vec![json!({ "features": { "x": 1 } })]);
        assert_eq!(b_concrete.applied(), vec![json!({ "features": { "x": 1 } })]);
    }

    #[tokio::test]
    async fn test_notify_without_payload_reapplies_current() {
        let mut registry = SubscriptionRegistry::default();
        let concrete = Arc::new(TestConsumer::new("h", "k").with_payload(json!({ "v": 1 })));
        let erased: Arc<dyn FeatureConsumer> = concrete.clone();
        registry.subscribe(&erased);

        registry.notify("h||k", None);
        settle().await;

        assert_eq!(concrete.applied(), vec![json!({ "v": 1 })]);
    }
}
