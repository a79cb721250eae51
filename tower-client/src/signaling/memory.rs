//! In-process relay for testing.
//!
//! A [`MemoryHub`] is one shared pub/sub space; every [`MemoryRelay`] handed
//! out by [`MemoryHub::relay`] is a client connection to it. As with a real
//! relay, publishers receive their own messages if they subscribed to the
//! topic.

use super::{Inbound, InboundSink, SignalingError, SignalingTransport, SubscriptionId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct HubSubscription {
    connection: u64,
    topic: String,
    sink: InboundSink,
}

#[derive(Debug, Default)]
struct HubInner {
    next_id: u64,
    subscriptions: HashMap<String, HubSubscription>,
    published: Vec<(String, String)>,
    offline: bool,
    interval_hint: Option<Duration>,
    fail_next_publish: Option<String>,
    dropping: bool,
}

/// Shared in-memory pub/sub space.
#[derive(Debug, Default, Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client connection named `url`.
    pub fn relay(&self, url: &str) -> MemoryRelay {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        MemoryRelay {
            url: url.to_string(),
            connection: inner.next_id,
            hub: self.clone(),
        }
    }

    /// Everything published so far, as `(topic, content)`.
    pub fn published(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().unwrap();
        inner.published.clone()
    }

    /// Number of publishes to `topic`.
    pub fn published_to(&self, topic: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.published.iter().filter(|(t, _)| t == topic).count()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.subscriptions.len()
    }

    /// Make every relay refuse to become ready.
    pub fn set_offline(&self, offline: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.offline = offline;
    }

    /// Accept publishes but deliver nothing.
    pub fn set_dropping(&self, dropping: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.dropping = dropping;
    }

    /// Ask publishers to use `interval` from the next publish on.
    pub fn set_interval_hint(&self, interval: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.interval_hint = Some(interval);
    }

    /// Cause the next publish() to fail.
    pub fn fail_next_publish(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_publish = Some(error.to_string());
    }

    /// Publish from outside any relay, e.g. to inject foreign messages.
    pub fn inject(&self, topic: &str, content: &str) {
        let mut inner = self.inner.lock().unwrap();
        deliver(&mut inner, topic, content);
    }
}

fn deliver(inner: &mut HubInner, topic: &str, content: &str) {
    inner.published.push((topic.to_string(), content.to_string()));
    if inner.dropping {
        return;
    }
    inner.subscriptions.retain(|_, sub| {
        if sub.topic != topic {
            return true;
        }
        sub.sink
            .send(Inbound {
                topic: topic.to_string(),
                content: content.to_string(),
            })
            .is_ok()
    });
}

/// One client connection to a [`MemoryHub`].
#[derive(Debug, Clone)]
pub struct MemoryRelay {
    url: String,
    connection: u64,
    hub: MemoryHub,
}

#[async_trait]
impl SignalingTransport for MemoryRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn ready(&self) -> Result<(), SignalingError> {
        let inner = self.hub.inner.lock().unwrap();
        if inner.offline {
            return Err(SignalingError::ConnectionFailed(format!("{} is offline", self.url)));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, sink: InboundSink) -> Result<SubscriptionId, SignalingError> {
        let mut inner = self.hub.inner.lock().unwrap();
        if inner.offline {
            return Err(SignalingError::NotConnected);
        }

        inner.next_id += 1;
        let id = format!("{}#{}", self.url, inner.next_id);
        inner.subscriptions.insert(
            id.clone(),
            HubSubscription {
                connection: self.connection,
                topic: topic.to_string(),
                sink,
            },
        );
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), SignalingError> {
        let mut inner = self.hub.inner.lock().unwrap();
        inner.subscriptions.remove(&id.0);
        Ok(())
    }

    async fn publish(&self, topic: &str, content: &str) -> Result<Option<Duration>, SignalingError> {
        let mut inner = self.hub.inner.lock().unwrap();
        if inner.offline {
            return Err(SignalingError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_publish.take() {
            return Err(SignalingError::PublishFailed(error));
        }

        deliver(&mut inner, topic, content);
        Ok(inner.interval_hint)
    }

    async fn close(&self) {
        let mut inner = self.hub.inner.lock().unwrap();
        let connection = self.connection;
        inner.subscriptions.retain(|_, sub| sub.connection != connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    // ===========================================
    // MemoryHub Basic Tests
    // ===========================================

    #[tokio::test]
    async fn publish_reaches_topic_subscribers_only() {
        let hub = MemoryHub::new();
        let a = hub.relay("mem://a");
        let b = hub.relay("mem://b");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();

        b.subscribe("room", tx).await.unwrap();
        b.subscribe("elsewhere", other_tx).await.unwrap();
        a.publish("room", "hi").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().content, "hi");
        assert!(other_rx.try_recv().is_err());
        assert_eq!(hub.published_to("room"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = MemoryHub::new();
        let relay = hub.relay("mem://a");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = relay.subscribe("t", tx).await.unwrap();
        relay.unsubscribe(&id).await.unwrap();
        relay.publish("t", "x").await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(hub.subscription_count(), 0);
    }

    #[tokio::test]
    async fn offline_hub_is_never_ready() {
        let hub = MemoryHub::new();
        hub.set_offline(true);
        let relay = hub.relay("mem://a");

        assert!(relay.ready().await.is_err());
        assert!(relay.publish("t", "x").await.is_err());
    }

    #[tokio::test]
    async fn interval_hint_and_forced_failure() {
        let hub = MemoryHub::new();
        let relay = hub.relay("mem://a");
        assert_eq!(relay.publish("t", "x").await.unwrap(), None);

        hub.set_interval_hint(Duration::from_secs(3));
        hub.fail_next_publish("rate limited");
        assert!(relay.publish("t", "x").await.is_err());
        assert_eq!(
            relay.publish("t", "x").await.unwrap(),
            Some(Duration::from_secs(3))
        );
    }

    #[tokio::test]
    async fn close_drops_only_that_relays_subscriptions() {
        let hub = MemoryHub::new();
        let a = hub.relay("mem://a");
        let b = hub.relay("mem://b");
        let (tx, _rx) = mpsc::unbounded_channel();
        a.subscribe("t", tx.clone()).await.unwrap();
        b.subscribe("t", tx).await.unwrap();

        a.close().await;
        assert_eq!(hub.subscription_count(), 1);
    }
}
