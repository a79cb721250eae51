//! Publish/subscribe relays used for rendezvous.
//!
//! A [`SignalingTransport`] is one relay connection: wait for `ready()`,
//! subscribe to topics, publish text to topics. Delivery is best effort,
//! at least once while connected; nothing here retries.
//!
//! - [`NostrRelay`] speaks the signed-event protocol over a WebSocket
//! - [`MemoryHub`] / [`MemoryRelay`] is an in-process relay for tests

mod memory;
mod nostr;

pub use memory::{MemoryHub, MemoryRelay};
pub use nostr::NostrRelay;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Could not connect to the relay.
    #[error("relay connection failed: {0}")]
    ConnectionFailed(String),

    /// The relay connection is not (or no longer) open.
    #[error("relay not connected")]
    NotConnected,

    /// Publishing failed.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// The relay sent something we could not understand.
    #[error("relay protocol error: {0}")]
    Protocol(String),
}

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Topic it was published to.
    pub topic: String,
    /// Published text.
    pub content: String,
}

/// Sink subscribers receive [`Inbound`] messages on.
pub type InboundSink = mpsc::UnboundedSender<Inbound>;

/// Handle for cancelling a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One relay connection.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Relay address, used to tell relays apart.
    fn url(&self) -> &str;

    /// Resolve once the connection is open.
    async fn ready(&self) -> Result<(), SignalingError>;

    /// Deliver messages published to `topic` from now on to `sink`.
    async fn subscribe(&self, topic: &str, sink: InboundSink) -> Result<SubscriptionId, SignalingError>;

    /// Stop a subscription.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), SignalingError>;

    /// Publish `content` to `topic`.
    ///
    /// Returns the publish interval the relay asked for, if it asked.
    async fn publish(&self, topic: &str, content: &str) -> Result<Option<Duration>, SignalingError>;

    /// Close the connection.
    async fn close(&self);
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
