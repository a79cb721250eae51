//! In-memory peer network for testing.
//!
//! Every backend created by one [`MockNetwork`] can reach the others.
//! Offers and answers carry the creating peer's id (`mock-offer:<id>`), so a
//! full offer/answer exchange links two peers and opens both data channels.
//! Failure injection and inspection follow the same pattern as a mock
//! transport: `fail_next_*`, counters, and explicit buffer control.

use super::{BackendEvent, BackendEvents, ChannelError, PeerBackend, PeerConnectionState, PeerFactory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower_core::Role;
use tower_types::{SdpType, SessionDescription};

const OFFER_PREFIX: &str = "mock-offer:";
const ANSWER_PREFIX: &str = "mock-answer:";

/// Buffered amount reported while buffers are held.
const HELD_BUFFER: usize = usize::MAX / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signaling {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug)]
struct PeerSlot {
    role: Role,
    events: BackendEvents,
    signaling: Signaling,
    remote_offer_from: Option<u64>,
    linked: Option<u64>,
    closed: bool,
}

#[derive(Debug, Default)]
struct NetworkInner {
    next_id: u64,
    order: Vec<u64>,
    peers: HashMap<u64, PeerSlot>,
    buffers_held: bool,
    sent: usize,
    fail_next_create: Option<String>,
    fail_next_offer: Option<String>,
    fail_next_send: Option<String>,
}

impl NetworkInner {
    fn slot(&mut self, id: u64) -> Result<&mut PeerSlot, ChannelError> {
        self.peers
            .get_mut(&id)
            .filter(|slot| !slot.closed)
            .ok_or(ChannelError::Closed)
    }
}

/// Shared in-memory network that creates linked mock peers.
#[derive(Debug, Default, Clone)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MockNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every peer created so far, in creation order.
    pub fn peer_ids(&self) -> Vec<u64> {
        let inner = self.inner.lock().unwrap();
        inner.order.clone()
    }

    /// Number of peers created so far.
    pub fn peers_created(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.order.len()
    }

    /// Number of peers not yet closed.
    pub fn live_peers(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.peers.values().filter(|p| !p.closed).count()
    }

    /// Number of linked, open peer pairs' endpoints.
    pub fn linked_peers(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .peers
            .values()
            .filter(|p| !p.closed && p.linked.is_some())
            .count()
    }

    /// Number of messages sent across the network.
    pub fn sent_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.sent
    }

    /// Role the given peer was created with.
    pub fn role_of(&self, id: u64) -> Option<Role> {
        let inner = self.inner.lock().unwrap();
        inner.peers.get(&id).map(|p| p.role)
    }

    /// Cause the next peer creation to fail.
    pub fn fail_next_create(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_create = Some(error.to_string());
    }

    /// Cause the next create_offer() to fail.
    pub fn fail_next_offer(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_offer = Some(error.to_string());
    }

    /// Cause the next send() to fail.
    pub fn fail_next_send(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_send = Some(error.to_string());
    }

    /// Report every peer's buffer as full until [`MockNetwork::release_buffers`].
    pub fn hold_buffers(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.buffers_held = true;
    }

    /// Drain every buffer and signal buffered-amount-low to all peers.
    pub fn release_buffers(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.buffers_held = false;
        for slot in inner.peers.values().filter(|p| !p.closed) {
            let _ = slot.events.send(BackendEvent::BufferedAmountLow);
        }
    }

    /// Simulate a transport failure on one peer.
    pub fn fail_transport(&self, id: u64) {
        let inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.peers.get(&id) {
            let _ = slot
                .events
                .send(BackendEvent::StateChanged(PeerConnectionState::Failed));
        }
    }

    /// Make one peer emit a description on its own, as renegotiation would.
    pub fn emit_local_description(&self, id: u64, desc: SessionDescription) {
        let inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.peers.get(&id) {
            let _ = slot.events.send(BackendEvent::LocalDescription(desc));
        }
    }
}

#[async_trait]
impl PeerFactory for MockNetwork {
    async fn create(
        &self,
        role: Role,
        events: BackendEvents,
    ) -> Result<Arc<dyn PeerBackend>, ChannelError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_create.take() {
            return Err(ChannelError::Setup(error));
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.order.push(id);
        inner.peers.insert(
            id,
            PeerSlot {
                role,
                events,
                signaling: Signaling::Stable,
                remote_offer_from: None,
                linked: None,
                closed: false,
            },
        );

        Ok(Arc::new(MockPeer {
            id,
            network: self.clone(),
        }))
    }
}

/// One peer on a [`MockNetwork`].
#[derive(Debug, Clone)]
pub struct MockPeer {
    id: u64,
    network: MockNetwork,
}

impl MockPeer {
    /// Network-assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

fn parse_id(sdp: &str, prefix: &str) -> Result<u64, ChannelError> {
    sdp.strip_prefix(prefix)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| ChannelError::NegotiationFailed(format!("unexpected sdp: {}", sdp)))
}

#[async_trait]
impl PeerBackend for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, ChannelError> {
        let mut inner = self.network.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_offer.take() {
            return Err(ChannelError::NegotiationFailed(error));
        }

        let slot = inner.slot(self.id)?;
        slot.signaling = Signaling::HaveLocalOffer;
        Ok(SessionDescription::offer(format!("{}{}", OFFER_PREFIX, self.id)))
    }

    async fn set_remote(&self, desc: &SessionDescription) -> Result<(), ChannelError> {
        let mut inner = self.network.inner.lock().unwrap();

        match desc.kind {
            SdpType::Offer => {
                let from = parse_id(&desc.sdp, OFFER_PREFIX)?;
                let slot = inner.slot(self.id)?;
                if slot.signaling == Signaling::HaveLocalOffer {
                    return Err(ChannelError::NegotiationFailed(
                        "offer received with a local offer outstanding".into(),
                    ));
                }
                slot.signaling = Signaling::HaveRemoteOffer;
                slot.remote_offer_from = Some(from);
                Ok(())
            }
            SdpType::Answer | SdpType::Pranswer => {
                let from = parse_id(&desc.sdp, ANSWER_PREFIX)?;
                let slot = inner.slot(self.id)?;
                if slot.signaling != Signaling::HaveLocalOffer {
                    return Err(ChannelError::NegotiationFailed("no local offer".into()));
                }

                let remote = inner.slot(from)?;
                if remote.remote_offer_from != Some(self.id) {
                    return Err(ChannelError::NegotiationFailed(
                        "answer does not match our offer".into(),
                    ));
                }
                remote.linked = Some(self.id);
                let _ = remote.events.send(BackendEvent::ChannelOpen);

                let slot = inner.slot(self.id)?;
                slot.signaling = Signaling::Stable;
                slot.linked = Some(from);
                let _ = slot.events.send(BackendEvent::ChannelOpen);
                Ok(())
            }
            SdpType::Rollback => {
                inner.slot(self.id)?.signaling = Signaling::Stable;
                Ok(())
            }
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription, ChannelError> {
        let mut inner = self.network.inner.lock().unwrap();
        let slot = inner.slot(self.id)?;
        if slot.signaling != Signaling::HaveRemoteOffer {
            return Err(ChannelError::NegotiationFailed("no remote offer".into()));
        }
        slot.signaling = Signaling::Stable;
        Ok(SessionDescription::answer(format!("{}{}", ANSWER_PREFIX, self.id)))
    }

    async fn rollback(&self) -> Result<(), ChannelError> {
        let mut inner = self.network.inner.lock().unwrap();
        let slot = inner.slot(self.id)?;
        slot.signaling = Signaling::Stable;
        Ok(())
    }

    async fn is_stable(&self) -> bool {
        let inner = self.network.inner.lock().unwrap();
        inner
            .peers
            .get(&self.id)
            .map_or(true, |slot| slot.signaling == Signaling::Stable)
    }

    async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        let mut inner = self.network.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(ChannelError::SendFailed(error));
        }

        let remote = inner
            .slot(self.id)?
            .linked
            .ok_or_else(|| ChannelError::SendFailed("not linked".into()))?;
        inner.sent += 1;

        if let Ok(slot) = inner.slot(remote) {
            let _ = slot.events.send(BackendEvent::Message(data.to_vec()));
        }
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        let inner = self.network.inner.lock().unwrap();
        if inner.buffers_held {
            HELD_BUFFER
        } else {
            0
        }
    }

    async fn close(&self) {
        let mut inner = self.network.inner.lock().unwrap();
        let Some(slot) = inner.peers.get_mut(&self.id) else {
            return;
        };
        if slot.closed {
            return;
        }
        slot.closed = true;

        if let Some(remote) = slot.linked {
            if let Ok(remote) = inner.slot(remote) {
                let _ = remote
                    .events
                    .send(BackendEvent::StateChanged(PeerConnectionState::Disconnected));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn peer(network: &MockNetwork, role: Role) -> (Arc<dyn PeerBackend>, mpsc::UnboundedReceiver<BackendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (network.create(role, tx).await.unwrap(), rx)
    }

    // ===========================================
    // MockNetwork Basic Tests
    // ===========================================

    #[tokio::test]
    async fn exchange_links_peers() {
        let network = MockNetwork::new();
        let (a, mut a_rx) = peer(&network, Role::Offerer).await;
        let (b, mut b_rx) = peer(&network, Role::Answerer).await;

        let offer = a.create_offer().await.unwrap();
        assert!(!a.is_stable().await);
        b.set_remote(&offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote(&answer).await.unwrap();

        assert_eq!(a_rx.recv().await, Some(BackendEvent::ChannelOpen));
        assert_eq!(b_rx.recv().await, Some(BackendEvent::ChannelOpen));
        assert_eq!(network.linked_peers(), 2);
        assert!(a.is_stable().await);
    }

    #[tokio::test]
    async fn mismatched_answer_is_rejected() {
        let network = MockNetwork::new();
        let (a, _a_rx) = peer(&network, Role::Offerer).await;
        let (b, _b_rx) = peer(&network, Role::Answerer).await;

        a.create_offer().await.unwrap();
        // b never saw a's offer.
        let bogus = SessionDescription::answer(format!("{}{}", ANSWER_PREFIX, 2));
        assert!(a.set_remote(&bogus).await.is_err());
        assert!(b.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn forced_failures_apply_once() {
        let network = MockNetwork::new();
        network.fail_next_create("no ice servers");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            network.create(Role::Offerer, tx).await,
            Err(ChannelError::Setup(_))
        ));

        let (a, _a_rx) = peer(&network, Role::Offerer).await;
        network.fail_next_offer("gathering timed out");
        assert!(a.create_offer().await.is_err());
        assert!(a.create_offer().await.is_ok());
        assert_eq!(network.peers_created(), 1);
    }

    #[tokio::test]
    async fn close_disconnects_remote() {
        let network = MockNetwork::new();
        let (a, mut a_rx) = peer(&network, Role::Offerer).await;
        let (b, mut b_rx) = peer(&network, Role::Answerer).await;

        let offer = a.create_offer().await.unwrap();
        b.set_remote(&offer).await.unwrap();
        a.set_remote(&b.create_answer().await.unwrap()).await.unwrap();
        a_rx.recv().await;
        b_rx.recv().await;

        a.close().await;
        assert_eq!(
            b_rx.recv().await,
            Some(BackendEvent::StateChanged(PeerConnectionState::Disconnected))
        );
        assert_eq!(network.live_peers(), 1);
        assert!(matches!(a.send(b"x").await, Err(ChannelError::Closed)));
    }
}
