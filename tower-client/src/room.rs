//! Named actions multiplexed over every connected peer.
//!
//! A [`Room`] owns the peer table. Each peer gets a reader task that decodes
//! chunks, reassembles them per (peer, action, nonce) and hands complete
//! messages to the action registered under that name. Two actions are
//! handled internally: `@_leave` drops every connection and `@_signal`
//! carries renegotiation descriptions.
//!
//! # Example
//!
//! ```ignore
//! let room = Room::new(self_id, TransportConfig::default());
//! let (chat, mut inbox) = room.make_action::<String>("chat")?;
//! chat.broadcast(&"hello".to_string()).await?;
//! while let Some((text, from)) = inbox.recv().await {
//!     println!("{}: {}", from, text);
//! }
//! ```

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tower_core::{decode_chunk, encode_chunks, Message, Reassembler};
use tower_types::{ActionName, ActionPayload, PeerId, SessionDescription, SyncError, WireBody};
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelEvents, ConnectionChannel};
use crate::config::TransportConfig;
use crate::rendezvous::{NegotiatedPeer, PeerSink};

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// An action with this name is already registered.
    #[error("action {0} already registered")]
    DuplicateAction(ActionName),

    /// The name belongs to an internal action.
    #[error("action {0} is reserved")]
    ReservedAction(ActionName),

    /// Invalid name or a payload that could not be encoded.
    #[error(transparent)]
    Payload(#[from] SyncError),
}

/// Peer membership changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// A peer's connection was handed to the room.
    PeerJoined(PeerId),
    /// A peer disconnected or left.
    PeerLeft(PeerId),
}

/// Who an action send goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every connected peer.
    All,
    /// One peer.
    Peer(PeerId),
    /// Several peers.
    Peers(Vec<PeerId>),
}

struct PeerEntry {
    channel: ConnectionChannel,
    joined_at: Instant,
}

type ActionInbox = mpsc::UnboundedSender<(Message, PeerId)>;

struct RoomInner {
    self_id: PeerId,
    config: TransportConfig,
    peers: DashMap<PeerId, PeerEntry>,
    actions: DashMap<ActionName, ActionInbox>,
    reassembler: Mutex<Reassembler>,
    signal_nonce: AtomicU8,
    leave_nonce: AtomicU8,
    events: broadcast::Sender<RoomEvent>,
    left: AtomicBool,
}

/// The set of connected peers and the actions spoken between them.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("self_id", &self.inner.self_id)
            .field("peers", &self.inner.peers.len())
            .field("actions", &self.inner.actions.len())
            .finish()
    }
}

impl Room {
    /// Create an empty room for `self_id`.
    pub fn new(self_id: PeerId, config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RoomInner {
                self_id,
                reassembler: Mutex::new(Reassembler::new(config.max_message_size)),
                config,
                peers: DashMap::new(),
                actions: DashMap::new(),
                signal_nonce: AtomicU8::new(0),
                leave_nonce: AtomicU8::new(0),
                events,
                left: AtomicBool::new(false),
            }),
        }
    }

    /// Our peer id.
    pub fn self_id(&self) -> &PeerId {
        &self.inner.self_id
    }

    /// Register an action and get its send and receive halves.
    ///
    /// Each name can be registered once per room.
    pub fn make_action<T: ActionPayload>(
        &self,
        name: &str,
    ) -> Result<(ActionSender<T>, ActionReceiver<T>), RoomError> {
        let name = ActionName::new(name)?;
        if name.is_reserved() {
            return Err(RoomError::ReservedAction(name));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.actions.entry(name) {
            Entry::Occupied(_) => return Err(RoomError::DuplicateAction(name)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        debug!("registered action {}", name);

        let sender = ActionSender {
            name,
            nonce: Arc::new(AtomicU8::new(0)),
            room: Arc::clone(&self.inner),
            _payload: PhantomData,
        };
        let receiver = ActionReceiver {
            name,
            rx,
            _payload: PhantomData,
        };
        Ok((sender, receiver))
    }

    /// Connected peers, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.peers.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Whether `peer` is connected.
    pub fn has_peer(&self, peer: &PeerId) -> bool {
        self.inner.peers.contains_key(peer)
    }

    /// When `peer` joined.
    pub fn joined_at(&self, peer: &PeerId) -> Option<Instant> {
        self.inner.peers.get(peer).map(|e| e.joined_at)
    }

    /// Incomplete messages currently held for `peer`.
    pub fn pending_transmissions(&self, peer: &PeerId) -> usize {
        self.inner.reassembler().pending_for(peer)
    }

    /// Watch peers join and leave.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.inner.events.subscribe()
    }

    /// Whether [`Room::leave`] has been called.
    pub fn is_left(&self) -> bool {
        self.inner.left.load(Ordering::SeqCst)
    }

    /// Take ownership of an open connection to `peer`.
    ///
    /// Refused (and the channel closed) if the peer is already connected or
    /// the room has been left.
    pub async fn attach_peer(&self, peer: NegotiatedPeer) -> bool {
        self.inner.attach(peer).await
    }

    /// Disconnect one peer.
    pub async fn disconnect(&self, peer: &PeerId) {
        if let Some((_, entry)) = self.inner.peers.remove(peer) {
            self.inner.drop_peer(peer, entry).await;
        }
    }

    /// Tell every peer we are leaving, give the message a moment to go out,
    /// then disconnect everyone. Later attachments are refused.
    pub async fn leave(&self) {
        if self.inner.left.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.inner.self_id.encode() {
            Ok(body) => {
                let nonce = self.inner.leave_nonce.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .transmit(ActionName::LEAVE, nonce, &body, Target::All)
                    .await;
            }
            Err(e) => warn!("could not encode leave notice: {}", e),
        }
        tokio::time::sleep(self.inner.config.leave_grace()).await;

        for peer in self.peers() {
            self.disconnect(&peer).await;
        }
        info!("left room");
    }
}

#[async_trait]
impl PeerSink for Room {
    fn has_peer(&self, peer: &PeerId) -> bool {
        Room::has_peer(self, peer)
    }

    async fn attach(&self, peer: NegotiatedPeer) -> bool {
        self.attach_peer(peer).await
    }
}

impl RoomInner {
    fn reassembler(&self) -> std::sync::MutexGuard<'_, Reassembler> {
        self.reassembler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn attach(self: &Arc<Self>, peer: NegotiatedPeer) -> bool {
        let NegotiatedPeer {
            peer_id,
            channel,
            events,
        } = peer;

        let accepted = !self.left.load(Ordering::SeqCst)
            && match self.peers.entry(peer_id.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(PeerEntry {
                        channel: channel.clone(),
                        joined_at: Instant::now(),
                    });
                    true
                }
            };
        if !accepted {
            debug!("refusing second connection to {}", peer_id);
            channel.close().await;
            return false;
        }

        info!("peer {} joined", peer_id);
        tokio::spawn(Arc::clone(self).read_peer(peer_id.clone(), channel, events));
        let _ = self.events.send(RoomEvent::PeerJoined(peer_id));
        true
    }

    async fn read_peer(self: Arc<Self>, peer: PeerId, channel: ConnectionChannel, mut events: ChannelEvents) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Data(bytes) => self.receive(&peer, &channel, &bytes).await,
                ChannelEvent::Signal(desc) => self.send_signal(&peer, &desc).await,
                ChannelEvent::Open => {}
                ChannelEvent::Closed => break,
            }
        }
        self.disconnect_channel(&peer, channel.id()).await;
    }

    async fn receive(&self, peer: &PeerId, channel: &ConnectionChannel, bytes: &[u8]) {
        let chunk = match decode_chunk(bytes) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("malformed chunk from {}: {}", peer, e);
                return;
            }
        };

        let action = chunk.header.action;
        if !action.is_reserved() && !self.actions.contains_key(&action) {
            warn!("unknown action {} from {}", action, peer);
            return;
        }

        let message = match self.reassembler().push(peer, chunk) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                warn!("dropping message from {}: {}", peer, e);
                return;
            }
        };

        if action == ActionName::LEAVE {
            info!("peer {} is leaving, dropping every connection", peer);
            self.disconnect_all().await;
            return;
        }
        if action == ActionName::SIGNAL {
            self.apply_remote_signal(peer, channel, &message).await;
            return;
        }

        let inbox = self.actions.get(&action).map(|slot| slot.value().clone());
        if let Some(inbox) = inbox {
            if inbox.send((message, peer.clone())).is_err() {
                debug!("action {} has no receiver", action);
            }
        }
    }

    async fn apply_remote_signal(&self, peer: &PeerId, channel: &ConnectionChannel, message: &Message) {
        let desc = match SessionDescription::decode(&message.bytes, message.is_json) {
            Ok(desc) => desc,
            Err(e) => {
                warn!("bad signal from {}: {}", peer, e);
                return;
            }
        };
        match channel.apply_signal(desc).await {
            Ok(Some(answer)) => self.send_signal(peer, &answer).await,
            Ok(None) => {}
            Err(e) => warn!("renegotiation with {} failed: {}", peer, e),
        }
    }

    async fn send_signal(&self, peer: &PeerId, desc: &SessionDescription) {
        match desc.encode() {
            Ok(body) => {
                let nonce = self.signal_nonce.fetch_add(1, Ordering::Relaxed);
                self.transmit(ActionName::SIGNAL, nonce, &body, Target::Peer(peer.clone()))
                    .await;
            }
            Err(e) => warn!("could not encode signal for {}: {}", peer, e),
        }
    }

    fn resolve(&self, target: Target) -> Vec<(PeerId, ConnectionChannel)> {
        let lookup = |ids: Vec<PeerId>| -> Vec<(PeerId, ConnectionChannel)> {
            ids.into_iter()
                .filter_map(|id| {
                    let channel = self.peers.get(&id).map(|e| e.channel.clone());
                    if channel.is_none() {
                        debug!("no connected peer {}", id);
                    }
                    channel.map(|c| (id, c))
                })
                .collect()
        };
        match target {
            Target::All => self
                .peers
                .iter()
                .map(|e| (e.key().clone(), e.channel.clone()))
                .collect(),
            Target::Peer(id) => lookup(vec![id]),
            Target::Peers(ids) => lookup(ids),
        }
    }

    /// Frame `body` once and stream it to every target in parallel.
    async fn transmit(&self, action: ActionName, nonce: u8, body: &WireBody, target: Target) {
        let chunks = encode_chunks(action, nonce, body);
        let sends = self
            .resolve(target)
            .into_iter()
            .map(|(peer, channel)| self.send_chunks(peer, channel, &chunks));
        join_all(sends).await;
    }

    /// Send chunks in order, waiting on back-pressure. Stops quietly once the
    /// peer is gone.
    async fn send_chunks(&self, peer: PeerId, channel: ConnectionChannel, chunks: &[Vec<u8>]) {
        for chunk in chunks {
            let live = self
                .peers
                .get(&peer)
                .is_some_and(|e| e.channel.id() == channel.id());
            if !live {
                debug!("peer {} went away mid-send", peer);
                return;
            }
            if let Err(e) = channel.wait_writable().await {
                debug!("send to {} stopped: {}", peer, e);
                return;
            }
            if let Err(e) = channel.send(chunk).await {
                debug!("send to {} stopped: {}", peer, e);
                return;
            }
        }
    }

    /// Disconnect `peer` only if it is still on channel `channel_id`.
    async fn disconnect_channel(&self, peer: &PeerId, channel_id: u64) {
        if let Some((_, entry)) = self
            .peers
            .remove_if(peer, |_, e| e.channel.id() == channel_id)
        {
            self.drop_peer(peer, entry).await;
        }
    }

    /// Drop every connection. Rendezvous reconnects the peers still in the room.
    async fn disconnect_all(&self) {
        let peers: Vec<PeerId> = self.peers.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            if let Some((_, entry)) = self.peers.remove(&peer) {
                self.drop_peer(&peer, entry).await;
            }
        }
    }

    async fn drop_peer(&self, peer: &PeerId, entry: PeerEntry) {
        entry.channel.close().await;
        self.reassembler().clear_peer(peer);
        info!("peer {} disconnected", peer);
        let _ = self.events.send(RoomEvent::PeerLeft(peer.clone()));
    }
}

/// Sending half of an action.
pub struct ActionSender<T> {
    name: ActionName,
    nonce: Arc<AtomicU8>,
    room: Arc<RoomInner>,
    _payload: PhantomData<fn(&T)>,
}

impl<T> Clone for ActionSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            nonce: Arc::clone(&self.nonce),
            room: Arc::clone(&self.room),
            _payload: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ActionSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionSender").field("name", &self.name).finish()
    }
}

impl<T: ActionPayload> ActionSender<T> {
    /// Action name.
    pub fn name(&self) -> ActionName {
        self.name
    }

    /// Send `payload` to `target`. Returns once every target has been
    /// written to or has gone away.
    pub async fn send(&self, payload: &T, target: Target) -> Result<(), RoomError> {
        let body = payload.encode()?;
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        self.room.transmit(self.name, nonce, &body, target).await;
        Ok(())
    }

    /// Send to every connected peer.
    pub async fn broadcast(&self, payload: &T) -> Result<(), RoomError> {
        self.send(payload, Target::All).await
    }

    /// Send to one peer.
    pub async fn send_to(&self, payload: &T, peer: &PeerId) -> Result<(), RoomError> {
        self.send(payload, Target::Peer(peer.clone())).await
    }
}

/// Receiving half of an action.
pub struct ActionReceiver<T> {
    name: ActionName,
    rx: mpsc::UnboundedReceiver<(Message, PeerId)>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for ActionReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionReceiver").field("name", &self.name).finish()
    }
}

impl<T: ActionPayload> ActionReceiver<T> {
    /// Action name.
    pub fn name(&self) -> ActionName {
        self.name
    }

    /// Next well-formed message and its sender. Payloads that fail to decode
    /// are logged and skipped.
    pub async fn recv(&mut self) -> Option<(T, PeerId)> {
        loop {
            let (message, peer) = self.rx.recv().await?;
            match T::decode(&message.bytes, message.is_json) {
                Ok(value) => return Some((value, peer)),
                Err(e) => warn!("malformed {} payload from {}: {}", self.name, peer, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockNetwork;
    use std::time::Duration;
    use tower_core::{Role, PAYLOAD_CAPACITY};
    use tower_types::{CheckpointProposal, ElementEvent};

    fn config() -> TransportConfig {
        TransportConfig {
            low_water_mark: 1024,
            leave_grace_ms: 10,
            max_message_size: tower_core::frame::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    async fn open_pair(network: &MockNetwork) -> (NegotiatedPeer, NegotiatedPeer) {
        let (a, mut a_events) = ConnectionChannel::open(network, Role::Offerer, 1024).await.unwrap();
        let (b, mut b_events) = ConnectionChannel::open(network, Role::Answerer, 1024).await.unwrap();
        let offer = a.create_offer().await.unwrap();
        let answer = b.apply_signal(offer).await.unwrap().unwrap();
        a.apply_signal(answer).await.unwrap();
        assert_eq!(a_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Open));

        (
            NegotiatedPeer {
                peer_id: PeerId::from("bob"),
                channel: a,
                events: a_events,
            },
            NegotiatedPeer {
                peer_id: PeerId::from("alice"),
                channel: b,
                events: b_events,
            },
        )
    }

    async fn linked_rooms(network: &MockNetwork) -> (Room, Room) {
        let alice = Room::new(PeerId::from("alice"), config());
        let bob = Room::new(PeerId::from("bob"), config());
        let (to_bob, to_alice) = open_pair(network).await;
        assert!(alice.attach_peer(to_bob).await);
        assert!(bob.attach_peer(to_alice).await);
        (alice, bob)
    }

    async fn link(network: &MockNetwork, left: &Room, right: &Room) {
        let (mut to_right, mut to_left) = open_pair(network).await;
        to_right.peer_id = right.self_id().clone();
        to_left.peer_id = left.self_id().clone();
        assert!(left.attach_peer(to_right).await);
        assert!(right.attach_peer(to_left).await);
    }

    async fn recv<T: ActionPayload>(rx: &mut ActionReceiver<T>) -> (T, PeerId) {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("receiver closed")
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    // ===========================================
    // Actions
    // ===========================================

    #[tokio::test]
    async fn text_action_reaches_peer() {
        let network = MockNetwork::new();
        let (alice, bob) = linked_rooms(&network).await;
        let (chat, _) = alice.make_action::<String>("chat").unwrap();
        let (_, mut inbox) = bob.make_action::<String>("chat").unwrap();

        chat.broadcast(&"hi".to_string()).await.unwrap();

        assert_eq!(recv(&mut inbox).await, ("hi".to_string(), PeerId::from("alice")));
    }

    #[tokio::test]
    async fn large_payload_is_chunked_and_reassembled() {
        let network = MockNetwork::new();
        let (alice, bob) = linked_rooms(&network).await;
        let (tx, _) = alice.make_action::<String>("blob").unwrap();
        let (_, mut rx) = bob.make_action::<String>("blob").unwrap();

        let sent_before = network.sent_count();
        let payload: String = "x".repeat(PAYLOAD_CAPACITY * 3 + 7);
        tx.send_to(&payload, &PeerId::from("bob")).await.unwrap();

        let (got, _) = recv(&mut rx).await;
        assert_eq!(got, payload);
        assert_eq!(network.sent_count() - sent_before, 4);
    }

    #[tokio::test]
    async fn json_actions_are_typed() {
        let network = MockNetwork::new();
        let (alice, bob) = linked_rooms(&network).await;
        let (tx, _) = alice.make_action::<CheckpointProposal>("propose").unwrap();
        let (_, mut rx) = bob.make_action::<CheckpointProposal>("propose").unwrap();

        let proposal = CheckpointProposal {
            checkpoint_id: "c1".into(),
            element_hash: "abc".into(),
        };
        tx.broadcast(&proposal).await.unwrap();

        assert_eq!(recv(&mut rx).await.0, proposal);
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped() {
        let network = MockNetwork::new();
        let (alice, bob) = linked_rooms(&network).await;
        let (tx, _) = alice.make_action::<String>("realtime").unwrap();
        let (_, mut rx) = bob.make_action::<ElementEvent>("realtime").unwrap();

        tx.broadcast(&"not an event".to_string()).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unknown_actions_are_dropped() {
        let network = MockNetwork::new();
        let (alice, bob) = linked_rooms(&network).await;
        let (stray, _) = alice.make_action::<String>("stray").unwrap();
        let (known, _) = alice.make_action::<String>("known").unwrap();
        let (_, mut rx) = bob.make_action::<String>("known").unwrap();

        stray.broadcast(&"lost".to_string()).await.unwrap();
        known.broadcast(&"kept".to_string()).await.unwrap();

        assert_eq!(recv(&mut rx).await.0, "kept");
        assert_eq!(bob.pending_transmissions(&PeerId::from("alice")), 0);
    }

    #[tokio::test]
    async fn registration_rules() {
        let room = Room::new(PeerId::from("me"), config());
        room.make_action::<String>("chat").unwrap();

        assert!(matches!(
            room.make_action::<String>("chat"),
            Err(RoomError::DuplicateAction(_))
        ));
        assert!(matches!(
            room.make_action::<String>("@_leave"),
            Err(RoomError::ReservedAction(_))
        ));
        assert!(matches!(
            room.make_action::<String>("much-too-long-name"),
            Err(RoomError::Payload(_))
        ));
    }

    #[tokio::test]
    async fn targeted_sends_skip_unknown_peers() {
        let network = MockNetwork::new();
        let (alice, bob) = linked_rooms(&network).await;
        let (tx, _) = alice.make_action::<String>("chat").unwrap();
        let (_, mut rx) = bob.make_action::<String>("chat").unwrap();

        let targets = Target::Peers(vec![PeerId::from("nobody"), PeerId::from("bob")]);
        tx.send(&"to you".to_string(), targets).await.unwrap();

        assert_eq!(recv(&mut rx).await.0, "to you");
    }

    // ===========================================
    // Back-pressure
    // ===========================================

    #[tokio::test]
    async fn sends_wait_for_buffers_to_drain() {
        let network = MockNetwork::new();
        let (alice, bob) = linked_rooms(&network).await;
        let (tx, _) = alice.make_action::<String>("chat").unwrap();
        let (_, mut rx) = bob.make_action::<String>("chat").unwrap();

        network.hold_buffers();
        let sending = tokio::spawn(async move { tx.broadcast(&"later".to_string()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.rx.try_recv().is_err());

        network.release_buffers();
        assert_eq!(recv(&mut rx).await.0, "later");
        sending.await.unwrap().unwrap();
    }

    // ===========================================
    // Membership
    // ===========================================

    #[tokio::test]
    async fn second_connection_to_same_peer_is_refused() {
        let network = MockNetwork::new();
        let (alice, _bob) = linked_rooms(&network).await;
        let (duplicate, _) = open_pair(&network).await;
        let channel = duplicate.channel.clone();

        assert!(!alice.attach_peer(duplicate).await);
        assert!(channel.is_closed());
        assert_eq!(alice.peer_count(), 1);
    }

    #[tokio::test]
    async fn leave_disconnects_both_sides() {
        let network = MockNetwork::new();
        let (alice, bob) = linked_rooms(&network).await;
        let mut bob_events = bob.subscribe();

        alice.leave().await;

        assert_eq!(alice.peer_count(), 0);
        assert!(alice.is_left());
        let event = tokio::time::timeout(Duration::from_secs(1), bob_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, RoomEvent::PeerLeft(PeerId::from("alice")));
        assert_eq!(bob.peer_count(), 0);
    }

    #[tokio::test]
    async fn leave_notice_drops_every_connection() {
        let network = MockNetwork::new();
        let alice = Room::new(PeerId::from("alice"), config());
        let bob = Room::new(PeerId::from("bob"), config());
        let carol = Room::new(PeerId::from("carol"), config());
        link(&network, &alice, &bob).await;
        link(&network, &bob, &carol).await;
        assert_eq!(bob.peer_count(), 2);

        alice.leave().await;

        assert!(wait_for(|| bob.peer_count() == 0).await);
        assert!(wait_for(|| carol.peer_count() == 0).await);
        // Only the sender left; bob may be reconnected.
        assert!(!bob.is_left());
    }

    #[tokio::test]
    async fn transport_failure_disconnects_peer() {
        let network = MockNetwork::new();
        let (_alice, bob) = linked_rooms(&network).await;
        let bob_side = network.peer_ids()[1];

        network.fail_transport(bob_side);

        assert!(wait_for(|| bob.peer_count() == 0).await);
    }

    #[tokio::test]
    async fn disconnect_clears_partial_messages() {
        let network = MockNetwork::new();
        let (alice, bob) = linked_rooms(&network).await;
        let (_, _rx) = bob.make_action::<String>("blob").unwrap();
        let channel = alice.inner.peers.get(&PeerId::from("bob")).unwrap().channel.clone();

        // First chunk of a three-chunk message, then nothing.
        let body = "y".repeat(PAYLOAD_CAPACITY * 2 + 1).encode().unwrap();
        let chunks = encode_chunks(ActionName::new("blob").unwrap(), 9, &body);
        channel.send(&chunks[0]).await.unwrap();

        let alice_id = PeerId::from("alice");
        assert!(wait_for(|| bob.pending_transmissions(&alice_id) == 1).await);

        bob.disconnect(&alice_id).await;
        assert_eq!(bob.pending_transmissions(&alice_id), 0);
        assert!(!bob.has_peer(&alice_id));
    }

    #[tokio::test]
    async fn renegotiation_signals_flow_over_the_room() {
        let network = MockNetwork::new();
        let (alice, _bob) = linked_rooms(&network).await;
        let alice_side = network.peer_ids()[0];
        let sent_before = network.sent_count();

        // A connected channel emitting a description forwards it over @_signal.
        network.emit_local_description(alice_side, SessionDescription::offer("a=rtpmap:0 PCMU/8000"));

        assert!(wait_for(|| network.sent_count() > sent_before).await);
        assert_eq!(alice.peer_count(), 1);
    }
}
