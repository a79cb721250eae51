//! Peer discovery over relays.
//!
//! Each relay is worked on its own: announce on the room topic every few
//! seconds, answer announcements with an offer from the pool, answer offers
//! sent to our direct topic, apply answers to our pending offers. Every SDP
//! that crosses a relay is sealed with the room key.
//!
//! A connection is handed to the [`PeerSink`] (the room) once its data
//! channel opens. Any other negotiation with the same peer, on any relay, is
//! dropped at that point, so each peer ends up with exactly one connection.
//!
//! ```text
//! A (greater id)                relay                 B (smaller id)
//!   announce ------------------>  |  <---------------- announce
//!   offer(A) -> topic(B) ------>  |  <---- offer(B) -> topic(A)
//!   drops offer(B)                |        answers offer(A)
//!   applies answer  <-----------  |  <---- answer -> topic(A)
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tower_core::{keeps_own_offer, Role, RoomTopics};
use tower_types::{Announcement, PeerId, RendezvousMessage, SessionDescription};
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, ChannelEvent, ChannelEvents, ConnectionChannel, PeerFactory};
use crate::config::RendezvousConfig;
use crate::crypto::RoomKey;
use crate::signaling::{Inbound, SignalingTransport};

/// A connection whose data channel has opened.
#[derive(Debug)]
pub struct NegotiatedPeer {
    /// Remote peer.
    pub peer_id: PeerId,
    /// The open channel.
    pub channel: ConnectionChannel,
    /// Its event stream, positioned after [`ChannelEvent::Open`].
    pub events: ChannelEvents,
}

/// Where negotiated connections go.
#[async_trait]
pub trait PeerSink: Send + Sync {
    /// Whether `peer` is already connected; rendezvous ignores such peers.
    fn has_peer(&self, peer: &PeerId) -> bool;

    /// Take ownership of a connection. Returns false if it was refused.
    async fn attach(&self, peer: NegotiatedPeer) -> bool;
}

struct PooledOffer {
    channel: ConnectionChannel,
    events: ChannelEvents,
    offer: SessionDescription,
}

struct PendingConnection {
    relay: String,
    role: Role,
    channel: ConnectionChannel,
    created: Instant,
}

#[derive(Default)]
struct State {
    pool: VecDeque<PooledOffer>,
    filling: bool,
    pending: HashMap<PeerId, Vec<PendingConnection>>,
    stopped: bool,
}

impl State {
    fn live(&self, peer: &PeerId, ttl: Duration) -> impl Iterator<Item = &PendingConnection> {
        self.pending
            .get(peer)
            .into_iter()
            .flatten()
            .filter(move |p| p.created.elapsed() < ttl && !p.channel.is_closed())
    }

    /// An offer to `peer` is outstanding on any relay.
    fn offering(&self, peer: &PeerId, ttl: Duration) -> bool {
        self.live(peer, ttl).any(|p| p.role == Role::Offerer)
    }

    /// An offer from `peer` is being answered on any relay.
    fn answering(&self, peer: &PeerId, ttl: Duration) -> bool {
        self.live(peer, ttl).any(|p| p.role == Role::Answerer)
    }

    fn offering_on(&self, peer: &PeerId, relay: &str, ttl: Duration) -> bool {
        self.live(peer, ttl)
            .any(|p| p.role == Role::Offerer && p.relay == relay)
    }
}

struct Inner {
    self_id: PeerId,
    topics: RoomTopics,
    key: RoomKey,
    factory: Arc<dyn PeerFactory>,
    relays: Vec<Arc<dyn SignalingTransport>>,
    config: RendezvousConfig,
    low_water_mark: usize,
    sink: Arc<dyn PeerSink>,
    state: Mutex<State>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Discovers peers in one room and negotiates connections to them.
#[derive(Clone)]
pub struct Rendezvous {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rendezvous")
            .field("self_id", &self.inner.self_id)
            .field("room_id", &self.inner.topics.room_id())
            .field("relays", &self.inner.relays.len())
            .finish()
    }
}

/// Everything a [`Rendezvous`] needs to run.
pub struct RendezvousParams {
    /// Our peer id.
    pub self_id: PeerId,
    /// Topics derived for this room and peer.
    pub topics: RoomTopics,
    /// Room key sealing SDP on the relays.
    pub key: RoomKey,
    /// Creates peer connections.
    pub factory: Arc<dyn PeerFactory>,
    /// Relays to work, each independently.
    pub relays: Vec<Arc<dyn SignalingTransport>>,
    /// Pool size, intervals and timeouts.
    pub config: RendezvousConfig,
    /// Back-pressure threshold for created channels.
    pub low_water_mark: usize,
    /// Receives open connections.
    pub sink: Arc<dyn PeerSink>,
}

impl Rendezvous {
    /// Start filling the offer pool and working every relay.
    pub fn start(params: RendezvousParams) -> Self {
        let inner = Arc::new(Inner {
            self_id: params.self_id,
            topics: params.topics,
            key: params.key,
            factory: params.factory,
            relays: params.relays,
            config: params.config,
            low_water_mark: params.low_water_mark,
            sink: params.sink,
            state: Mutex::new(State::default()),
            tasks: StdMutex::new(Vec::new()),
        });

        let mut tasks = vec![tokio::spawn(Arc::clone(&inner).replenish())];
        for relay in &inner.relays {
            tasks.push(tokio::spawn(Arc::clone(&inner).run_relay(Arc::clone(relay))));
        }
        *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;

        info!(
            "rendezvous for room {} started on {} relay(s)",
            inner.topics.room_id(),
            inner.relays.len()
        );
        Self { inner }
    }

    /// Our peer id.
    pub fn self_id(&self) -> &PeerId {
        &self.inner.self_id
    }

    /// Offers ready in the pool.
    pub async fn pooled_offers(&self) -> usize {
        self.inner.state.lock().await.pool.len()
    }

    /// Connections negotiating (not yet open) with `peer`.
    pub async fn pending_for(&self, peer: &PeerId) -> usize {
        let state = self.inner.state.lock().await;
        state.pending.get(peer).map_or(0, Vec::len)
    }

    /// Stop announcing and destroy every pooled and pending connection.
    ///
    /// Connections already handed to the sink are not touched.
    pub async fn stop(&self) {
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }

        let (pooled, pending) = {
            let mut state = self.inner.state.lock().await;
            state.stopped = true;
            let pooled: Vec<_> = state.pool.drain(..).map(|o| o.channel).collect();
            let pending: Vec<_> = state
                .pending
                .drain()
                .flat_map(|(_, list)| list.into_iter().map(|p| p.channel))
                .collect();
            (pooled, pending)
        };
        for channel in pooled.into_iter().chain(pending) {
            channel.close().await;
        }
        for relay in &self.inner.relays {
            relay.close().await;
        }
        info!("rendezvous for room {} stopped", self.inner.topics.room_id());
    }
}

impl Inner {
    async fn make_offer(&self) -> Result<PooledOffer, ChannelError> {
        let (channel, events) =
            ConnectionChannel::open(&*self.factory, Role::Offerer, self.low_water_mark).await?;
        match channel.create_offer().await {
            Ok(offer) => Ok(PooledOffer {
                channel,
                events,
                offer,
            }),
            Err(e) => {
                channel.close().await;
                Err(e)
            }
        }
    }

    /// Top the pool up to its configured size. Only one filler runs at a time.
    async fn replenish(self: Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.filling || state.stopped {
                return;
            }
            state.filling = true;
        }

        loop {
            {
                let state = self.state.lock().await;
                if state.stopped || state.pool.len() >= self.config.offer_pool_size {
                    break;
                }
            }

            let offer = match self.make_offer().await {
                Ok(offer) => offer,
                Err(e) => {
                    warn!("could not pre-generate offer: {}", e);
                    break;
                }
            };

            let mut state = self.state.lock().await;
            if state.stopped {
                drop(state);
                offer.channel.close().await;
                return;
            }
            state.pool.push_back(offer);
        }

        self.state.lock().await.filling = false;
    }

    async fn take_offer(self: &Arc<Self>) -> Result<PooledOffer, ChannelError> {
        let pooled = self.state.lock().await.pool.pop_front();
        tokio::spawn(Arc::clone(self).replenish());
        match pooled {
            Some(offer) => Ok(offer),
            None => self.make_offer().await,
        }
    }

    async fn run_relay(self: Arc<Self>, relay: Arc<dyn SignalingTransport>) {
        let url = relay.url().to_owned();
        if let Err(e) = relay.ready().await {
            warn!("relay {} unavailable: {}", url, e);
            return;
        }

        let (sink, mut inbound) = mpsc::unbounded_channel();
        for topic in [&self.topics.announce, &self.topics.direct] {
            if let Err(e) = relay.subscribe(topic, sink.clone()).await {
                warn!("relay {} refused subscription: {}", url, e);
                return;
            }
        }
        drop(sink);

        let announcement = match RendezvousMessage::Announce(Announcement {
            peer_id: self.self_id.clone(),
        })
        .to_json()
        {
            Ok(json) => json,
            Err(e) => {
                warn!("could not encode announcement: {}", e);
                return;
            }
        };

        debug!("working relay {}", url);
        let mut interval = self.config.announce_interval();
        let mut next = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {
                    self.sweep_expired().await;
                    match relay.publish(&self.topics.announce, &announcement).await {
                        Ok(Some(hint)) if hint != interval => {
                            info!("relay {} asks for announcements every {:?}", url, hint);
                            interval = hint;
                        }
                        Ok(_) => {}
                        Err(e) => warn!("announce on {} failed: {}", url, e),
                    }
                    next = tokio::time::Instant::now() + interval;
                }
                message = inbound.recv() => {
                    let Some(message) = message else {
                        info!("relay {} subscriptions ended", url);
                        return;
                    };
                    tokio::spawn(Arc::clone(&self).handle(Arc::clone(&relay), message));
                }
            }
        }
    }

    async fn handle(self: Arc<Self>, relay: Arc<dyn SignalingTransport>, inbound: Inbound) {
        let message = match RendezvousMessage::from_json(&inbound.content) {
            Ok(m) => m,
            Err(e) => {
                warn!("unreadable rendezvous message on {}: {}", relay.url(), e);
                return;
            }
        };

        let peer = message.peer_id().clone();
        if peer == self.self_id || self.sink.has_peer(&peer) {
            return;
        }

        let direct = inbound.topic == self.topics.direct;
        match message {
            RendezvousMessage::Announce(_) if inbound.topic == self.topics.announce => {
                self.on_announce(relay, peer).await
            }
            RendezvousMessage::Offer { sealed, .. } if direct => {
                self.on_offer(relay, peer, &sealed).await
            }
            RendezvousMessage::Answer { sealed, .. } if direct => {
                self.on_answer(relay, peer, &sealed).await
            }
            _ => debug!("message from {} on an unexpected topic", peer),
        }
    }

    async fn on_announce(self: Arc<Self>, relay: Arc<dyn SignalingTransport>, peer: PeerId) {
        let ttl = self.config.offer_ttl();
        {
            let state = self.state.lock().await;
            if state.stopped
                || state.offering_on(&peer, relay.url(), ttl)
                || state.answering(&peer, ttl)
            {
                return;
            }
        }

        let PooledOffer {
            channel,
            events,
            offer,
        } = match self.take_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("could not prepare offer for {}: {}", peer, e);
                return;
            }
        };

        let sealed = match self.key.seal_description(&offer) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("could not seal offer for {}: {}", peer, e);
                channel.close().await;
                return;
            }
        };

        if !self.track(&peer, relay.url(), Role::Offerer, &channel).await {
            channel.close().await;
            return;
        }
        tokio::spawn(Arc::clone(&self).watch(peer.clone(), channel, events));

        debug!("offering to {} via {}", peer, relay.url());
        let message = RendezvousMessage::Offer {
            peer_id: self.self_id.clone(),
            sealed,
        };
        self.publish(&*relay, &peer, &message).await;
    }

    async fn on_offer(self: Arc<Self>, relay: Arc<dyn SignalingTransport>, peer: PeerId, sealed: &str) {
        let ttl = self.config.offer_ttl();
        {
            let state = self.state.lock().await;
            if state.stopped {
                return;
            }
            if state.answering(&peer, ttl) {
                debug!("already answering {}, ignoring offer via {}", peer, relay.url());
                return;
            }
            if keeps_own_offer(&self.self_id, &peer, state.offering(&peer, ttl)) {
                debug!("offers to and from {} collided, keeping ours", peer);
                return;
            }
        }

        let offer = match self.key.open_description(sealed) {
            Ok(offer) => offer,
            Err(e) => {
                warn!("dropping offer from {}: {}", peer, e);
                return;
            }
        };

        let (channel, events) =
            match ConnectionChannel::open(&*self.factory, Role::Answerer, self.low_water_mark).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("could not create connection for {}: {}", peer, e);
                    return;
                }
            };

        let answer = match channel.apply_signal(offer).await {
            Ok(Some(answer)) => answer,
            Ok(None) => {
                debug!("offer from {} produced no answer", peer);
                channel.close().await;
                return;
            }
            Err(e) => {
                warn!("could not answer {}: {}", peer, e);
                channel.close().await;
                return;
            }
        };

        let sealed = match self.key.seal_description(&answer) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("could not seal answer for {}: {}", peer, e);
                channel.close().await;
                return;
            }
        };

        if !self.track(&peer, relay.url(), Role::Answerer, &channel).await {
            channel.close().await;
            return;
        }
        tokio::spawn(Arc::clone(&self).watch(peer.clone(), channel, events));

        debug!("answering {} via {}", peer, relay.url());
        let message = RendezvousMessage::Answer {
            peer_id: self.self_id.clone(),
            sealed,
        };
        self.publish(&*relay, &peer, &message).await;
    }

    async fn on_answer(self: Arc<Self>, relay: Arc<dyn SignalingTransport>, peer: PeerId, sealed: &str) {
        let channel = {
            let state = self.state.lock().await;
            let found = state
                .live(&peer, self.config.offer_ttl())
                .find(|p| p.role == Role::Offerer && p.relay == relay.url())
                .map(|p| p.channel.clone());
            found
        };
        let Some(channel) = channel else {
            debug!("answer from {} matches no pending offer", peer);
            return;
        };

        let answer = match self.key.open_description(sealed) {
            Ok(answer) => answer,
            Err(e) => {
                warn!("dropping answer from {}: {}", peer, e);
                return;
            }
        };

        if let Err(e) = channel.apply_signal(answer).await {
            warn!("could not apply answer from {}: {}", peer, e);
        }
    }

    async fn publish(&self, relay: &dyn SignalingTransport, peer: &PeerId, message: &RendezvousMessage) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("could not encode signal for {}: {}", peer, e);
                return;
            }
        };
        if let Err(e) = relay.publish(&self.topics.peer(peer), &json).await {
            warn!("signal to {} via {} failed: {}", peer, relay.url(), e);
        }
    }

    /// Record a negotiation.
    ///
    /// Refused after stop, while an offer from the peer is being answered, or
    /// when an offer to the peer on the same relay is already outstanding.
    async fn track(&self, peer: &PeerId, relay: &str, role: Role, channel: &ConnectionChannel) -> bool {
        let ttl = self.config.offer_ttl();
        let mut state = self.state.lock().await;
        if state.stopped || state.answering(peer, ttl) {
            return false;
        }
        if role == Role::Offerer && state.offering_on(peer, relay, ttl) {
            return false;
        }
        state
            .pending
            .entry(peer.clone())
            .or_default()
            .push(PendingConnection {
                relay: relay.to_owned(),
                role,
                channel: channel.clone(),
                created: Instant::now(),
            });
        true
    }

    async fn forget(&self, peer: &PeerId, channel_id: u64) {
        let mut state = self.state.lock().await;
        if let Some(list) = state.pending.get_mut(peer) {
            list.retain(|p| p.channel.id() != channel_id);
            if list.is_empty() {
                state.pending.remove(peer);
            }
        }
    }

    /// Destroy negotiations that outlived the offer TTL.
    async fn sweep_expired(&self) {
        let ttl = self.config.offer_ttl();
        let expired: Vec<(PeerId, ConnectionChannel)> = {
            let mut state = self.state.lock().await;
            let mut expired = Vec::new();
            for (peer, list) in state.pending.iter_mut() {
                let (stale, fresh): (Vec<_>, Vec<_>) = list
                    .drain(..)
                    .partition(|p| p.created.elapsed() >= ttl && !p.channel.is_open());
                *list = fresh;
                expired.extend(stale.into_iter().map(|p| (peer.clone(), p.channel)));
            }
            state.pending.retain(|_, list| !list.is_empty());
            expired
        };

        for (peer, channel) in expired {
            debug!("negotiation with {} expired", peer);
            channel.close().await;
        }
    }

    async fn watch(self: Arc<Self>, peer: PeerId, channel: ConnectionChannel, mut events: ChannelEvents) {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Open) => {
                    self.promote(peer, channel, events).await;
                    return;
                }
                Some(ChannelEvent::Closed) | None => {
                    self.forget(&peer, channel.id()).await;
                    return;
                }
                Some(other) => debug!("event before open from {}: {:?}", peer, other),
            }
        }
    }

    async fn promote(&self, peer: PeerId, channel: ConnectionChannel, events: ChannelEvents) {
        let others: Vec<ConnectionChannel> = {
            let mut state = self.state.lock().await;
            state
                .pending
                .remove(&peer)
                .unwrap_or_default()
                .into_iter()
                .filter(|p| p.channel.id() != channel.id())
                .map(|p| p.channel)
                .collect()
        };
        for other in others {
            debug!("dropping redundant connection {} to {}", other.id(), peer);
            other.close().await;
        }

        info!("connected to peer {}", peer);
        let negotiated = NegotiatedPeer {
            peer_id: peer.clone(),
            channel: channel.clone(),
            events,
        };
        if !self.sink.attach(negotiated).await {
            debug!("connection to {} refused", peer);
            channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockNetwork;
    use crate::signaling::MemoryHub;
    use std::sync::Mutex as TestMutex;

    #[derive(Default)]
    struct CollectingSink {
        peers: TestMutex<Vec<NegotiatedPeer>>,
    }

    impl CollectingSink {
        fn ids(&self) -> Vec<PeerId> {
            self.peers.lock().unwrap().iter().map(|p| p.peer_id.clone()).collect()
        }
    }

    #[async_trait]
    impl PeerSink for CollectingSink {
        fn has_peer(&self, peer: &PeerId) -> bool {
            self.peers.lock().unwrap().iter().any(|p| &p.peer_id == peer)
        }

        async fn attach(&self, peer: NegotiatedPeer) -> bool {
            let mut peers = self.peers.lock().unwrap();
            if peers.iter().any(|p| p.peer_id == peer.peer_id) {
                return false;
            }
            peers.push(peer);
            true
        }
    }

    fn config() -> RendezvousConfig {
        RendezvousConfig {
            offer_pool_size: 2,
            announce_interval_ms: 50,
            offer_ttl_secs: 20,
            ice_timeout_ms: 100,
        }
    }

    fn start(
        id: &str,
        password: &str,
        network: &MockNetwork,
        relays: Vec<Arc<dyn SignalingTransport>>,
    ) -> (Rendezvous, Arc<CollectingSink>) {
        let self_id = PeerId::from(id);
        let sink = Arc::new(CollectingSink::default());
        let key = RoomKey::from_bytes(sha2_key(password));
        let rendezvous = Rendezvous::start(RendezvousParams {
            topics: RoomTopics::derive("test-app", "room", &self_id),
            self_id,
            key,
            factory: Arc::new(network.clone()),
            relays,
            config: config(),
            low_water_mark: 1024,
            sink: sink.clone(),
        });
        (rendezvous, sink)
    }

    fn sha2_key(password: &str) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(password.as_bytes()));
        key
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    // ===========================================
    // Discovery
    // ===========================================

    #[tokio::test]
    async fn two_peers_find_each_other() {
        let hub = MemoryHub::new();
        let network = MockNetwork::new();
        let (a, a_sink) = start("alice", "pw", &network, vec![Arc::new(hub.relay("mem://1"))]);
        let (b, b_sink) = start("bob", "pw", &network, vec![Arc::new(hub.relay("mem://1"))]);

        assert!(wait_for(|| a_sink.ids().len() == 1 && b_sink.ids().len() == 1).await);
        assert_eq!(a_sink.ids(), vec![PeerId::from("bob")]);
        assert_eq!(b_sink.ids(), vec![PeerId::from("alice")]);

        // Only one link survives between the pair.
        assert!(wait_for(|| network.linked_peers() == 2).await);

        a.stop().await;
        b.stop().await;
    }

    async fn sealed_offer_from(network: &MockNetwork, sender: &str, password: &str) -> String {
        let (channel, _events) = ConnectionChannel::open(network, Role::Offerer, 1024).await.unwrap();
        let offer = channel.create_offer().await.unwrap();
        let sealed = RoomKey::from_bytes(sha2_key(password)).seal_description(&offer).unwrap();
        RendezvousMessage::Offer {
            peer_id: PeerId::from(sender),
            sealed,
        }
        .to_json()
        .unwrap()
    }

    fn announcement(sender: &str) -> String {
        RendezvousMessage::Announce(Announcement {
            peer_id: PeerId::from(sender),
        })
        .to_json()
        .unwrap()
    }

    #[tokio::test]
    async fn greater_id_keeps_its_offer_on_collision() {
        let hub = MemoryHub::new();
        let network = MockNetwork::new();
        let (zed, _sink) = start("zed", "pw", &network, vec![Arc::new(hub.relay("mem://1"))]);
        let topics = RoomTopics::derive("test-app", "room", &PeerId::from("zed"));
        let amy_topic = topics.peer(&PeerId::from("amy"));
        assert!(wait_for(|| hub.subscription_count() == 2).await);

        hub.inject(&topics.announce, &announcement("amy"));
        assert!(wait_for(|| hub.published_to(&amy_topic) == 1).await);

        hub.inject(&topics.direct, &sealed_offer_from(&network, "amy", "pw").await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Only zed's own offer went out; amy's offer was dropped.
        assert_eq!(hub.published_to(&amy_topic), 1);
        assert_eq!(zed.pending_for(&PeerId::from("amy")).await, 1);

        zed.stop().await;
    }

    #[tokio::test]
    async fn smaller_id_answers_on_collision() {
        let hub = MemoryHub::new();
        let network = MockNetwork::new();
        let (amy, _sink) = start("amy", "pw", &network, vec![Arc::new(hub.relay("mem://1"))]);
        let topics = RoomTopics::derive("test-app", "room", &PeerId::from("amy"));
        let zed_topic = topics.peer(&PeerId::from("zed"));
        assert!(wait_for(|| hub.subscription_count() == 2).await);

        hub.inject(&topics.announce, &announcement("zed"));
        assert!(wait_for(|| hub.published_to(&zed_topic) == 1).await);

        hub.inject(&topics.direct, &sealed_offer_from(&network, "zed", "pw").await);

        // Offer first, then the answer.
        assert!(wait_for(|| hub.published_to(&zed_topic) == 2).await);
        let (_, last) = hub.published().into_iter().filter(|(t, _)| t == &zed_topic).last().unwrap();
        assert!(matches!(
            RendezvousMessage::from_json(&last).unwrap(),
            RendezvousMessage::Answer { .. }
        ));

        amy.stop().await;
    }

    #[tokio::test]
    async fn several_relays_still_yield_one_connection() {
        let hub_one = MemoryHub::new();
        let hub_two = MemoryHub::new();
        let network = MockNetwork::new();
        let (a, a_sink) = start(
            "alice",
            "pw",
            &network,
            vec![Arc::new(hub_one.relay("mem://1")), Arc::new(hub_two.relay("mem://2"))],
        );
        let (b, b_sink) = start(
            "bob",
            "pw",
            &network,
            vec![Arc::new(hub_one.relay("mem://1")), Arc::new(hub_two.relay("mem://2"))],
        );

        assert!(wait_for(|| a_sink.ids().len() == 1 && b_sink.ids().len() == 1).await);
        assert!(wait_for(|| network.linked_peers() == 2).await);
        assert_eq!(a.pending_for(&PeerId::from("bob")).await, 0);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn wrong_password_never_connects() {
        let hub = MemoryHub::new();
        let network = MockNetwork::new();
        let (a, a_sink) = start("alice", "pw", &network, vec![Arc::new(hub.relay("mem://1"))]);
        let (b, b_sink) = start("bob", "other", &network, vec![Arc::new(hub.relay("mem://1"))]);

        // Offers are exchanged but can't be opened.
        assert!(wait_for(|| hub.published().iter().any(|(_, c)| c.contains("\"offer\""))).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(a_sink.ids().is_empty());
        assert!(b_sink.ids().is_empty());

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn relays_only_see_sealed_descriptions() {
        let hub = MemoryHub::new();
        let network = MockNetwork::new();
        let (a, a_sink) = start("alice", "pw", &network, vec![Arc::new(hub.relay("mem://1"))]);
        let (b, _b_sink) = start("bob", "pw", &network, vec![Arc::new(hub.relay("mem://1"))]);

        assert!(wait_for(|| a_sink.ids().len() == 1).await);
        for (topic, content) in hub.published() {
            assert!(!content.contains("mock-offer"), "plaintext offer on {}", topic);
            assert!(!content.contains("mock-answer"), "plaintext answer on {}", topic);
            assert!(!topic.contains("room"));
        }

        a.stop().await;
        b.stop().await;
    }

    // ===========================================
    // Robustness
    // ===========================================

    #[tokio::test]
    async fn garbage_and_self_messages_are_ignored() {
        let hub = MemoryHub::new();
        let network = MockNetwork::new();
        let (a, a_sink) = start("alice", "pw", &network, vec![Arc::new(hub.relay("mem://1"))]);
        let topics = RoomTopics::derive("test-app", "room", &PeerId::from("alice"));

        hub.inject(&topics.announce, "not json");
        hub.inject(&topics.direct, r#"{"peerId":"mallory","offer":"AAAA:BBBB"}"#);
        hub.inject(&topics.direct, r#"{"peerId":"mallory","answer":"AAAA:BBBB"}"#);

        // Our own announcements come back and must not trigger offers.
        assert!(wait_for(|| hub.published_to(&topics.announce) >= 3).await);
        assert!(a_sink.ids().is_empty());
        assert_eq!(a.pending_for(&PeerId::from("alice")).await, 0);
        assert_eq!(a.pending_for(&PeerId::from("mallory")).await, 0);

        a.stop().await;
    }

    #[tokio::test]
    async fn offline_relay_is_skipped() {
        let dead = MemoryHub::new();
        dead.set_offline(true);
        let live = MemoryHub::new();
        let network = MockNetwork::new();
        let (a, a_sink) = start(
            "alice",
            "pw",
            &network,
            vec![Arc::new(dead.relay("mem://dead")), Arc::new(live.relay("mem://live"))],
        );
        let (b, b_sink) = start("bob", "pw", &network, vec![Arc::new(live.relay("mem://live"))]);

        assert!(wait_for(|| a_sink.ids().len() == 1 && b_sink.ids().len() == 1).await);
        assert!(dead.published().is_empty());

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn relay_interval_hint_is_adopted() {
        let hub = MemoryHub::new();
        let network = MockNetwork::new();
        hub.set_interval_hint(Duration::from_secs(3600));
        let (a, _sink) = start("alice", "pw", &network, vec![Arc::new(hub.relay("mem://1"))]);
        let topics = RoomTopics::derive("test-app", "room", &PeerId::from("alice"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        // Default interval would have announced about six times by now.
        assert_eq!(hub.published_to(&topics.announce), 1);

        a.stop().await;
    }

    #[tokio::test]
    async fn pool_is_filled_and_stop_releases_everything() {
        let hub = MemoryHub::new();
        let network = MockNetwork::new();
        let (a, _sink) = start("alice", "pw", &network, vec![Arc::new(hub.relay("mem://1"))]);

        let filled = {
            let mut filled = false;
            for _ in 0..100 {
                if a.pooled_offers().await == 2 {
                    filled = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            filled
        };
        assert!(filled);

        a.stop().await;
        assert_eq!(a.pooled_offers().await, 0);
        assert_eq!(network.live_peers(), 0);
        assert_eq!(hub.subscription_count(), 0);
    }

    #[tokio::test]
    async fn failed_offer_generation_is_not_fatal() {
        let hub = MemoryHub::new();
        let network = MockNetwork::new();
        network.fail_next_offer("ice exploded");
        let (a, a_sink) = start("alice", "pw", &network, vec![Arc::new(hub.relay("mem://1"))]);
        let (b, b_sink) = start("bob", "pw", &network, vec![Arc::new(hub.relay("mem://1"))]);

        assert!(wait_for(|| a_sink.ids().len() == 1 && b_sink.ids().len() == 1).await);

        a.stop().await;
        b.stop().await;
    }
}
