//! Peer connections with one reliable, ordered data channel.
//!
//! A [`ConnectionChannel`] drives a pluggable [`PeerBackend`] (webrtc-rs, or
//! the in-memory [`MockNetwork`] for testing) through the negotiation state
//! machine from tower-core:
//!
//! - `create_offer()` produces a complete local offer (ICE gathered)
//! - `apply_signal()` applies a remote offer or answer, handling glare
//! - `send()` writes one binary message; `wait_writable()` applies back-pressure
//! - `close()` tears down; listeners see [`ChannelEvent::Closed`] exactly once
//!
//! # Example
//!
//! ```ignore
//! let (offerer, mut a_events) = ConnectionChannel::open(&network, Role::Offerer, 65536).await?;
//! let (answerer, mut b_events) = ConnectionChannel::open(&network, Role::Answerer, 65536).await?;
//! let offer = offerer.create_offer().await?;
//! let answer = answerer.apply_signal(offer).await?.expect("answer");
//! offerer.apply_signal(answer).await?;
//! ```

pub mod mock;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use mock::{MockNetwork, MockPeer};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tower_core::{decide_offer, Action, Event, NegotiationState, OfferDecision, Role, SignalingFlags};
use tower_types::{SdpType, SessionDescription};
use tracing::{debug, warn};

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The data channel is not open.
    #[error("channel not open")]
    ChannelNotOpen,

    /// The connection was torn down.
    #[error("channel closed")]
    Closed,

    /// Another offer is being generated on this connection.
    #[error("offer already in progress")]
    OfferInProgress,

    /// Offer/answer handling failed.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The backend could not write.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The backend could not create a peer connection.
    #[error("peer connection setup failed: {0}")]
    Setup(String),
}

/// Transport-level state reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    /// Created, nothing happened yet.
    New,
    /// ICE/DTLS in progress.
    Connecting,
    /// Transport established.
    Connected,
    /// Transport lost.
    Disconnected,
    /// Transport failed.
    Failed,
    /// Transport closed.
    Closed,
}

impl PeerConnectionState {
    /// Disconnected, failed and closed all end the channel.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Notifications a backend pushes to its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// The data channel opened.
    ChannelOpen,
    /// A binary message arrived.
    Message(Vec<u8>),
    /// Buffered outgoing bytes dropped below the low-water mark.
    BufferedAmountLow,
    /// Transport state changed.
    StateChanged(PeerConnectionState),
    /// The backend produced a description on its own (renegotiation).
    LocalDescription(SessionDescription),
}

/// Sender half backends use to report [`BackendEvent`]s.
pub type BackendEvents = mpsc::UnboundedSender<BackendEvent>;

/// One underlying peer connection.
///
/// Implementations hold the real connection (or a simulation of it); all
/// negotiation policy lives in [`ConnectionChannel`].
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Create a local offer and wait until it is complete.
    async fn create_offer(&self) -> Result<SessionDescription, ChannelError>;

    /// Apply a remote offer or answer.
    async fn set_remote(&self, desc: &SessionDescription) -> Result<(), ChannelError>;

    /// Create a local answer to the applied remote offer.
    async fn create_answer(&self) -> Result<SessionDescription, ChannelError>;

    /// Discard the local offer.
    async fn rollback(&self) -> Result<(), ChannelError>;

    /// Whether the signaling state is stable.
    async fn is_stable(&self) -> bool;

    /// Write one binary message.
    async fn send(&self, data: &[u8]) -> Result<(), ChannelError>;

    /// Outgoing bytes not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// Release the connection.
    async fn close(&self);
}

/// Creates peer backends.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Create a backend for `role`, reporting to `events`.
    async fn create(
        &self,
        role: Role,
        events: BackendEvents,
    ) -> Result<Arc<dyn PeerBackend>, ChannelError>;
}

/// What a channel reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The data channel is open.
    Open,
    /// A binary message arrived.
    Data(Vec<u8>),
    /// A description to forward to the remote peer over an existing link.
    Signal(SessionDescription),
    /// The channel is gone. Sent exactly once.
    Closed,
}

/// Receiver half of a channel's events.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A negotiated (or negotiating) peer connection.
#[derive(Clone)]
pub struct ConnectionChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: u64,
    role: Role,
    backend: Arc<dyn PeerBackend>,
    state: Mutex<NegotiationState>,
    making_offer: AtomicBool,
    answer_pending: AtomicBool,
    drained: Notify,
    low_water_mark: usize,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelInner {
    fn state(&self) -> MutexGuard<'_, NegotiationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(&self, event: Event) {
        let actions = {
            let mut state = self.state();
            let (next, actions) = state.on_event(event);
            *state = next;
            actions
        };

        for action in actions {
            match action {
                Action::NotifyOpen => {
                    debug!("channel {} open", self.id);
                    let _ = self.events.send(ChannelEvent::Open);
                }
                Action::NotifyClosed => {
                    debug!("channel {} closed", self.id);
                    self.drained.notify_waiters();
                    let _ = self.events.send(ChannelEvent::Closed);
                }
                Action::ReleaseTransport => self.backend.close().await,
            }
        }
    }
}

impl std::fmt::Debug for ConnectionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionChannel")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &*self.inner.state())
            .finish()
    }
}

impl ConnectionChannel {
    /// Create a backend through `factory` and wrap it.
    ///
    /// Sends wait for drain once more than `low_water_mark` bytes are buffered.
    pub async fn open(
        factory: &dyn PeerFactory,
        role: Role,
        low_water_mark: usize,
    ) -> Result<(Self, ChannelEvents), ChannelError> {
        let (backend_tx, backend_rx) = mpsc::unbounded_channel();
        let backend = factory.create(role, backend_tx).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ChannelInner {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            role,
            backend,
            state: Mutex::new(NegotiationState::Idle),
            making_offer: AtomicBool::new(false),
            answer_pending: AtomicBool::new(false),
            drained: Notify::new(),
            low_water_mark,
            events: events_tx,
        });
        tokio::spawn(pump(Arc::downgrade(&inner), backend_rx));

        Ok((Self { inner }, events_rx))
    }

    /// Process-unique id of this channel.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Role this channel was created with.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Current negotiation state.
    pub fn state(&self) -> NegotiationState {
        *self.inner.state()
    }

    /// Whether the data channel is open.
    pub fn is_open(&self) -> bool {
        self.inner.state().is_connected()
    }

    /// Whether the channel has been torn down.
    pub fn is_closed(&self) -> bool {
        self.inner.state().is_closed()
    }

    /// Generate the local offer, waiting for ICE gathering.
    ///
    /// Only one offer may be in flight per connection.
    pub async fn create_offer(&self) -> Result<SessionDescription, ChannelError> {
        let inner = &self.inner;
        if inner.making_offer.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::OfferInProgress);
        }

        inner.dispatch(Event::OfferStarted).await;
        let result = inner.backend.create_offer().await;
        inner.making_offer.store(false, Ordering::SeqCst);

        match &result {
            Ok(_) => inner.dispatch(Event::OfferReady).await,
            Err(e) => {
                warn!("channel {} failed to create offer: {}", inner.id, e);
                inner.dispatch(Event::OfferFailed).await;
            }
        }
        result
    }

    /// Apply a remote description.
    ///
    /// Returns the local answer when `desc` is an offer that was accepted.
    /// Colliding offers are ignored on the offering side and rolled back on
    /// the answering side; stray answers are ignored.
    pub async fn apply_signal(
        &self,
        desc: SessionDescription,
    ) -> Result<Option<SessionDescription>, ChannelError> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if self.is_open() && !desc.has_media() {
            debug!("channel {} ignoring renegotiation without media", inner.id);
            return Ok(None);
        }

        match desc.kind {
            SdpType::Offer => {
                let flags = SignalingFlags {
                    making_offer: inner.making_offer.load(Ordering::SeqCst),
                    setting_remote_answer_pending: inner.answer_pending.load(Ordering::SeqCst),
                    stable: inner.backend.is_stable().await,
                };
                match decide_offer(inner.role, flags) {
                    OfferDecision::Ignore => {
                        debug!("channel {} ignoring colliding offer", inner.id);
                        return Ok(None);
                    }
                    OfferDecision::RollbackThenApply => {
                        if let Err(e) = inner.backend.rollback().await {
                            debug!("channel {} rollback failed: {}", inner.id, e);
                        }
                    }
                    OfferDecision::Apply => {}
                }

                inner.backend.set_remote(&desc).await?;
                inner.dispatch(Event::RemoteOffer).await;
                inner.backend.create_answer().await.map(Some)
            }
            SdpType::Answer | SdpType::Pranswer => {
                if inner.answer_pending.swap(true, Ordering::SeqCst) {
                    debug!("channel {} ignoring concurrent answer", inner.id);
                    return Ok(None);
                }
                let result = if inner.backend.is_stable().await {
                    debug!("channel {} ignoring stray answer", inner.id);
                    Ok(false)
                } else {
                    inner.backend.set_remote(&desc).await.map(|_| true)
                };
                inner.answer_pending.store(false, Ordering::SeqCst);

                if result? {
                    inner.dispatch(Event::RemoteAnswer).await;
                }
                Ok(None)
            }
            SdpType::Rollback => {
                inner.backend.rollback().await?;
                Ok(None)
            }
        }
    }

    /// Send one binary message.
    pub async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen);
        }
        self.inner.backend.send(data).await
    }

    /// Wait until buffered bytes are at or below the low-water mark.
    pub async fn wait_writable(&self) -> Result<(), ChannelError> {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if !self.is_open() {
                return Err(ChannelError::ChannelNotOpen);
            }
            if self.inner.backend.buffered_amount().await <= self.inner.low_water_mark {
                return Ok(());
            }
            drained.await;
        }
    }

    /// Tear the connection down.
    pub async fn close(&self) {
        self.inner.dispatch(Event::CloseRequested).await;
    }
}

async fn pump(inner: Weak<ChannelInner>, mut backend_rx: mpsc::UnboundedReceiver<BackendEvent>) {
    while let Some(event) = backend_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match event {
            BackendEvent::ChannelOpen => inner.dispatch(Event::ChannelOpened).await,
            BackendEvent::Message(bytes) => {
                if !inner.state().is_closed() {
                    let _ = inner.events.send(ChannelEvent::Data(bytes));
                }
            }
            BackendEvent::BufferedAmountLow => inner.drained.notify_waiters(),
            BackendEvent::StateChanged(state) if state.is_terminal() => {
                debug!("channel {} transport {:?}", inner.id, state);
                inner.dispatch(Event::TransportClosed).await;
            }
            BackendEvent::StateChanged(state) => {
                debug!("channel {} transport {:?}", inner.id, state);
            }
            BackendEvent::LocalDescription(desc) => {
                if inner.state().is_connected() {
                    let _ = inner.events.send(ChannelEvent::Signal(desc));
                }
            }
        }

        if inner.state().is_closed() {
            return;
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.dispatch(Event::TransportClosed).await;
    }
}
