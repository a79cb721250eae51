//! Offer/answer negotiation state machine for one peer connection.
//!
//! Pure and side-effect free, in the same shape as the rest of this crate:
//! [`NegotiationState::on_event`] consumes an event and returns the next state
//! plus the actions the caller must perform. The caller (tower-client's
//! `ConnectionChannel`) owns the real peer connection.
//!
//! ```text
//! offerer:  Idle -> Negotiating -> AwaitingAnswer -> Connected -> Closed
//! answerer: Idle -> Answering ----------------------> Connected -> Closed
//! ```
//!
//! Every path into `Closed` emits [`Action::NotifyClosed`] exactly once.

use tower_types::PeerId;

/// Which side of the initial negotiation a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created the data channel and sends the first offer.
    Offerer,
    /// Waits for a remote offer.
    Answerer,
}

/// Negotiation lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing exchanged yet.
    Idle,
    /// Generating a local offer (ICE gathering in progress).
    Negotiating,
    /// Offer handed out, waiting for the remote answer.
    AwaitingAnswer,
    /// Remote offer applied, producing or having produced an answer.
    Answering,
    /// Data channel open.
    Connected,
    /// Torn down. Terminal.
    Closed,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Local offer generation started.
    OfferStarted,
    /// Local offer is ready to send.
    OfferReady,
    /// Local offer generation failed.
    OfferFailed,
    /// A remote offer was applied.
    RemoteOffer,
    /// A remote answer was applied.
    RemoteAnswer,
    /// The data channel reported open.
    ChannelOpened,
    /// Transport went disconnected, failed or closed.
    TransportClosed,
    /// Local side asked to close.
    CloseRequested,
}

/// Side effects the caller must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Tell listeners the channel is usable.
    NotifyOpen,
    /// Tell listeners the channel is gone.
    NotifyClosed,
    /// Release the underlying peer connection.
    ReleaseTransport,
}

impl NegotiationState {
    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        use NegotiationState::*;

        match (self, event) {
            (Closed, _) => (Closed, vec![]),

            (_, Event::TransportClosed) | (_, Event::CloseRequested) => (
                Closed,
                vec![Action::ReleaseTransport, Action::NotifyClosed],
            ),

            (Connected, Event::ChannelOpened) => (Connected, vec![]),
            (_, Event::ChannelOpened) => (Connected, vec![Action::NotifyOpen]),

            // Renegotiation on a live channel leaves it connected.
            (Connected, _) => (Connected, vec![]),

            (Idle, Event::OfferStarted) => (Negotiating, vec![]),
            (Negotiating, Event::OfferReady) => (AwaitingAnswer, vec![]),
            (Negotiating, Event::OfferFailed) => (Idle, vec![]),

            (Idle | Negotiating | AwaitingAnswer, Event::RemoteOffer) => (Answering, vec![]),
            (AwaitingAnswer, Event::RemoteAnswer) => (AwaitingAnswer, vec![]),

            (state, _) => (state, vec![]),
        }
    }

    /// Whether the data channel is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Signaling flags consulted when a remote offer arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalingFlags {
    /// A local offer is being generated.
    pub making_offer: bool,
    /// A remote answer is currently being applied.
    pub setting_remote_answer_pending: bool,
    /// The peer connection's signaling state is stable.
    pub stable: bool,
}

/// How to treat an incoming remote offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    /// No collision: apply it.
    Apply,
    /// Collision on the answering side: roll back the local offer, then apply.
    RollbackThenApply,
    /// Collision on the offering side: keep our offer, drop theirs.
    Ignore,
}

/// Decide how to handle a remote offer given the current flags.
///
/// A collision is a local offer in flight, or a non-stable signaling state
/// that is not explained by an answer being applied. The offerer keeps its
/// own offer; the answerer yields.
///
/// ```
/// use tower_core::{decide_offer, OfferDecision, Role, SignalingFlags};
///
/// let glare = SignalingFlags { making_offer: true, ..Default::default() };
/// assert_eq!(decide_offer(Role::Offerer, glare), OfferDecision::Ignore);
/// ```
pub fn decide_offer(role: Role, flags: SignalingFlags) -> OfferDecision {
    let collision =
        flags.making_offer || (!flags.stable && !flags.setting_remote_answer_pending);
    match (collision, role) {
        (false, _) => OfferDecision::Apply,
        (true, Role::Offerer) => OfferDecision::Ignore,
        (true, Role::Answerer) => OfferDecision::RollbackThenApply,
    }
}

/// Whether to ignore a remote offer that collides with our own pending offer.
///
/// When two peers offer each other at the same moment, the peer with the
/// greater identifier drops the incoming offer and waits for an answer to its
/// own, while the smaller identifier answers. Both sides therefore settle on
/// the same single connection.
pub fn keeps_own_offer(self_id: &PeerId, remote_id: &PeerId, has_pending_offer: bool) -> bool {
    has_pending_offer && self_id > remote_id
}
