//! # tower-core
//!
//! Pure logic for the tower peer-to-peer whiteboard.
//!
//! Everything here is synchronous and free of I/O so it can be tested
//! instantly; tower-client drives it from async tasks.
//!
//! - [`frame`] - 16 KiB chunk framing and per peer/action/nonce reassembly
//! - [`history`] - operation log, replay into a [`Document`], snapshots
//! - [`checkpoint`] - checkpoint voting and quorum
//! - [`negotiation`] - offer/answer state machine and tie-breaking
//! - [`topics`] - hashed rendezvous topics

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod frame;
pub mod history;
pub mod negotiation;
pub mod topics;

pub use checkpoint::{has_quorum, quorum_threshold, should_propose, ProposalOutcome, VoteBook};
pub use frame::{
    decode_chunk, encode_chunks, Chunk, ChunkHeader, FrameError, Message, Reassembler, CHUNK_SIZE,
    HEADER_LEN, PAYLOAD_CAPACITY,
};
pub use history::{ApplyError, Document, OperationLog, Replay, Snapshot};
pub use negotiation::{
    decide_offer, keeps_own_offer, Action, Event, NegotiationState, OfferDecision, Role,
    SignalingFlags,
};
pub use topics::{peer_topic, RoomTopics};
