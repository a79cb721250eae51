//! # tower-types
//!
//! Wire format types for the tower peer-to-peer whiteboard.
//!
//! This crate provides the foundational types used across all tower crates:
//! - [`PeerId`], [`SequenceKey`], [`ElementId`], [`CheckpointId`] - Identity and ordering types
//! - [`Element`], [`ElementPatch`], [`ElementEvent`] - Document elements and their mutations
//! - [`ActionName`], [`ActionPayload`] - Named room actions and their payload encoding
//! - [`CheckpointProposal`], [`SessionDescription`], [`RendezvousMessage`] - Action and signaling schemas
//! - [`relay`] - Signed pub/sub events exchanged with relays
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod action;
mod element;
mod error;
mod ids;
mod messages;
pub mod relay;

pub use action::{ActionName, ActionPayload, WireBody, ACTION_NAME_LEN};
pub use element::{Element, ElementEvent, ElementKind, ElementPatch, ElementRef, Point, Shape};
pub use error::SyncError;
pub use ids::{CheckpointId, ElementId, PeerId, SequenceKey};
pub use messages::{
    Announcement, CheckpointProposal, HistoryEntries, RendezvousMessage, SdpType,
    SessionDescription, SignalEnvelope,
};
