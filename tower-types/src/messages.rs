//! Payload schemas for room actions and signaling envelopes.

use serde::{Deserialize, Serialize};

use crate::{CheckpointId, ElementEvent, PeerId, SequenceKey, SyncError};

/// A batch of operation log entries, as carried by `send-history` and stored
/// under the `history` persistence key: `[[sequenceKey, event], ...]`.
pub type HistoryEntries = Vec<(SequenceKey, ElementEvent)>;

/// A checkpoint proposal broadcast over `propose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointProposal {
    /// Identifier of the proposed checkpoint.
    pub checkpoint_id: CheckpointId,
    /// Content hash of the proposer's materialized state.
    pub element_hash: String,
}

/// SDP type of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// An offer.
    Offer,
    /// A provisional answer.
    Pranswer,
    /// A final answer.
    Answer,
    /// Cancel the current negotiation.
    Rollback,
}

/// A WebRTC session description, `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: SdpType,
    /// SDP body.
    pub sdp: String,
}

impl SessionDescription {
    /// An offer with the given SDP.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// An answer with the given SDP.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Whether the SDP describes media tracks (renegotiation for audio/video).
    pub fn has_media(&self) -> bool {
        self.sdp.contains("a=rtpmap")
    }
}

/// Announcement published on the room topic: the sender's id and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    /// Announcing peer.
    pub peer_id: PeerId,
}

/// Offer or answer sent to a peer's self topic.
///
/// `offer` and `answer` hold the room-key encrypted JSON of a
/// [`SessionDescription`]; relays only ever see ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Sender of the envelope.
    pub peer_id: PeerId,
    /// Encrypted offer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    /// Encrypted answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

/// Anything that may arrive on a rendezvous topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousMessage {
    /// Someone announced their presence on the room topic.
    Announce(Announcement),
    /// Someone sent us an offer.
    Offer {
        /// Sender.
        peer_id: PeerId,
        /// Encrypted offer SDP.
        sealed: String,
    },
    /// Someone answered our offer.
    Answer {
        /// Sender.
        peer_id: PeerId,
        /// Encrypted answer SDP.
        sealed: String,
    },
}

impl RendezvousMessage {
    /// Serialize to JSON text.
    pub fn to_json(&self) -> Result<String, SyncError> {
        let result = match self {
            Self::Announce(a) => serde_json::to_string(a),
            Self::Offer { peer_id, sealed } => serde_json::to_string(&SignalEnvelope {
                peer_id: peer_id.clone(),
                offer: Some(sealed.clone()),
                answer: None,
            }),
            Self::Answer { peer_id, sealed } => serde_json::to_string(&SignalEnvelope {
                peer_id: peer_id.clone(),
                offer: None,
                answer: Some(sealed.clone()),
            }),
        };
        result.map_err(SyncError::Serialization)
    }

    /// Parse JSON text. An envelope carrying both or neither of offer and
    /// answer is only valid as a bare announcement.
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        let envelope: SignalEnvelope =
            serde_json::from_str(text).map_err(SyncError::Deserialization)?;
        match (envelope.offer, envelope.answer) {
            (None, None) => Ok(Self::Announce(Announcement {
                peer_id: envelope.peer_id,
            })),
            (Some(sealed), None) => Ok(Self::Offer {
                peer_id: envelope.peer_id,
                sealed,
            }),
            (None, Some(sealed)) => Ok(Self::Answer {
                peer_id: envelope.peer_id,
                sealed,
            }),
            (Some(_), Some(_)) => Err(SyncError::InvalidData(
                "envelope carries both offer and answer".into(),
            )),
        }
    }

    /// The peer that sent this message.
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Announce(a) => &a.peer_id,
            Self::Offer { peer_id, .. } | Self::Answer { peer_id, .. } => peer_id,
        }
    }
}
