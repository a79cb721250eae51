//! Chunk framing for room actions.
//!
//! Every message sent over a peer data channel is split into chunks of at
//! most [`CHUNK_SIZE`] bytes, each carrying a 15-byte header:
//!
//! ```text
//! +----------------+-------+-----+----------+-----------------+
//! | action (12, \0)| nonce | tag | progress | payload ...     |
//! +----------------+-------+-----+----------+-----------------+
//!   0..12           12      13    14         15..
//! ```
//!
//! `tag` bit 0 marks the last chunk of a message and bit 3 marks a JSON
//! payload. `progress` is advisory (0–255 scale). The nonce tells apart
//! concurrent messages on the same action from the same sender.
//!
//! [`Reassembler`] stitches chunks back together per peer, action and nonce.

use std::collections::HashMap;

use thiserror::Error;
use tower_types::{ActionName, PeerId, WireBody, ACTION_NAME_LEN};

/// Maximum size of one chunk on the wire, header included.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Size of the chunk header.
pub const HEADER_LEN: usize = ACTION_NAME_LEN + 3;

/// Payload bytes that fit in one chunk.
pub const PAYLOAD_CAPACITY: usize = CHUNK_SIZE - HEADER_LEN;

/// Default ceiling on a reassembled message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const NONCE_INDEX: usize = ACTION_NAME_LEN;
const TAG_INDEX: usize = NONCE_INDEX + 1;
const PROGRESS_INDEX: usize = TAG_INDEX + 1;

const TAG_LAST: u8 = 1;
const TAG_JSON: u8 = 1 << 3;
const TAG_KNOWN: u8 = TAG_LAST | TAG_JSON;

/// Errors decoding or reassembling chunks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Chunk shorter than the header.
    #[error("chunk too short: {0} bytes")]
    TooShort(usize),

    /// Chunk longer than [`CHUNK_SIZE`].
    #[error("chunk too long: {0} bytes")]
    TooLong(usize),

    /// Action name field is not a valid name.
    #[error("invalid action name in chunk header")]
    InvalidAction,

    /// Tag has bits set that this protocol does not define.
    #[error("unknown tag bits: {0:#04x}")]
    UnknownTag(u8),

    /// Chunks of one message disagree on the JSON flag.
    #[error("{action} nonce {nonce}: encoding flag changed mid-message")]
    MixedEncoding {
        /// Action of the broken message.
        action: ActionName,
        /// Nonce of the broken message.
        nonce: u8,
    },

    /// Reassembled message would exceed the configured ceiling.
    #[error("{action} nonce {nonce}: message exceeds {limit} bytes")]
    MessageTooLarge {
        /// Action of the oversized message.
        action: ActionName,
        /// Nonce of the oversized message.
        nonce: u8,
        /// Configured ceiling.
        limit: usize,
    },
}

/// Decoded header fields of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Action the chunk belongs to.
    pub action: ActionName,
    /// Message nonce within the action.
    pub nonce: u8,
    /// Whether this is the final chunk.
    pub is_last: bool,
    /// Whether the message payload is JSON.
    pub is_json: bool,
    /// Advisory progress, 0–255.
    pub progress: u8,
}

/// A decoded chunk borrowing its payload from the received buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Header fields.
    pub header: ChunkHeader,
    /// Payload bytes.
    pub payload: &'a [u8],
}

/// Split an encoded payload into framed chunks.
///
/// An empty payload produces a single empty final chunk so the receiver still
/// sees the message.
pub fn encode_chunks(action: ActionName, nonce: u8, body: &WireBody) -> Vec<Vec<u8>> {
    let total = body.bytes.len().div_ceil(PAYLOAD_CAPACITY).max(1);
    let json_bit = if body.is_json { TAG_JSON } else { 0 };

    (0..total)
        .map(|i| {
            let start = i * PAYLOAD_CAPACITY;
            let end = (start + PAYLOAD_CAPACITY).min(body.bytes.len());
            let payload = &body.bytes[start.min(end)..end];
            let is_last = i + 1 == total;

            let mut chunk = Vec::with_capacity(HEADER_LEN + payload.len());
            chunk.extend_from_slice(action.as_wire());
            chunk.push(nonce);
            chunk.push(json_bit | if is_last { TAG_LAST } else { 0 });
            chunk.push(progress(i, total));
            chunk.extend_from_slice(payload);
            chunk
        })
        .collect()
}

fn progress(index: usize, total: usize) -> u8 {
    (((index + 1) as f64 / total as f64) * 255.0).round() as u8
}

/// Parse one received chunk.
pub fn decode_chunk(bytes: &[u8]) -> Result<Chunk<'_>, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::TooShort(bytes.len()));
    }
    if bytes.len() > CHUNK_SIZE {
        return Err(FrameError::TooLong(bytes.len()));
    }

    let mut name = [0u8; ACTION_NAME_LEN];
    name.copy_from_slice(&bytes[..ACTION_NAME_LEN]);
    let action = ActionName::from_wire(&name).map_err(|_| FrameError::InvalidAction)?;

    let tag = bytes[TAG_INDEX];
    if tag & !TAG_KNOWN != 0 {
        return Err(FrameError::UnknownTag(tag));
    }

    Ok(Chunk {
        header: ChunkHeader {
            action,
            nonce: bytes[NONCE_INDEX],
            is_last: tag & TAG_LAST != 0,
            is_json: tag & TAG_JSON != 0,
            progress: bytes[PROGRESS_INDEX],
        },
        payload: &bytes[HEADER_LEN..],
    })
}

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Action the message was sent on.
    pub action: ActionName,
    /// Whether the payload is JSON.
    pub is_json: bool,
    /// Concatenated payload.
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct Pending {
    is_json: bool,
    bytes: Vec<u8>,
}

/// Per peer, per action, per nonce chunk accumulator.
///
/// Incomplete messages are kept until their final chunk arrives or their
/// peer is cleared with [`Reassembler::clear_peer`].
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<PeerId, HashMap<(ActionName, u8), Pending>>,
    max_message_size: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Reassembler {
    /// Create an accumulator refusing messages larger than `max_message_size`.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_message_size,
        }
    }

    /// Feed one chunk from `peer`. Returns the message once its last chunk is in.
    ///
    /// On error the offending partial message is discarded; other messages
    /// from the same peer are unaffected.
    pub fn push(&mut self, peer: &PeerId, chunk: Chunk<'_>) -> Result<Option<Message>, FrameError> {
        let ChunkHeader {
            action,
            nonce,
            is_last,
            is_json,
            ..
        } = chunk.header;

        let per_peer = self.pending.entry(peer.clone()).or_default();
        let key = (action, nonce);
        let entry = per_peer.entry(key).or_insert_with(|| Pending {
            is_json,
            bytes: Vec::new(),
        });

        if entry.is_json != is_json {
            per_peer.remove(&key);
            return Err(FrameError::MixedEncoding { action, nonce });
        }
        if entry.bytes.len() + chunk.payload.len() > self.max_message_size {
            per_peer.remove(&key);
            return Err(FrameError::MessageTooLarge {
                action,
                nonce,
                limit: self.max_message_size,
            });
        }
        entry.bytes.extend_from_slice(chunk.payload);

        if !is_last {
            return Ok(None);
        }

        Ok(per_peer.remove(&key).map(|done| Message {
            action,
            is_json: done.is_json,
            bytes: done.bytes,
        }))
    }

    /// Drop every incomplete message from `peer`.
    pub fn clear_peer(&mut self, peer: &PeerId) {
        self.pending.remove(peer);
    }

    /// Number of incomplete messages held for `peer`.
    pub fn pending_for(&self, peer: &PeerId) -> usize {
        self.pending.get(peer).map_or(0, HashMap::len)
    }
}
