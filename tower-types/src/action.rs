//! Named actions multiplexed over peer data channels.
//!
//! Every message sent between peers belongs to an action. The action name
//! travels in the first 12 bytes of every chunk, so names are restricted to
//! 1..=12 printable ASCII bytes. The payload of an action is either raw UTF-8
//! text (strings) or JSON (everything else); the chunk tag says which.

use std::fmt;

use serde::{de::DeserializeOwned, Serialize};

use crate::{CheckpointProposal, ElementEvent, HistoryEntries, PeerId, SessionDescription, SyncError};

/// Maximum length of an action name on the wire.
pub const ACTION_NAME_LEN: usize = 12;

/// A validated action name, stored NUL-padded exactly as it appears on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionName {
    bytes: [u8; ACTION_NAME_LEN],
    len: u8,
}

impl ActionName {
    /// Live element mutations.
    pub const REALTIME: Self = Self::from_static("realtime");
    /// Operation log transfer.
    pub const SEND_HISTORY: Self = Self::from_static("send-history");
    /// History pull request.
    pub const REQUEST_HISTORY: Self = Self::from_static("req-hist");
    /// Checkpoint proposal.
    pub const PROPOSE: Self = Self::from_static("propose");
    /// Reserved: sent before a peer tears down its room.
    pub const LEAVE: Self = Self::from_static("@_leave");
    /// Reserved: session descriptions for renegotiation.
    pub const SIGNAL: Self = Self::from_static("@_signal");

    /// Build a name from a literal. Invalid literals fail const evaluation.
    pub const fn from_static(name: &'static str) -> Self {
        let src = name.as_bytes();
        assert!(
            !src.is_empty() && src.len() <= ACTION_NAME_LEN,
            "action name must be 1..=12 bytes"
        );
        let mut bytes = [0u8; ACTION_NAME_LEN];
        let mut i = 0;
        while i < src.len() {
            assert!(src[i].is_ascii_graphic(), "action name must be printable ASCII");
            bytes[i] = src[i];
            i += 1;
        }
        Self {
            bytes,
            len: src.len() as u8,
        }
    }

    /// Validate a runtime name.
    pub fn new(name: &str) -> Result<Self, SyncError> {
        let src = name.as_bytes();
        if src.is_empty() || src.len() > ACTION_NAME_LEN {
            return Err(SyncError::InvalidActionName(name.to_owned()));
        }
        if !src.iter().all(u8::is_ascii_graphic) {
            return Err(SyncError::InvalidActionName(name.to_owned()));
        }
        let mut bytes = [0u8; ACTION_NAME_LEN];
        bytes[..src.len()].copy_from_slice(src);
        Ok(Self {
            bytes,
            len: src.len() as u8,
        })
    }

    /// Parse the NUL-padded name field of a chunk header.
    pub fn from_wire(field: &[u8; ACTION_NAME_LEN]) -> Result<Self, SyncError> {
        let len = field.iter().position(|b| *b == 0).unwrap_or(ACTION_NAME_LEN);
        if len == 0 || field[len..].iter().any(|b| *b != 0) {
            return Err(SyncError::InvalidActionName(
                String::from_utf8_lossy(field).into_owned(),
            ));
        }
        if !field[..len].iter().all(u8::is_ascii_graphic) {
            return Err(SyncError::InvalidActionName(
                String::from_utf8_lossy(&field[..len]).into_owned(),
            ));
        }
        Ok(Self {
            bytes: *field,
            len: len as u8,
        })
    }

    /// The NUL-padded wire representation.
    pub fn as_wire(&self) -> &[u8; ACTION_NAME_LEN] {
        &self.bytes
    }

    /// The name as text.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }

    /// Whether this is one of the room's internal `@_` actions.
    pub fn is_reserved(&self) -> bool {
        self.as_str().starts_with("@_")
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionName({})", self.as_str())
    }
}

/// An encoded action payload and its encoding flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireBody {
    /// Encoded bytes.
    pub bytes: Vec<u8>,
    /// True when `bytes` is JSON, false for raw UTF-8 text.
    pub is_json: bool,
}

/// A type that can travel as the payload of an action.
///
/// Strings go as raw text; structured payloads go as JSON and are validated
/// against their schema on decode.
pub trait ActionPayload: Sized + Send + Sync + 'static {
    /// Encode for transmission.
    fn encode(&self) -> Result<WireBody, SyncError>;

    /// Decode a reassembled payload.
    fn decode(bytes: &[u8], is_json: bool) -> Result<Self, SyncError>;
}

impl ActionPayload for String {
    fn encode(&self) -> Result<WireBody, SyncError> {
        Ok(WireBody {
            bytes: self.as_bytes().to_vec(),
            is_json: false,
        })
    }

    fn decode(bytes: &[u8], is_json: bool) -> Result<Self, SyncError> {
        if is_json {
            return serde_json::from_slice(bytes).map_err(SyncError::Deserialization);
        }
        String::from_utf8(bytes.to_vec()).map_err(|e| SyncError::InvalidData(e.to_string()))
    }
}

impl ActionPayload for PeerId {
    fn encode(&self) -> Result<WireBody, SyncError> {
        self.as_str().to_owned().encode()
    }

    fn decode(bytes: &[u8], is_json: bool) -> Result<Self, SyncError> {
        String::decode(bytes, is_json).map(PeerId::new)
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<WireBody, SyncError> {
    Ok(WireBody {
        bytes: serde_json::to_vec(value).map_err(SyncError::Serialization)?,
        is_json: true,
    })
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8], is_json: bool) -> Result<T, SyncError> {
    if !is_json {
        return Err(SyncError::InvalidData("expected a JSON payload".into()));
    }
    serde_json::from_slice(bytes).map_err(SyncError::Deserialization)
}

macro_rules! json_payload {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ActionPayload for $ty {
                fn encode(&self) -> Result<WireBody, SyncError> {
                    encode_json(self)
                }

                fn decode(bytes: &[u8], is_json: bool) -> Result<Self, SyncError> {
                    decode_json(bytes, is_json)
                }
            }
        )*
    };
}

json_payload!(ElementEvent, HistoryEntries, CheckpointProposal, SessionDescription);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ElementKind;

    #[test]
    fn well_known_names() {
        assert_eq!(ActionName::SEND_HISTORY.as_str(), "send-history");
        assert_eq!(ActionName::REQUEST_HISTORY.as_str(), "req-hist");
        assert!(ActionName::LEAVE.is_reserved());
        assert!(!ActionName::REALTIME.is_reserved());
    }

    #[test]
    fn runtime_names_are_validated() {
        assert!(ActionName::new("").is_err());
        assert!(ActionName::new("thirteen-long").is_err());
        assert!(ActionName::new("has space").is_err());
        assert_eq!(ActionName::new("cursor").unwrap().as_str(), "cursor");
    }

    #[test]
    fn wire_field_is_nul_padded() {
        let name = ActionName::PROPOSE;
        assert_eq!(&name.as_wire()[..7], b"propose");
        assert!(name.as_wire()[7..].iter().all(|b| *b == 0));
        assert_eq!(ActionName::from_wire(name.as_wire()).unwrap(), name);
    }

    #[test]
    fn wire_field_rejects_garbage() {
        assert!(ActionName::from_wire(&[0u8; 12]).is_err());
        let mut field = *ActionName::REALTIME.as_wire();
        field[10] = b'x';
        assert!(ActionName::from_wire(&field).is_err());
    }

    #[test]
    fn strings_travel_raw_and_structs_as_json() {
        let body = "room-1".to_string().encode().unwrap();
        assert!(!body.is_json);
        assert_eq!(body.bytes, b"room-1");

        let event = ElementEvent::delete("e1");
        let body = event.encode().unwrap();
        assert!(body.is_json);
        assert_eq!(ElementEvent::decode(&body.bytes, true).unwrap(), event);
    }

    #[test]
    fn structured_payload_requires_json_flag() {
        let body = ElementEvent::delete("e1").encode().unwrap();
        assert!(ElementEvent::decode(&body.bytes, false).is_err());
    }

    #[test]
    fn malformed_json_is_rejected() {
        let bad = br#"{"action":"update","payload":{"id":"e1"}}"#;
        assert!(ElementEvent::decode(bad, true).is_err());
        let ok = br#"{"action":"update","payload":{"id":"e1","type":"circle"}}"#;
        match ElementEvent::decode(ok, true).unwrap() {
            ElementEvent::Update(p) => assert_eq!(p.kind, ElementKind::Circle),
            other => panic!("unexpected {:?}", other),
        }
    }
}
