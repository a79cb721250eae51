//! Relay protocol: signed, self-authenticating pub/sub events.
//!
//! The envelope follows the nostr layout. Clients send `["REQ", sub, filter]`,
//! `["EVENT", event]` and `["CLOSE", sub]`; relays answer with
//! `["EVENT", sub, event]`, `["EOSE", sub]`, `["OK", id, accepted, message]`,
//! `["NOTICE", message]` and `["CLOSED", sub, message]`.
//!
//! An event's id is the SHA-256 of `[0, pubkey, created_at, kind, tags, content]`
//! and its signature covers the id, so a relay cannot alter any of those
//! fields without detection. Signatures are Ed25519.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::SyncError;

/// Tag name carrying the topic of an event.
pub const TOPIC_TAG: &str = "x";

/// Prefix of the interval hint a relay may attach to `OK` and `NOTICE` messages.
const RETRY_AFTER: &str = "retry-after=";

/// Event kind derived from a topic string: the sum of its character codes,
/// modulo 10 000, offset into the ephemeral range.
pub fn topic_kind(topic: &str) -> u32 {
    let sum: u64 = topic.chars().map(|c| c as u64).sum();
    (sum % 10_000) as u32 + 20_000
}

/// Extract a `retry-after=<secs>` hint from a relay message.
pub fn parse_retry_after(message: &str) -> Option<u64> {
    let start = message.find(RETRY_AFTER)? + RETRY_AFTER.len();
    let digits: String = message[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Format a `retry-after=<secs>` hint.
pub fn format_retry_after(reason: &str, secs: u64) -> String {
    format!("{}: {}{}", reason, RETRY_AFTER, secs)
}

/// A signed relay event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hex SHA-256 over the canonical serialization.
    pub id: String,
    /// Hex Ed25519 public key of the author.
    pub pubkey: String,
    /// Unix seconds.
    pub created_at: u64,
    /// Kind derived from the topic.
    pub kind: u32,
    /// Tag arrays; the topic lives under [`TOPIC_TAG`].
    pub tags: Vec<Vec<String>>,
    /// Opaque content.
    pub content: String,
    /// Hex Ed25519 signature over the id bytes.
    pub sig: String,
}

impl Event {
    /// Compute the canonical id for the given fields.
    pub fn compute_id(
        pubkey: &str,
        created_at: u64,
        kind: u32,
        tags: &[Vec<String>],
        content: &str,
    ) -> String {
        hex::encode(id_digest(pubkey, created_at, kind, tags, content))
    }

    /// The topic this event was published to, if tagged.
    pub fn topic(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == TOPIC_TAG)
            .map(|t| t[1].as_str())
    }

    /// Check the id against the content and the signature against the id.
    pub fn verify(&self) -> Result<(), SyncError> {
        let expected = Self::compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if expected != self.id {
            return Err(SyncError::InvalidSignature("id does not match content".into()));
        }

        let pubkey: [u8; 32] = decode_fixed(&self.pubkey)?;
        let sig: [u8; 64] = decode_fixed(&self.sig)?;
        let id: [u8; 32] = decode_fixed(&self.id)?;

        let key = VerifyingKey::from_bytes(&pubkey)
            .map_err(|e| SyncError::InvalidSignature(e.to_string()))?;
        key.verify(&id, &Signature::from_bytes(&sig))
            .map_err(|e| SyncError::InvalidSignature(e.to_string()))
    }
}

fn id_digest(pubkey: &str, created_at: u64, kind: u32, tags: &[Vec<String>], content: &str) -> [u8; 32] {
    let canonical = json!([0, pubkey, created_at, kind, tags, content]).to_string();
    Sha256::digest(canonical.as_bytes()).into()
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], SyncError> {
    let bytes = hex::decode(s).map_err(|e| SyncError::InvalidSignature(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| SyncError::InvalidSignature(format!("expected {} bytes", N)))
}

/// Signs events on behalf of one relay client.
///
/// Each client holds an ephemeral keypair; relays only use it to check that
/// events were not tampered with.
pub struct EventSigner {
    key: SigningKey,
    pubkey: String,
}

impl EventSigner {
    /// Create a signer with a fresh random key.
    pub fn generate() -> Result<Self, SyncError> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).map_err(|e| SyncError::Crypto(e.to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Create a signer from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let key = SigningKey::from_bytes(seed);
        let pubkey = hex::encode(key.verifying_key().as_bytes());
        Self { key, pubkey }
    }

    /// Hex public key.
    pub fn public_key(&self) -> &str {
        &self.pubkey
    }

    /// Build and sign an event publishing `content` to `topic`.
    pub fn sign(&self, topic: &str, content: &str, created_at: u64) -> Event {
        let kind = topic_kind(topic);
        let tags = vec![vec![TOPIC_TAG.to_owned(), topic.to_owned()]];
        let digest = id_digest(&self.pubkey, created_at, kind, &tags, content);
        let sig = hex::encode(self.key.sign(&digest).to_bytes());
        Event {
            id: hex::encode(digest),
            pubkey: self.pubkey.clone(),
            created_at,
            kind,
            tags,
            content: content.to_owned(),
            sig,
        }
    }
}

/// Subscription filter carried by `REQ`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Accepted kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u32>,
    /// Only events created at or after this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    /// Accepted topics.
    #[serde(rename = "#x", default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
}

impl Filter {
    /// Filter for events on `topic` published at or after `since`.
    pub fn topic(topic: &str, since: u64) -> Self {
        Self {
            kinds: vec![topic_kind(topic)],
            since: Some(since),
            topics: vec![topic.to_owned()],
        }
    }

    /// Whether `event` passes this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if !self.topics.is_empty() {
            match event.topic() {
                Some(t) if self.topics.iter().any(|x| x == t) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Messages a client sends to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Open a subscription.
    Req {
        /// Subscription id, chosen by the client.
        sub_id: String,
        /// What to deliver.
        filter: Filter,
    },
    /// Publish an event.
    Event(Event),
    /// Close a subscription.
    Close {
        /// Subscription id.
        sub_id: String,
    },
}

impl ClientMessage {
    /// Serialize to the JSON array form.
    pub fn to_json(&self) -> String {
        match self {
            Self::Req { sub_id, filter } => json!(["REQ", sub_id, filter]),
            Self::Event(event) => json!(["EVENT", event]),
            Self::Close { sub_id } => json!(["CLOSE", sub_id]),
        }
        .to_string()
    }

    /// Parse the JSON array form.
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        let parts = parse_array(text)?;
        match label(&parts)? {
            "REQ" => Ok(Self::Req {
                sub_id: string_at(&parts, 1)?,
                filter: value_at(&parts, 2)?,
            }),
            "EVENT" => Ok(Self::Event(value_at(&parts, 1)?)),
            "CLOSE" => Ok(Self::Close {
                sub_id: string_at(&parts, 1)?,
            }),
            other => Err(SyncError::InvalidData(format!("unknown client message {}", other))),
        }
    }
}

/// Messages a relay sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// An event matching one of the client's subscriptions.
    Event {
        /// Subscription the event matched.
        sub_id: String,
        /// The event.
        event: Event,
    },
    /// End of stored events for a subscription.
    Eose {
        /// Subscription id.
        sub_id: String,
    },
    /// Result of a publish.
    Ok {
        /// Id of the published event.
        event_id: String,
        /// Whether the relay accepted it.
        accepted: bool,
        /// Human-readable detail; may carry a retry-after hint.
        message: String,
    },
    /// Free-form notice; may carry a retry-after hint.
    Notice(String),
    /// The relay closed a subscription.
    Closed {
        /// Subscription id.
        sub_id: String,
        /// Reason.
        message: String,
    },
}

impl RelayMessage {
    /// Serialize to the JSON array form.
    pub fn to_json(&self) -> String {
        match self {
            Self::Event { sub_id, event } => json!(["EVENT", sub_id, event]),
            Self::Eose { sub_id } => json!(["EOSE", sub_id]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            Self::Notice(message) => json!(["NOTICE", message]),
            Self::Closed { sub_id, message } => json!(["CLOSED", sub_id, message]),
        }
        .to_string()
    }

    /// Parse the JSON array form.
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        let parts = parse_array(text)?;
        match label(&parts)? {
            "EVENT" => Ok(Self::Event {
                sub_id: string_at(&parts, 1)?,
                event: value_at(&parts, 2)?,
            }),
            "EOSE" => Ok(Self::Eose {
                sub_id: string_at(&parts, 1)?,
            }),
            "OK" => Ok(Self::Ok {
                event_id: string_at(&parts, 1)?,
                accepted: value_at(&parts, 2)?,
                message: string_at(&parts, 3).unwrap_or_default(),
            }),
            "NOTICE" => Ok(Self::Notice(string_at(&parts, 1)?)),
            "CLOSED" => Ok(Self::Closed {
                sub_id: string_at(&parts, 1)?,
                message: string_at(&parts, 2).unwrap_or_default(),
            }),
            other => Err(SyncError::InvalidData(format!("unknown relay message {}", other))),
        }
    }
}

fn parse_array(text: &str) -> Result<Vec<Value>, SyncError> {
    serde_json::from_str(text).map_err(SyncError::Deserialization)
}

fn label(parts: &[Value]) -> Result<&str, SyncError> {
    parts
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::InvalidData("missing message label".into()))
}

fn string_at(parts: &[Value], i: usize) -> Result<String, SyncError> {
    parts
        .get(i)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| SyncError::InvalidData(format!("expected string at position {}", i)))
}

fn value_at<T: serde::de::DeserializeOwned>(parts: &[Value], i: usize) -> Result<T, SyncError> {
    let value = parts
        .get(i)
        .cloned()
        .ok_or_else(|| SyncError::InvalidData(format!("missing element {}", i)))?;
    serde_json::from_value(value).map_err(SyncError::Deserialization)
}
