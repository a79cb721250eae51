//! Rendezvous topic derivation.
//!
//! Relays only ever see hashes: the room-wide announce topic is derived from
//! the app id and room id, and each peer's direct topic additionally from its
//! peer id.

use sha2::{Digest, Sha256};
use tower_types::PeerId;

fn hash(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Topics a peer uses in one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomTopics {
    app_id: String,
    room_id: String,
    /// Room-wide announcement topic.
    pub announce: String,
    /// This peer's direct topic, where offers and answers arrive.
    pub direct: String,
}

impl RoomTopics {
    /// Derive the topics for `self_id` in `room_id`.
    pub fn derive(app_id: &str, room_id: &str, self_id: &PeerId) -> Self {
        Self {
            app_id: app_id.to_owned(),
            room_id: room_id.to_owned(),
            announce: hash(&format!("{}/room/{}", app_id, room_id)),
            direct: peer_topic(app_id, room_id, self_id),
        }
    }

    /// Direct topic of another peer in the same room.
    pub fn peer(&self, peer: &PeerId) -> String {
        peer_topic(&self.app_id, &self.room_id, peer)
    }

    /// Room id these topics were derived from.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }
}

/// Direct topic of `peer` in `room_id`.
pub fn peer_topic(app_id: &str, room_id: &str, peer: &PeerId) -> String {
    hash(&format!("{}/room/{}/{}", app_id, room_id, peer))
}
