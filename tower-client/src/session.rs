//! Joining and leaving a room.
//!
//! A [`Session`] wires the pieces together for one room:
//!
//! 1. load (or mint) this peer's id from the store
//! 2. derive the room key and rendezvous topics
//! 3. create the [`Room`] and start the [`SyncEngine`] on it
//! 4. start [`Rendezvous`], handing every opened connection to the room
//!
//! # Example
//!
//! ```ignore
//! let relays = Session::connect_relays(&config.relays)?;
//! let session = Session::join(&config, "sketches", factory, relays, store).await?;
//! session.engine().commit(event).await?;
//! session.leave().await;
//! ```

use std::sync::Arc;

use thiserror::Error;
use tower_core::RoomTopics;
use tower_types::PeerId;
use tracing::info;

use crate::channel::{ChannelError, PeerFactory};
use crate::config::{ConfigError, RoomConfig};
use crate::crypto::{CryptoError, RoomKey};
use crate::engine::{EngineError, SyncEngine};
use crate::persistence::{load_or_create_peer_id, KeyValueStore, StoreError};
use crate::rendezvous::{Rendezvous, RendezvousParams};
use crate::room::{Room, RoomError};
use crate::signaling::{NostrRelay, SignalingError, SignalingTransport};

/// Top-level client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Peer connection error.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Relay error.
    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Room transport error.
    #[error("room error: {0}")]
    Room(#[from] RoomError),

    /// Sync engine error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Persistence error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Membership in one room.
#[derive(Debug)]
pub struct Session {
    room_id: String,
    room: Room,
    engine: SyncEngine,
    rendezvous: Rendezvous,
}

impl Session {
    /// Open a relay connection for every URL.
    pub fn connect_relays(urls: &[String]) -> Result<Vec<Arc<dyn SignalingTransport>>, ClientError> {
        urls.iter()
            .map(|url| {
                let relay = NostrRelay::connect(url.as_str())?;
                Ok(Arc::new(relay) as Arc<dyn SignalingTransport>)
            })
            .collect()
    }

    /// Join `room_id` and start syncing.
    pub async fn join(
        config: &RoomConfig,
        room_id: &str,
        factory: Arc<dyn PeerFactory>,
        relays: Vec<Arc<dyn SignalingTransport>>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, ClientError> {
        let self_id = load_or_create_peer_id(&*store).await?;
        let key = derive_key(config, room_id).await?;
        let topics = RoomTopics::derive(&config.app_id, room_id, &self_id);

        let room = Room::new(self_id.clone(), config.transport.clone());
        let engine = SyncEngine::start(&room, store, config.engine.clone()).await?;
        let rendezvous = Rendezvous::start(RendezvousParams {
            self_id: self_id.clone(),
            topics,
            key,
            factory,
            relays,
            config: config.rendezvous.clone(),
            low_water_mark: config.transport.low_water_mark,
            sink: Arc::new(room.clone()),
        });

        info!("joined room {} as {}", room_id, self_id);
        Ok(Self {
            room_id: room_id.to_string(),
            room,
            engine,
            rendezvous,
        })
    }

    /// Room id this session joined.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// This peer's id.
    pub fn self_id(&self) -> &PeerId {
        self.room.self_id()
    }

    /// The sync engine.
    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// The room transport, for custom actions.
    pub fn room(&self) -> &Room {
        &self.room
    }

    /// Peer discovery for this room.
    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    /// Stop discovery, say goodbye to every peer and persist.
    pub async fn leave(self) {
        self.rendezvous.stop().await;
        self.room.leave().await;
        self.engine.shutdown().await;
        info!("left room {}", self.room_id);
    }
}

async fn derive_key(config: &RoomConfig, room_id: &str) -> Result<RoomKey, CryptoError> {
    let app_id = config.app_id.clone();
    let room_id = room_id.to_string();
    let password = config.password.clone();
    let params = config.kdf;

    // Argon2 blocks for the whole derivation.
    tokio::task::spawn_blocking(move || RoomKey::derive(&app_id, &room_id, &password, params))
        .await
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?
}
