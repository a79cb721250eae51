//! # tower-client
//!
//! Peer-to-peer rooms and whiteboard sync for tower.
//!
//! Peers find each other through public relays, connect directly over
//! WebRTC data channels, and keep a shared operation log in sync.
//!
//! ## Features
//!
//! - **Sealed rendezvous**: SDP is encrypted with a room key (Argon2id from the
//!   room password, XChaCha20-Poly1305) before it touches a relay
//! - **Chunked actions**: named, typed messages framed into 16 KiB chunks with
//!   back-pressure per peer
//! - **Convergent history**: order-independent log merge, checkpoint voting
//!   and compaction
//! - **Pluggable edges**: peer backends, relays and stores are traits, with
//!   in-memory doubles for tests
//!
//! ## Example
//!
//! ```ignore
//! use tower_client::{RoomConfig, Session, MemoryStore};
//!
//! let config = RoomConfig::from_file("tower.toml".as_ref())?;
//! let relays = Session::connect_relays(&config.relays)?;
//! let session = Session::join(&config, "sketches", factory, relays, Arc::new(MemoryStore::new())).await?;
//!
//! let mut document = session.engine().subscribe();
//! while document.changed().await.is_ok() {
//!     render(&document.borrow());
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod persistence;
pub mod rendezvous;
pub mod room;
pub mod session;
pub mod signaling;

pub use channel::{
    ChannelError, ChannelEvent, ConnectionChannel, MockNetwork, PeerBackend, PeerFactory,
};
pub use config::{ConfigError, EngineConfig, RendezvousConfig, RoomConfig, TransportConfig};
pub use crypto::{Argon2Params, CryptoError, RoomKey, KEY_SIZE, NONCE_SIZE};
pub use engine::{EngineError, SyncEngine};
pub use persistence::{FileStore, KeyValueStore, MemoryStore, StoreError, StoredBoard};
pub use rendezvous::{NegotiatedPeer, PeerSink, Rendezvous, RendezvousParams};
pub use room::{ActionReceiver, ActionSender, Room, RoomError, RoomEvent, Target};
pub use session::{ClientError, Session};
pub use signaling::{MemoryHub, MemoryRelay, NostrRelay, SignalingError, SignalingTransport};
