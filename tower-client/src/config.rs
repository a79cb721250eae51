//! Room configuration.
//!
//! Loaded from a TOML file (default: `tower.toml`). Every field has a
//! default, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::Argon2Params;

/// Application id every room topic and key is scoped under.
pub const DEFAULT_APP_ID: &str = "tower.qttn.dev";

/// Root configuration for joining rooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Application namespace for topics and keys.
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// Room password. Empty means the room is only as private as its id.
    #[serde(default)]
    pub password: String,
    /// Relay URLs used for rendezvous.
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
    /// STUN/TURN server URLs handed to peer connections.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    /// Rendezvous settings.
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
    /// Room transport settings.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Sync engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Room key derivation cost.
    #[serde(default)]
    pub kdf: Argon2Params,
}

/// Rendezvous settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// Pre-generated offers kept ready (default: 10).
    #[serde(default = "default_offer_pool_size")]
    pub offer_pool_size: usize,
    /// Announcement interval in milliseconds (default: 5333).
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    /// Seconds an unanswered offer stays pending (default: 20).
    #[serde(default = "default_offer_ttl_secs")]
    pub offer_ttl_secs: u64,
    /// Maximum wait for ICE gathering in milliseconds (default: 5000).
    #[serde(default = "default_ice_timeout_ms")]
    pub ice_timeout_ms: u64,
}

/// Room transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Buffered bytes above which sends wait for drain (default: 64 KiB).
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: usize,
    /// Delay between announcing leave and disconnecting, in ms (default: 99).
    #[serde(default = "default_leave_grace_ms")]
    pub leave_grace_ms: u64,
    /// Largest reassembled message accepted from a peer (default: 64 MiB).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Sync engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between checkpoint checks (default: 60).
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    /// Log length that must be exceeded before proposing (default: 100).
    #[serde(default = "default_checkpoint_threshold")]
    pub checkpoint_threshold: usize,
    /// Entries kept after compaction (default: 100).
    #[serde(default = "default_retained_entries")]
    pub retained_entries: usize,
    /// Checkpoint vote sets remembered at once (default: 8).
    #[serde(default = "default_max_tracked_checkpoints")]
    pub max_tracked_checkpoints: usize,
}

// Default value functions
fn default_app_id() -> String {
    DEFAULT_APP_ID.to_string()
}

fn default_relays() -> Vec<String> {
    vec!["ws://127.0.0.1:7447".to_string()]
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.cloudflare.com:3478".to_string()]
}

fn default_offer_pool_size() -> usize {
    10
}

fn default_announce_interval_ms() -> u64 {
    5333
}

fn default_offer_ttl_secs() -> u64 {
    20
}

fn default_ice_timeout_ms() -> u64 {
    5000
}

fn default_low_water_mark() -> usize {
    64 * 1024 // 64 KiB
}

fn default_leave_grace_ms() -> u64 {
    99
}

fn default_max_message_size() -> usize {
    tower_core::frame::DEFAULT_MAX_MESSAGE_SIZE
}

fn default_checkpoint_interval_secs() -> u64 {
    60
}

fn default_checkpoint_threshold() -> usize {
    100
}

fn default_retained_entries() -> usize {
    100
}

fn default_max_tracked_checkpoints() -> usize {
    8
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            password: String::new(),
            relays: default_relays(),
            ice_servers: default_ice_servers(),
            rendezvous: RendezvousConfig::default(),
            transport: TransportConfig::default(),
            engine: EngineConfig::default(),
            kdf: Argon2Params::default(),
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            offer_pool_size: default_offer_pool_size(),
            announce_interval_ms: default_announce_interval_ms(),
            offer_ttl_secs: default_offer_ttl_secs(),
            ice_timeout_ms: default_ice_timeout_ms(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            low_water_mark: default_low_water_mark(),
            leave_grace_ms: default_leave_grace_ms(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            checkpoint_threshold: default_checkpoint_threshold(),
            retained_entries: default_retained_entries(),
            max_tracked_checkpoints: default_max_tracked_checkpoints(),
        }
    }
}

impl RendezvousConfig {
    /// Announcement interval.
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    /// Pending offer lifetime.
    pub fn offer_ttl(&self) -> Duration {
        Duration::from_secs(self.offer_ttl_secs)
    }

    /// ICE gathering timeout.
    pub fn ice_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_timeout_ms)
    }
}

impl TransportConfig {
    /// Grace period after broadcasting leave.
    pub fn leave_grace(&self) -> Duration {
        Duration::from_millis(self.leave_grace_ms)
    }
}

impl EngineConfig {
    /// Checkpoint timer period.
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

impl RoomConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
