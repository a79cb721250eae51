//! Configuration loading for tower-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`). Missing
//! sections and fields fall back to their defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for tower-relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket bind address (default: 127.0.0.1:7447).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Connections served at once; further accepts wait (default: 1024).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Events one connection may publish per minute (default: 120).
    #[serde(default = "default_publishes_per_minute")]
    pub publishes_per_minute: u32,
    /// Open subscriptions per connection (default: 32).
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
    /// Largest accepted frame in bytes (default: 64 KiB).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Smallest retry-after hint sent to rate-limited clients, in seconds (default: 5).
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1:7447".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_publishes_per_minute() -> u32 {
    120
}

fn default_max_subscriptions() -> usize {
    32
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KiB
}

fn default_retry_after_secs() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            publishes_per_minute: default_publishes_per_minute(),
            max_subscriptions: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
            retry_after_secs: default_retry_after_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
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
