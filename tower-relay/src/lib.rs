//! # tower-relay
//!
//! Development relay for tower rendezvous.
//!
//! A small publish/subscribe server speaking the signed-event protocol from
//! `tower_types::relay` over WebSockets:
//! - `REQ` opens a topic subscription, answered with `EOSE` (nothing is stored)
//! - `EVENT` publishes; the relay verifies id and signature, rate limits per
//!   connection and fans the event out to matching subscriptions
//! - `CLOSE` ends a subscription
//!
//! Rate-limited publishes are refused with an `OK` carrying
//! `retry-after=<secs>`, which clients adopt as their announcement interval.
//!
//! Peers only ever publish sealed connection-setup messages here; document
//! data never passes through the relay.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod limits;
pub mod server;

pub use config::{Config, ConfigError, LimitsConfig, ServerConfig};
pub use error::{RelayError, Result};
pub use limits::{RateLimitError, RateLimits};
pub use server::{Relay, RelayStats};
