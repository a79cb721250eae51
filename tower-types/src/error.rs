//! Error types for tower wire data.

use thiserror::Error;

use crate::ElementKind;

/// Errors produced while encoding, decoding or validating wire data.
#[derive(Debug, Error)]
pub enum SyncError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Action name is empty, too long or not printable ASCII
    #[error("invalid action name: {0:?}")]
    InvalidActionName(String),

    /// An update addressed an element of a different shape
    #[error("element {id} is a {expected}, update is for a {got}")]
    KindMismatch {
        /// Element being updated.
        id: String,
        /// Kind of the stored element.
        expected: ElementKind,
        /// Kind named by the update.
        got: ElementKind,
    },

    /// Relay event id or signature does not check out
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Randomness or key handling failed
    #[error("crypto error: {0}")]
    Crypto(String),
}
