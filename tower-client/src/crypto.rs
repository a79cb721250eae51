//! Room key derivation and SDP sealing.
//!
//! Offers and answers travel through public relays, so every session
//! description is sealed with a key only room members can derive:
//!
//! - Argon2id over the room password, salted with the app and room ids
//! - XChaCha20-Poly1305 with random 192-bit nonces
//! - Sealed text is `base64(nonce):base64(ciphertext)`
//!
//! # Security Notes
//!
//! - XChaCha20 uses 192-bit nonces (24 bytes), safe for random generation
//! - The salt is public; the password is the only secret input
//! - Key material is zeroed on drop

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tower_types::SessionDescription;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Sealed text is not `nonce:ciphertext` in base64.
    #[error("malformed sealed text: {0}")]
    MalformedCiphertext(String),

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Decrypted text is not a session description.
    #[error("sealed payload is not a session description: {0}")]
    InvalidDescription(String),
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct Argon2Params {
    /// Memory cost in KiB.
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    /// Number of passes.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Degree of parallelism.
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

fn default_memory_kib() -> u32 {
    19 * 1024 // 19 MiB
}

fn default_iterations() -> u32 {
    2
}

fn default_parallelism() -> u32 {
    1
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
        }
    }
}

impl Argon2Params {
    /// The cheapest parameters argon2 accepts. Only for tests.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn to_argon2_params(self) -> Result<Params, CryptoError> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
    }
}

/// Symmetric key shared by everyone who knows the room password.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RoomKey([u8; KEY_SIZE]);

impl RoomKey {
    /// Derive the key for `room_id` under `app_id` from `password`.
    pub fn derive(
        app_id: &str,
        room_id: &str,
        password: &str,
        params: Argon2Params,
    ) -> Result<Self, CryptoError> {
        let salt = Sha256::digest(format!("tower-room-key-v1:{}:{}", app_id, room_id).as_bytes());
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2_params()?);

        let mut output = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(password.as_bytes(), &salt, &mut output)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        Ok(Self(output))
    }

    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, CryptoError> {
        XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// Encrypt `plaintext` into `base64(nonce):base64(ciphertext)`.
    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let ciphertext = self
            .cipher()?
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        Ok(format!(
            "{}:{}",
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext)
        ))
    }

    /// Decrypt text produced by [`RoomKey::seal`].
    pub fn open(&self, sealed: &str) -> Result<String, CryptoError> {
        let (nonce_b64, ct_b64) = sealed
            .split_once(':')
            .ok_or_else(|| CryptoError::MalformedCiphertext("missing separator".into()))?;

        let nonce = BASE64
            .decode(nonce_b64)
            .map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?;
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::MalformedCiphertext(format!(
                "nonce is {} bytes, expected {}",
                nonce.len(),
                NONCE_SIZE
            )));
        }
        let ciphertext = BASE64
            .decode(ct_b64)
            .map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?;

        let plaintext = self
            .cipher()?
            .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Seal a session description as JSON.
    pub fn seal_description(&self, desc: &SessionDescription) -> Result<String, CryptoError> {
        let json = serde_json::to_string(desc)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        self.seal(&json)
    }

    /// Open a sealed session description.
    pub fn open_description(&self, sealed: &str) -> Result<SessionDescription, CryptoError> {
        let json = self.open(sealed)?;
        serde_json::from_str(&json).map_err(|e| CryptoError::InvalidDescription(e.to_string()))
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoomKey([REDACTED])")
    }
}
