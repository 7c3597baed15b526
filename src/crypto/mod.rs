//! Value encryption for the connector cache.
//!
//! Cache entries are encrypted at rest with AES-GCM using the `ring`
//! library. Each encrypted value is a random 12-byte nonce followed by the
//! ciphertext and auth tag, armored as base64 so it can be stored in a TEXT
//! column.
//!
//! # Example
//!
//! ```rust
//! use tabwire::crypto::EncryptionKey;
//!
//! let key = EncryptionKey::new(b"0123456789abcdef").expect("16-byte key");
//! let ciphertext = key.encrypt(b"cached rows").expect("encryption failed");
//! let plaintext = key.decrypt(&ciphertext).expect("decryption failed");
//! assert_eq!(plaintext, b"cached rows");
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::aead::{Aad, Algorithm, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption operation failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// Decryption operation failed (wrong key or tampered data).
    #[error("decryption failed")]
    DecryptionFailed,

    /// The provided key is not 16, 24, or 32 bytes long.
    #[error("invalid key length: expected 16, 24, or 32 bytes")]
    InvalidKeyLength,

    /// The ciphertext is malformed or too short.
    #[error("invalid ciphertext")]
    InvalidCiphertext,
}

/// An AES-GCM key derived from caller-supplied key material.
///
/// The key must be exactly 16, 24, or 32 bytes, selecting a 128-, 192-, or
/// 256-bit cipher. `ring` exposes no AES-192-GCM, so 24-byte keys are
/// stretched to 256 bits with SHA-256; 16- and 32-byte keys are used as-is.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: Vec<u8>,
}

impl EncryptionKey {
    /// Validate the key material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] for any length other than
    /// 16, 24, or 32 bytes.
    pub fn new(raw: &[u8]) -> CryptoResult<Self> {
        let bytes = match raw.len() {
            16 | 32 => raw.to_vec(),
            24 => Sha256::digest(raw).to_vec(),
            _ => return Err(CryptoError::InvalidKeyLength),
        };
        Ok(Self { bytes })
    }

    fn algorithm(&self) -> &'static Algorithm {
        match self.bytes.len() {
            16 => &AES_128_GCM,
            _ => &AES_256_GCM,
        }
    }

    /// Encrypt plaintext, returning base64(nonce + ciphertext + tag).
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<String> {
        let rng = SystemRandom::new();

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let unbound = UnboundKey::new(self.algorithm(), &self.bytes)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let sealing_key = LessSafeKey::new(unbound);

        let mut in_out = plaintext.to_vec();
        sealing_key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut result = Vec::with_capacity(NONCE_LEN + in_out.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&in_out);

        Ok(BASE64.encode(&result))
    }

    /// Decrypt a base64-armored ciphertext produced by [`Self::encrypt`].
    pub fn decrypt(&self, armored: &str) -> CryptoResult<Vec<u8>> {
        let data = BASE64
            .decode(armored)
            .map_err(|_| CryptoError::InvalidCiphertext)?;

        // Minimum: nonce + tag.
        if data.len() < NONCE_LEN + self.algorithm().tag_len() {
            return Err(CryptoError::InvalidCiphertext);
        }

        let (nonce_bytes, encrypted) = data.split_at(NONCE_LEN);
        let nonce_array: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidCiphertext)?;
        let nonce = Nonce::assume_unique_for_key(nonce_array);

        let unbound = UnboundKey::new(self.algorithm(), &self.bytes)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let opening_key = LessSafeKey::new(unbound);

        let mut in_out = encrypted.to_vec();
        let plaintext = opening_key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(plaintext.to_vec())
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("EncryptionKey")
            .field("bits", &(self.bytes.len() * 8))
            .finish()
    }
}
