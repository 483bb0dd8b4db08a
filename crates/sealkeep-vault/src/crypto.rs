//! Local AES-256-GCM backend built on `ring`.
//!
//! [`LocalCipher`] seals arbitrary bytes under a fixed 256-bit key held in
//! process configuration. Every call draws a fresh 96-bit nonce from the
//! system CSPRNG; the nonce is prepended to the ciphertext (which carries
//! the 128-bit GCM tag) and the whole buffer is base64-encoded:
//!
//! ```text
//! base64( nonce[12] || ciphertext || tag[16] )
//! ```
//!
//! Authentication covers the entire buffer, so a flipped bit anywhere makes
//! [`LocalCipher::open`] fail closed.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, VaultError};

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the GCM authentication tag appended by `ring`.
const TAG_LEN: usize = 16;

static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// Yields exactly one nonce, then errors. Binding a key to it guarantees the
/// key object can never be reused for a second message.
struct SingleNonce(Option<[u8; NONCE_LEN]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// LocalCipher
// ---------------------------------------------------------------------------

/// Symmetric fallback backend.
#[derive(Clone)]
pub struct LocalCipher {
    key: [u8; KEY_LEN],
    rng: SystemRandom,
}

impl std::fmt::Debug for LocalCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCipher").field("key", &"<redacted>").finish()
    }
}

impl LocalCipher {
    /// Build a cipher from raw key bytes.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidKey`] unless `key` is exactly [`KEY_LEN`] bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| VaultError::InvalidKey {
            reason: format!("key must be {KEY_LEN} bytes, got {}", key.len()),
        })?;
        Ok(Self {
            key,
            rng: SystemRandom::new(),
        })
    }

    /// Build a cipher with a freshly generated random key.
    pub fn generate() -> Result<Self> {
        let key = random_bytes(KEY_LEN)?;
        Self::new(&key)
    }

    /// Encrypt `plaintext`, returning `base64(nonce || ciphertext || tag)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| VaultError::EncryptionFailed {
                reason: "failed to generate random nonce".into(),
            })?;

        let unbound = UnboundKey::new(AEAD_ALG, &self.key).map_err(|_| {
            VaultError::EncryptionFailed {
                reason: "failed to create AES-256-GCM key".into(),
            }
        })?;
        let mut sealing_key = SealingKey::new(unbound, SingleNonce(Some(nonce)));

        let mut in_out = plaintext.to_vec();
        sealing_key
            .seal_in_place_append_tag(Aad::empty(), &mut in_out)
            .map_err(|_| VaultError::EncryptionFailed {
                reason: "seal_in_place failed".into(),
            })?;

        let mut framed = Vec::with_capacity(NONCE_LEN + in_out.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&in_out);

        tracing::trace!(
            plaintext_len = plaintext.len(),
            sealed_len = framed.len(),
            "sealed with local cipher"
        );

        Ok(BASE64.encode(framed))
    }

    /// Decrypt a value produced by [`LocalCipher::seal`].
    ///
    /// # Errors
    ///
    /// [`VaultError::DecryptionFailed`] if the value is not valid base64, is
    /// too short to hold a nonce and tag, or fails authentication.
    pub fn open(&self, encoded: &str) -> Result<Vec<u8>> {
        let framed = BASE64
            .decode(encoded.trim())
            .map_err(|e| VaultError::DecryptionFailed {
                reason: format!("invalid base64: {e}"),
            })?;

        if framed.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::DecryptionFailed {
                reason: format!("sealed value too short: {} bytes", framed.len()),
            });
        }

        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        let unbound = UnboundKey::new(AEAD_ALG, &self.key).map_err(|_| {
            VaultError::DecryptionFailed {
                reason: "failed to create AES-256-GCM key".into(),
            }
        })?;
        let mut opening_key = aead::OpeningKey::new(unbound, SingleNonce(Some(nonce)));

        let mut in_out = ciphertext.to_vec();
        let plaintext = opening_key
            .open_in_place(Aad::empty(), &mut in_out)
            .map_err(|_| VaultError::DecryptionFailed {
                reason: "authentication failed: wrong key or tampered data".into(),
            })?;

        Ok(plaintext.to_vec())
    }
}

/// Generate `len` cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "system CSPRNG failure".into(),
        })?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
