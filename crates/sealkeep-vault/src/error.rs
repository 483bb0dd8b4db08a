//! Encryption service error types.
//!
//! [`VaultError`] is returned by every public API in this crate. Callers
//! that only care whether a read can proceed can match on
//! [`VaultError::DecryptionFailed`], the sole variant `Sealer::open`
//! produces.

/// Unified error type for the encryption service.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Crypto errors ------------------------------------------------------
    /// Sealing failed (CSPRNG or `ring` internal failure).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// The sealed value is corrupt, was tampered with, was sealed under a
    /// different key, or cannot be routed to a working backend.
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// The local key has the wrong length.
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    // -- Transit errors -----------------------------------------------------
    /// The remote transit backend could not be reached or refused the call.
    #[error("transit backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// The transit backend configuration is unusable (bad address, CA file).
    #[error("invalid transit configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;
