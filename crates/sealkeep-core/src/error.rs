//! Error taxonomy for the vault core.
//!
//! Every public operation returns [`CoreError`] via [`CoreResult`]. Transit
//! backend outages never appear here: the encryption service recovers from
//! them locally, and the only cryptographic failure a caller sees is
//! [`CoreError::DecryptionFailure`].

use sealkeep_store::StoreError;
use sealkeep_vault::VaultError;
use thiserror::Error;

/// Alias for `Result<T, CoreError>`.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing secret, version, grant, rule or role edge.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Policy denied the operation, or the requester holds no valid grant.
    /// Never carries payload data.
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    /// A state-machine transition was attempted from a non-source state.
    #[error("cannot {action} {entity} {id} in state {status}")]
    InvalidState {
        entity: &'static str,
        id: String,
        status: String,
        action: &'static str,
    },

    /// Duplicate open grant, duplicate rule, or duplicate role edge.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// Sealed payload is corrupt, tampered, sealed under another key, or
    /// belongs to a backend that is not available.
    #[error("decryption failed: {reason}")]
    DecryptionFailure { reason: String },

    /// Local sealing failed; no fallback remains.
    #[error("encryption failed: {0}")]
    Encryption(VaultError),

    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<VaultError> for CoreError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::DecryptionFailed { reason } => Self::DecryptionFailure { reason },
            other => Self::Encryption(other),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(err))
    }
}

impl CoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    pub(crate) fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }
}
