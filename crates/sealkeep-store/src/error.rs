//! Error types for the sealkeep-store crate.
//!
//! Every persistence call returns [`StoreError`] via [`StoreResult`].

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The SQLite driver reported a failure.
    #[error("database: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A JSON-encoded column did not round-trip.
    #[error("json column: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// A stored value could not be interpreted.
    #[error("corrupt {column} value: {value}")]
    Corrupt { column: &'static str, value: String },

    /// A blocking task was cancelled or panicked, or the connection mutex
    /// was poisoned.
    #[error("blocking database task: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl StoreError {
    /// Whether the error is a SQLite constraint violation (unique index,
    /// check constraint, foreign key or an `ABORT` trigger).
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
