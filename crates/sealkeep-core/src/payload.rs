//! Secret kinds and their typed payloads.
//!
//! A payload is serialized to JSON and sealed as a whole; only the
//! [`Sealer`](sealkeep_vault::Sealer) output ever reaches the database.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Closed set of secret kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    Password,
    ApiKey,
    AccessKey,
    SshKey,
    Certificate,
    Token,
    Custom,
}

impl SecretKind {
    pub const ALL: [SecretKind; 7] = [
        Self::Password,
        Self::ApiKey,
        Self::AccessKey,
        Self::SshKey,
        Self::Certificate,
        Self::Token,
        Self::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::ApiKey => "api_key",
            Self::AccessKey => "access_key",
            Self::SshKey => "ssh_key",
            Self::Certificate => "certificate",
            Self::Token => "token",
            Self::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plaintext secret material, one variant per [`SecretKind`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecretPayload {
    Password {
        username: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
    },
    ApiKey {
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_secret: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    AccessKey {
        access_key: String,
        secret_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
    SshKey {
        private_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    Certificate {
        certificate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chain: Option<String>,
    },
    Token {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
    },
    Custom {
        data: BTreeMap<String, String>,
    },
}

impl SecretPayload {
    pub fn kind(&self) -> SecretKind {
        match self {
            Self::Password { .. } => SecretKind::Password,
            Self::ApiKey { .. } => SecretKind::ApiKey,
            Self::AccessKey { .. } => SecretKind::AccessKey,
            Self::SshKey { .. } => SecretKind::SshKey,
            Self::Certificate { .. } => SecretKind::Certificate,
            Self::Token { .. } => SecretKind::Token,
            Self::Custom { .. } => SecretKind::Custom,
        }
    }

    /// Reject payloads whose required fields are blank.
    pub fn validate(&self) -> CoreResult<()> {
        let required: Vec<(&str, &str)> = match self {
            Self::Password {
                username, password, ..
            } => vec![("username", username.as_str()), ("password", password.as_str())],
            Self::ApiKey { api_key, .. } => vec![("api_key", api_key.as_str())],
            Self::AccessKey {
                access_key,
                secret_key,
                ..
            } => vec![
                ("access_key", access_key.as_str()),
                ("secret_key", secret_key.as_str()),
            ],
            Self::SshKey { private_key, .. } => vec![("private_key", private_key.as_str())],
            Self::Certificate { certificate, .. } => vec![("certificate", certificate.as_str())],
            Self::Token { token, .. } => vec![("token", token.as_str())],
            Self::Custom { data } => {
                if data.is_empty() {
                    return Err(CoreError::InvalidArgument(
                        "custom payload needs at least one entry".into(),
                    ));
                }
                Vec::new()
            }
        };
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(CoreError::InvalidArgument(format!(
                    "{} payload field {field} must not be empty",
                    self.kind()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an opened payload. Bytes that decrypt but do not parse are
    /// reported as a decryption failure.
    pub(crate) fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(bytes).map_err(|err| CoreError::DecryptionFailure {
            reason: format!(
                "opened payload is not a secret payload (line {}, column {})",
                err.line(),
                err.column()
            ),
        })
    }
}

impl fmt::Debug for SecretPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretPayload")
            .field("kind", &self.kind())
            .field("contents", &"<redacted>")
            .finish()
    }
}
