//! Runtime configuration.
//!
//! Loaded from a TOML file, then overridden by `SEALKEEP_*` environment
//! variables. Every section and field has a default, so an empty file (or
//! no file at all) yields a usable development configuration once an
//! encryption key is supplied.
//!
//! ```toml
//! [database]
//! path = "data/sealkeep.db"
//!
//! [security]
//! encryption_key = "0123456789abcdef0123456789abcdef"
//!
//! [security.transit]
//! enabled = true
//! address = "https://vault.internal:8200"
//! key_name = "sealkeep"
//!
//! [sweeps]
//! grant_expiry_secs = 3600
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use sealkeep_vault::{KEY_LEN, TransitSettings};
use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "SEALKEEP_";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SealkeepConfig {
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub policy: PolicyConfig,
    pub sweeps: SweepConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/sealkeep.db"),
        }
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Raw local AES-256 key; must be exactly 32 bytes.
    pub encryption_key: String,
    pub transit: TransitSettings,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("encryption_key", &"<redacted>")
            .field("transit", &self.transit)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Role that passes every check regardless of stored rules.
    pub super_role: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            super_role: "super_admin".into(),
        }
    }
}

/// Periods of the background sweeps, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub grant_expiry_secs: u64,
    pub secret_expiry_secs: u64,
    pub notification_cleanup_secs: u64,
    /// How far ahead of expiry owners are warned.
    pub expiry_warning_days: u32,
    /// Read notifications older than this are purged.
    pub notification_retention_days: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            grant_expiry_secs: 3_600,
            secret_expiry_secs: 6 * 3_600,
            notification_cleanup_secs: 24 * 3_600,
            expiry_warning_days: 7,
            notification_retention_days: 30,
        }
    }
}

impl SweepConfig {
    pub fn grant_expiry_period(&self) -> Duration {
        Duration::from_secs(self.grant_expiry_secs.max(1))
    }

    pub fn secret_expiry_period(&self) -> Duration {
        Duration::from_secs(self.secret_expiry_secs.max(1))
    }

    pub fn notification_cleanup_period(&self) -> Duration {
        Duration::from_secs(self.notification_cleanup_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl SealkeepConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> CoreResult<Self> {
        toml::from_str(text).map_err(|e| CoreError::Config(format!("invalid TOML: {e}")))
    }

    /// Load `path` (a missing file means defaults), apply process
    /// environment overrides, and validate.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(CoreError::Config(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `SEALKEEP_*` overrides obtained through `lookup`.
    ///
    /// Empty values are ignored; unparsable numbers and booleans are
    /// ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |suffix: &str| {
            lookup(&format!("{ENV_PREFIX}{suffix}")).filter(|v| !v.trim().is_empty())
        };

        if let Some(v) = get("DATABASE_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = get("ENCRYPTION_KEY") {
            self.security.encryption_key = v;
        }
        if let Some(v) = get("SUPER_ROLE") {
            self.policy.super_role = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }

        let transit = &mut self.security.transit;
        if let Some(v) = get("TRANSIT_ENABLED") {
            set_parsed(&mut transit.enabled, "TRANSIT_ENABLED", &v, parse_bool);
        }
        if let Some(v) = get("TRANSIT_ADDRESS") {
            transit.address = v;
        }
        if let Some(v) = get("TRANSIT_TOKEN") {
            transit.token = v;
        }
        if let Some(v) = get("TRANSIT_KEY_NAME") {
            transit.key_name = v;
        }
        if let Some(v) = get("TRANSIT_MOUNT_PATH") {
            transit.mount_path = v;
        }
        if let Some(v) = get("TRANSIT_NAMESPACE") {
            transit.namespace = Some(v);
        }
        if let Some(v) = get("TRANSIT_TIMEOUT_SECS") {
            set_parsed(&mut transit.timeout_secs, "TRANSIT_TIMEOUT_SECS", &v, |s| {
                s.parse().ok()
            });
        }
        if let Some(v) = get("TRANSIT_TLS_INSECURE") {
            set_parsed(&mut transit.tls_insecure, "TRANSIT_TLS_INSECURE", &v, parse_bool);
        }
        if let Some(v) = get("TRANSIT_CA_CERT") {
            transit.ca_cert = Some(PathBuf::from(v));
        }
    }

    /// Reject configurations the services cannot start with.
    pub fn validate(&self) -> CoreResult<()> {
        let key_len = self.security.encryption_key.len();
        if key_len != KEY_LEN {
            return Err(CoreError::Config(format!(
                "security.encryption_key must be exactly {KEY_LEN} bytes, got {key_len}"
            )));
        }
        let transit = &self.security.transit;
        if transit.enabled {
            if transit.address.trim().is_empty() {
                return Err(CoreError::Config(
                    "security.transit.address is required when transit is enabled".into(),
                ));
            }
            if transit.key_name.trim().is_empty() {
                return Err(CoreError::Config(
                    "security.transit.key_name is required when transit is enabled".into(),
                ));
            }
        }
        if self.policy.super_role.trim().is_empty() {
            return Err(CoreError::Config("policy.super_role must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn set_parsed<T>(slot: &mut T, name: &str, raw: &str, parse: impl Fn(&str) -> Option<T>) {
    match parse(raw) {
        Some(value) => *slot = value,
        None => tracing::warn!(var = %format!("{ENV_PREFIX}{name}"), value = raw, "ignoring unparsable override"),
    }
}
