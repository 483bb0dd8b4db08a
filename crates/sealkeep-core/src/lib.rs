//! # sealkeep-core
//!
//! Secrets vault services: role-based policy, sealed secret records with
//! an append-only version history, and a time-boxed access grant workflow.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  SecretStore ──── GrantWorkflow ──── Notifier            │
//! │      │   │              │                                │
//! │      │   └── VersionHistory                              │
//! │      │              │                                    │
//! │  PolicyEngine (role graph, wildcard rules, super role)   │
//! ├──────────────────────────────────────────────────────────┤
//! │  Sealer (transit, local AES-256-GCM fallback)            │
//! │  Database (rusqlite WAL, migrations)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │  Sweeper: grant expiry, secret expiry, inbox cleanup     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use sealkeep_core::{NewSecret, Requester, SealkeepConfig, Sealkeep, SecretPayload};
//!
//! let vault = Sealkeep::open(SealkeepConfig::load("config/sealkeep.toml")?).await?;
//! let owner = Requester::new("mia", "sec_mgr");
//! let secret = vault
//!     .secrets
//!     .create(&owner, NewSecret::new("db-prod", SecretPayload::Password {
//!         username: "app".into(),
//!         password: "hunter2".into(),
//!         address: None,
//!         notes: None,
//!     }))
//!     .await?;
//! ```
//!
//! All timestamps are Unix epoch milliseconds.

pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod expiry;
pub mod grants;
pub mod notify;
pub mod payload;
pub mod policy;
pub mod secrets;
pub mod sweeper;
pub mod versions;

pub use audit::{AuditAction, AuditEvent, AuditQuery, AuditRecord, AuditSink, SqliteAuditLog};
pub use config::SealkeepConfig;
pub use context::Sealkeep;
pub use error::{CoreError, CoreResult};
pub use expiry::{ExpiryReport, ExpiryWatch};
pub use grants::{AccessGrant, GrantFilter, GrantStatus, GrantWorkflow};
pub use notify::{
    Delivery, DeliveryError, InboxEntry, InboxNotifier, LogNotifier, Notification,
    NotificationKind, Notified, Notifier, Recipient,
};
pub use payload::{SecretKind, SecretPayload};
pub use policy::{MenuItem, Permission, PolicyEngine, PolicyRule, Requester, RoleEdge};
pub use secrets::{
    AccessVia, NewSecret, RevealedSecret, SecretFilter, SecretRecord, SecretStore, SecretSummary,
    SecretUpdate,
};
pub use sweeper::{SweepReport, Sweeper, SweeperHandle};
pub use versions::{ChangeKind, FieldChange, SecretVersion, VersionDiff, VersionHistory};

/// Current time in Unix epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
