//! # sealkeep-store
//!
//! SQLite persistence for sealkeep.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Database (rusqlite WAL, spawn_blocking)  │
//! │  transaction() → IMMEDIATE, all-or-none   │
//! ├──────────────────────────────────────────┤
//! │  Migrations (versioned, transactional)    │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Domain crates own their SQL; this crate owns the connection, the schema,
//! and the error type they build on.
//!
//! ```ignore
//! use sealkeep_store::Database;
//!
//! let db = Database::open_and_migrate("data/sealkeep.db").await?;
//! let version = db.schema_version().await?;
//! ```

pub mod db;
pub mod error;
pub mod migration;

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use migration::LATEST_VERSION;
