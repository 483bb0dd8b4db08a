//! Encryption service for sealkeep.
//!
//! Sealed secret payloads are produced and consumed exclusively through
//! [`Sealer`], which hides whether a value went to the remote transit
//! engine or to the local AES-256-GCM cipher.
//!
//! # Modules
//!
//! - [`crypto`]: local AES-256-GCM cipher (`ring`), random nonce per call.
//! - [`transit`]: remote transit backend trait and its HTTP client.
//! - [`sealer`]: marker-tagged sealing with lazy remote readiness check and fallback.
//! - [`error`]: unified error type.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sealkeep_vault::{Sealer, TransitSettings};
//!
//! # async fn example() -> sealkeep_vault::Result<()> {
//! let key = [0u8; 32];
//! let sealer = Sealer::from_settings(&key, &TransitSettings::default())?;
//!
//! let sealed = sealer.seal(b"hunter2").await?;
//! assert_eq!(sealer.open(&sealed).await?, b"hunter2");
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod sealer;
pub mod transit;

pub use crypto::{KEY_LEN, LocalCipher};
pub use error::{Result, VaultError};
pub use sealer::{Backend, LOCAL_MARKER, Sealer, TRANSIT_MARKER};
pub use transit::{TransitBackend, TransitClient, TransitSettings};
