//! Backend-agnostic sealing with automatic fallback.
//!
//! [`Sealer`] is the only type the rest of sealkeep talks to. It owns the
//! local cipher and, optionally, a remote [`TransitBackend`], and tags
//! every sealed value with the backend that produced it:
//!
//! ```text
//! transit:<service ciphertext>     sealed by the remote backend
//! aes256gcm:<base64 frame>         sealed by the local backend
//! <base64 frame>                   untagged legacy value, local backend
//! ```
//!
//! `open` routes on the tag alone, never on current configuration, so a
//! value stays readable whichever backend is configured later.
//!
//! The remote backend is health-checked once per `Sealer`, lazily, on first use.
//! If the check fails the remote stays disabled for the lifetime of the
//! `Sealer` and every seal goes to the local backend.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::crypto::LocalCipher;
use crate::error::{Result, VaultError};
use crate::transit::{TransitBackend, TransitClient, TransitSettings};

/// Tag prefix of values sealed by the remote backend.
pub const TRANSIT_MARKER: &str = "transit:";

/// Tag prefix of values sealed by the local backend.
pub const LOCAL_MARKER: &str = "aes256gcm:";

/// Which backend sealed (or would seal) a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Transit,
    Local,
}

impl Backend {
    /// Human-readable backend name for status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transit => "Vault Transit Engine",
            Self::Local => "AES-256-GCM",
        }
    }

    /// Identify the backend a sealed value belongs to.
    pub fn of(sealed: &str) -> Self {
        if sealed.starts_with(TRANSIT_MARKER) {
            Self::Transit
        } else {
            Self::Local
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Remote {
    backend: Arc<dyn TransitBackend>,
    ready: OnceCell<bool>,
}

/// Envelope encryption front door. Cheap to clone; clones share the
/// remote readiness result.
#[derive(Clone)]
pub struct Sealer {
    local: LocalCipher,
    remote: Option<Arc<Remote>>,
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer")
            .field("local", &self.local)
            .field("remote_configured", &self.remote.is_some())
            .finish()
    }
}

impl Sealer {
    /// A sealer that only ever uses the local backend.
    pub fn local_only(local: LocalCipher) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    /// A sealer that prefers `backend` and falls back to `local`.
    pub fn with_transit(local: LocalCipher, backend: Arc<dyn TransitBackend>) -> Self {
        Self {
            local,
            remote: Some(Arc::new(Remote {
                backend,
                ready: OnceCell::new(),
            })),
        }
    }

    /// Build from configuration: the HTTP transit client when enabled,
    /// local-only otherwise.
    ///
    /// A transit configuration that cannot even produce a client (bad
    /// address, unreadable CA file) is logged and treated as unavailable.
    pub fn from_settings(key: &[u8], transit: &TransitSettings) -> Result<Self> {
        let local = LocalCipher::new(key)?;
        if !transit.enabled {
            info!("transit backend disabled, using local AES-256-GCM");
            return Ok(Self::local_only(local));
        }
        match TransitClient::new(transit) {
            Ok(client) => Ok(Self::with_transit(local, Arc::new(client))),
            Err(err) => {
                warn!(%err, "transit backend misconfigured, using local AES-256-GCM");
                Ok(Self::local_only(local))
            }
        }
    }

    /// Seal `plaintext`.
    ///
    /// Prefers the remote backend; any remote failure is logged and the
    /// value is sealed locally instead. Only a local sealing failure is
    /// returned.
    pub async fn seal(&self, plaintext: &[u8]) -> Result<String> {
        if let Some(remote) = self.ready_remote().await {
            match remote.backend.encrypt(plaintext).await {
                Ok(ciphertext) => {
                    debug!(len = plaintext.len(), "sealed with transit backend");
                    return Ok(format!("{TRANSIT_MARKER}{ciphertext}"));
                }
                Err(err) => {
                    warn!(%err, "transit encrypt failed, falling back to local cipher");
                }
            }
        }

        let sealed = self.local.seal(plaintext)?;
        Ok(format!("{LOCAL_MARKER}{sealed}"))
    }

    /// Open a sealed value.
    ///
    /// # Errors
    ///
    /// Always [`VaultError::DecryptionFailed`]: corrupt or tampered input,
    /// the wrong local key, or a transit-sealed value while the remote
    /// backend is unavailable (there is no local path for foreign
    /// ciphertext).
    pub async fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        if let Some(ciphertext) = sealed.strip_prefix(TRANSIT_MARKER) {
            let Some(remote) = self.ready_remote().await else {
                return Err(VaultError::DecryptionFailed {
                    reason: "value was sealed by the transit backend, which is unavailable"
                        .into(),
                });
            };
            return remote
                .backend
                .decrypt(ciphertext)
                .await
                .map_err(|err| match err {
                    VaultError::DecryptionFailed { .. } => err,
                    other => VaultError::DecryptionFailed {
                        reason: other.to_string(),
                    },
                });
        }

        let body = sealed.strip_prefix(LOCAL_MARKER).unwrap_or(sealed);
        self.local.open(body)
    }

    /// Backend that the next `seal` will try first.
    pub async fn active_backend(&self) -> Backend {
        if self.ready_remote().await.is_some() {
            Backend::Transit
        } else {
            Backend::Local
        }
    }

    async fn ready_remote(&self) -> Option<&Remote> {
        let remote = self.remote.as_deref()?;
        let ready = remote
            .ready
            .get_or_init(|| async {
                match remote.backend.ensure_ready().await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(%err, "transit backend unavailable, sealing locally from now on");
                        false
                    }
                }
            })
            .await;
        (*ready).then_some(remote)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Reversible stand-in for a transit service.
    #[derive(Default)]
    struct FakeTransit {
        checks: AtomicUsize,
        refuse_check: bool,
        failing: AtomicBool,
    }

    #[async_trait]
    impl TransitBackend for FakeTransit {
        async fn ensure_ready(&self) -> Result<()> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.refuse_check {
                return Err(VaultError::BackendUnavailable {
                    reason: "sealed".into(),
                });
            }
            Ok(())
        }

        async fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(VaultError::BackendUnavailable {
                    reason: "timeout".into(),
                });
            }
            let hex: String = plaintext.iter().map(|b| format!("{b:02x}")).collect();
            Ok(format!("vault:v1:{hex}"))
        }

        async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(VaultError::BackendUnavailable {
                    reason: "timeout".into(),
                });
            }
            let hex = ciphertext.strip_prefix("vault:v1:").unwrap_or_default();
            (0..hex.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| VaultError::DecryptionFailed {
                    reason: e.to_string(),
                })
        }
    }

    fn local() -> LocalCipher {
        LocalCipher::new(&[9u8; crate::crypto::KEY_LEN]).unwrap()
    }

    #[tokio::test]
    async fn local_only_roundtrip_is_tagged() {
        let sealer = Sealer::local_only(local());
        let sealed = sealer.seal(b"p@ss").await.unwrap();
        assert!(sealed.starts_with(LOCAL_MARKER));
        assert_eq!(sealer.open(&sealed).await.unwrap(), b"p@ss");
        assert_eq!(sealer.active_backend().await, Backend::Local);
    }

    #[tokio::test]
    async fn transit_roundtrip_is_tagged() {
        let sealer = Sealer::with_transit(local(), Arc::new(FakeTransit::default()));
        let sealed = sealer.seal(b"token").await.unwrap();
        assert!(sealed.starts_with(TRANSIT_MARKER));
        assert_eq!(Backend::of(&sealed), Backend::Transit);
        assert_eq!(sealer.open(&sealed).await.unwrap(), b"token");
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_local() {
        let fake = Arc::new(FakeTransit::default());
        fake.failing.store(true, Ordering::SeqCst);
        let sealer = Sealer::with_transit(local(), fake);

        let sealed = sealer.seal(b"fallback").await.unwrap();
        assert!(sealed.starts_with(LOCAL_MARKER));
        assert_eq!(sealer.open(&sealed).await.unwrap(), b"fallback");
    }

    #[tokio::test]
    async fn readiness_check_runs_once_even_when_it_fails() {
        let fake = Arc::new(FakeTransit {
            refuse_check: true,
            ..FakeTransit::default()
        });
        let sealer = Sealer::with_transit(local(), fake.clone());

        for _ in 0..3 {
            let sealed = sealer.clone().seal(b"x").await.unwrap();
            assert!(sealed.starts_with(LOCAL_MARKER));
        }
        assert_eq!(fake.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transit_value_without_remote_fails_loudly() {
        let with_remote = Sealer::with_transit(local(), Arc::new(FakeTransit::default()));
        let sealed = with_remote.seal(b"foreign").await.unwrap();

        let local_only = Sealer::local_only(local());
        assert!(matches!(
            local_only.open(&sealed).await,
            Err(VaultError::DecryptionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn transit_decrypt_outage_maps_to_decryption_failure() {
        let fake = Arc::new(FakeTransit::default());
        let sealer = Sealer::with_transit(local(), fake.clone());
        let sealed = sealer.seal(b"v").await.unwrap();

        fake.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            sealer.open(&sealed).await,
            Err(VaultError::DecryptionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn untagged_legacy_values_open_locally() {
        let cipher = local();
        let legacy = cipher.seal(b"old").unwrap();
        let sealer = Sealer::with_transit(cipher, Arc::new(FakeTransit::default()));
        assert_eq!(sealer.open(&legacy).await.unwrap(), b"old");
    }

    #[test]
    fn disabled_settings_build_local_only() {
        let sealer =
            Sealer::from_settings(&[1u8; crate::crypto::KEY_LEN], &TransitSettings::default())
                .unwrap();
        assert!(sealer.remote.is_none());
    }

    #[test]
    fn short_key_rejected_from_settings() {
        assert!(matches!(
            Sealer::from_settings(b"short", &TransitSettings::default()),
            Err(VaultError::InvalidKey { .. })
        ));
    }
}
