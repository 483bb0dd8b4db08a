//! Remote transit backend.
//!
//! [`TransitBackend`] is the seam between the [`Sealer`](crate::Sealer) and
//! a key-custody service that encrypts and decrypts with a key it never
//! releases. [`TransitClient`] implements it over HTTP against a
//! HashiCorp-Vault-compatible transit engine:
//!
//! | Call            | Endpoint                               |
//! |-----------------|----------------------------------------|
//! | health          | `GET  v1/sys/health`                   |
//! | mount lookup    | `GET  v1/sys/mounts`                   |
//! | key lookup      | `GET  v1/{mount}/keys/{key}`           |
//! | key creation    | `POST v1/{mount}/keys/{key}`           |
//! | encrypt         | `POST v1/{mount}/encrypt/{key}`        |
//! | decrypt         | `POST v1/{mount}/decrypt/{key}`        |
//!
//! Every request carries the `X-Vault-Token` header (and
//! `X-Vault-Namespace` when configured) and is bounded by the configured
//! timeout.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::error::{Result, VaultError};

/// Key type requested when the transit key has to be created.
const KEY_TYPE: &str = "aes256-gcm96";

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A remote encryption service that custodies its own key.
#[async_trait]
pub trait TransitBackend: Send + Sync {
    /// Verify the service is reachable and ready, provisioning the key if
    /// it does not exist yet.
    async fn ensure_ready(&self) -> Result<()>;

    /// Encrypt `plaintext`, returning the service's opaque ciphertext.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<String>;

    /// Decrypt a ciphertext previously returned by [`TransitBackend::encrypt`].
    async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Connection settings for the transit engine.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TransitSettings {
    /// Whether the remote backend should be used at all.
    pub enabled: bool,
    /// Base URL of the service, e.g. `https://vault.internal:8200`.
    pub address: String,
    /// Access token sent as `X-Vault-Token`.
    pub token: String,
    /// Name of the transit key.
    pub key_name: String,
    /// Mount path of the transit engine.
    pub mount_path: String,
    /// Optional enterprise namespace.
    pub namespace: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Skip certificate verification. Never enable outside development.
    pub tls_insecure: bool,
    /// Extra PEM or DER root certificate to trust.
    pub ca_cert: Option<PathBuf>,
}

impl Default for TransitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            token: String::new(),
            key_name: "sealkeep".into(),
            mount_path: "transit".into(),
            namespace: None,
            timeout_secs: 5,
            tls_insecure: false,
            ca_cert: None,
        }
    }
}

impl std::fmt::Debug for TransitSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitSettings")
            .field("enabled", &self.enabled)
            .field("address", &self.address)
            .field("token", &"<redacted>")
            .field("key_name", &self.key_name)
            .field("mount_path", &self.mount_path)
            .field("namespace", &self.namespace)
            .field("timeout_secs", &self.timeout_secs)
            .field("tls_insecure", &self.tls_insecure)
            .field("ca_cert", &self.ca_cert)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// HTTP implementation of [`TransitBackend`].
pub struct TransitClient {
    base: Url,
    token: String,
    namespace: Option<String>,
    mount: String,
    key_name: String,
    http: Client,
}

impl TransitClient {
    /// Build a client from settings. Performs no network I/O.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidConfig`] if the address does not parse, the key
    /// name is empty, or the CA certificate cannot be read.
    pub fn new(settings: &TransitSettings) -> Result<Self> {
        let invalid = |reason: String| VaultError::InvalidConfig { reason };

        if settings.key_name.trim().is_empty() {
            return Err(invalid("transit key name is empty".into()));
        }

        // A trailing slash makes `Url::join` append rather than replace.
        let mut address = settings.address.trim().to_string();
        if !address.ends_with('/') {
            address.push('/');
        }
        let base = Url::parse(&address)
            .map_err(|e| invalid(format!("bad transit address {:?}: {e}", settings.address)))?;

        let timeout = Duration::from_secs(settings.timeout_secs.max(1));
        let mut builder = Client::builder().timeout(timeout);
        if let Some(path) = &settings.ca_cert {
            let raw = std::fs::read(path)
                .map_err(|e| invalid(format!("cannot read CA cert {}: {e}", path.display())))?;
            let cert = reqwest::Certificate::from_pem(&raw)
                .or_else(|_| reqwest::Certificate::from_der(&raw))
                .map_err(|e| invalid(format!("cannot parse CA cert: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if settings.tls_insecure {
            tracing::warn!("transit TLS verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| invalid(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            base,
            token: settings.token.clone(),
            namespace: settings.namespace.clone().filter(|ns| !ns.is_empty()),
            mount: settings.mount_path.trim_matches('/').to_string(),
            key_name: settings.key_name.trim().to_string(),
            http,
        })
    }

    /// Resolve an API path against the configured address.
    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| VaultError::InvalidConfig {
                reason: format!("bad transit path {path:?}: {e}"),
            })
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value)> {
        let url = self.endpoint(path)?;
        let mut request = self
            .http
            .request(method, url)
            .header("X-Vault-Token", &self.token);
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| VaultError::BackendUnavailable {
            reason: format!("request to {path} failed: {e}"),
        })?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| VaultError::BackendUnavailable {
                reason: format!("reading {path} response ({status}) failed: {e}"),
            })?;
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, value))
    }

    async fn call_ok(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let (status, value) = self.call(method, path, body).await?;
        if !status.is_success() {
            return Err(VaultError::BackendUnavailable {
                reason: format!("{path} returned {status}: {}", describe_errors(&value)),
            });
        }
        Ok(value)
    }

    async fn check_health(&self) -> Result<()> {
        // sys/health answers non-2xx for sealed or standby nodes, so inspect
        // the body rather than the status.
        let (_, health) = self.call(Method::GET, "v1/sys/health", None).await?;
        if !health.get("initialized").and_then(Value::as_bool).unwrap_or(false) {
            return Err(VaultError::BackendUnavailable {
                reason: "transit server is not initialized".into(),
            });
        }
        if health.get("sealed").and_then(Value::as_bool).unwrap_or(true) {
            return Err(VaultError::BackendUnavailable {
                reason: "transit server is sealed".into(),
            });
        }
        Ok(())
    }

    async fn check_mount(&self) -> Result<()> {
        let mounts = self.call_ok(Method::GET, "v1/sys/mounts", None).await?;
        if !mount_listed(&mounts, &self.mount) {
            return Err(VaultError::BackendUnavailable {
                reason: format!("transit engine not mounted at {}/", self.mount),
            });
        }
        Ok(())
    }

    async fn ensure_key(&self) -> Result<()> {
        let path = format!("v1/{}/keys/{}", self.mount, self.key_name);
        let (status, value) = self.call(Method::GET, &path, None).await?;
        if status.is_success() {
            return Ok(());
        }
        if status != StatusCode::NOT_FOUND {
            return Err(VaultError::BackendUnavailable {
                reason: format!("key lookup returned {status}: {}", describe_errors(&value)),
            });
        }

        tracing::info!(key = %self.key_name, mount = %self.mount, "creating transit key");
        self.call_ok(Method::POST, &path, Some(json!({ "type": KEY_TYPE })))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TransitBackend for TransitClient {
    async fn ensure_ready(&self) -> Result<()> {
        self.check_health().await?;
        self.check_mount().await?;
        self.ensure_key().await?;
        tracing::info!(base = %self.base, key = %self.key_name, "transit backend ready");
        Ok(())
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let path = format!("v1/{}/encrypt/{}", self.mount, self.key_name);
        let body = json!({ "plaintext": BASE64.encode(plaintext) });
        let response = self.call_ok(Method::POST, &path, Some(body)).await?;
        data_field(&response, "ciphertext")
            .map(str::to_owned)
            .ok_or_else(|| VaultError::BackendUnavailable {
                reason: "encrypt response missing ciphertext".into(),
            })
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>> {
        let path = format!("v1/{}/decrypt/{}", self.mount, self.key_name);
        let body = json!({ "ciphertext": ciphertext });
        let response = self.call_ok(Method::POST, &path, Some(body)).await?;
        let encoded = data_field(&response, "plaintext").ok_or_else(|| {
            VaultError::DecryptionFailed {
                reason: "decrypt response missing plaintext".into(),
            }
        })?;
        BASE64
            .decode(encoded)
            .map_err(|e| VaultError::DecryptionFailed {
                reason: format!("transit plaintext is not base64: {e}"),
            })
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn data_field<'a>(response: &'a Value, field: &str) -> Option<&'a str> {
    response.get("data")?.get(field)?.as_str()
}

fn mount_listed(mounts: &Value, mount: &str) -> bool {
    let key = format!("{mount}/");
    // Newer servers nest mounts under `data`; older ones list them at the top.
    mounts.get(&key).is_some()
        || mounts.get("data").and_then(|d| d.get(&key)).is_some()
}

fn describe_errors(value: &Value) -> String {
    match value.get("errors").and_then(Value::as_array) {
        Some(errors) => errors
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("; "),
        None => value.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(address: &str) -> TransitSettings {
        TransitSettings {
            enabled: true,
            address: address.into(),
            token: "s.token".into(),
            ..TransitSettings::default()
        }
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let client = TransitClient::new(&settings("https://vault.example:8200/proxy")).unwrap();
        let url = client.endpoint("v1/transit/encrypt/sealkeep").unwrap();
        assert_eq!(
            url.as_str(),
            "https://vault.example:8200/proxy/v1/transit/encrypt/sealkeep"
        );
    }

    #[test]
    fn mount_path_slashes_are_trimmed() {
        let mut s = settings("http://127.0.0.1:8200");
        s.mount_path = "/secrets/transit/".into();
        let client = TransitClient::new(&s).unwrap();
        assert_eq!(client.mount, "secrets/transit");
    }

    #[test]
    fn bad_address_is_config_error() {
        assert!(matches!(
            TransitClient::new(&settings("not a url")),
            Err(VaultError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn empty_key_name_rejected() {
        let mut s = settings("http://127.0.0.1:8200");
        s.key_name = " ".into();
        assert!(TransitClient::new(&s).is_err());
    }

    #[test]
    fn parses_data_fields_and_mounts() {
        let response = json!({ "data": { "ciphertext": "vault:v1:abc" } });
        assert_eq!(data_field(&response, "ciphertext"), Some("vault:v1:abc"));
        assert_eq!(data_field(&response, "plaintext"), None);

        assert!(mount_listed(&json!({ "transit/": {} }), "transit"));
        assert!(mount_listed(&json!({ "data": { "transit/": {} } }), "transit"));
        assert!(!mount_listed(&json!({ "kv/": {} }), "transit"));
    }

    #[test]
    fn error_bodies_are_summarized() {
        let body = json!({ "errors": ["permission denied", "bad token"] });
        assert_eq!(describe_errors(&body), "permission denied; bad token");
    }

    #[test]
    fn debug_redacts_token() {
        let shown = format!("{:?}", settings("http://x"));
        assert!(!shown.contains("s.token"));
    }

    #[tokio::test]
    async fn truncated_body_is_backend_unavailable() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                      content-length: 64\r\nconnection: close\r\n\r\n{\"initialized\":",
                )
                .await
                .unwrap();
            let _ = socket.shutdown().await;
        });

        let mut s = settings(&format!("http://{addr}"));
        s.timeout_secs = 5;
        let client = TransitClient::new(&s).unwrap();
        let result = client.call(Method::GET, "v1/sys/health", None).await;
        assert!(matches!(result, Err(VaultError::BackendUnavailable { .. })));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_server_is_backend_unavailable() {
        // Port 9 (discard) on loopback is closed in test environments.
        let mut s = settings("http://127.0.0.1:9");
        s.timeout_secs = 1;
        let client = TransitClient::new(&s).unwrap();
        assert!(matches!(
            client.ensure_ready().await,
            Err(VaultError::BackendUnavailable { .. })
        ));
    }
}
