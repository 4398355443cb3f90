//! SSH client for pod control connections using russh

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Where and how to reach one pod
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_path: PathBuf,
    pub passphrase: Option<String>,
    /// Handshake + auth budget for one attempt
    pub timeout: Duration,
    pub keepalive: Duration,
    /// Fingerprint pinned on an earlier connection, if any
    pub pinned_host_key: Option<String>,
}

/// Compute SHA256 fingerprint of a public key
pub fn fingerprint(key: &PublicKey) -> String {
    let key_bytes = key.public_key_bytes();
    let mut hasher = Sha256::new();
    hasher.update(&key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Connect and authenticate. Returns the handle plus the server's fingerprint.
pub async fn connect(target: &SshTarget) -> Result<(client::Handle<ClientHandler>, String), SshError> {
    info!("Connecting to SSH server at {}:{}", target.host, target.port);

    // Configure SSH client with keepalive
    let ssh_config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(target.keepalive),
        keepalive_max: 3,
        ..Default::default()
    };

    let handler = ClientHandler::new(
        target.host.clone(),
        target.port,
        target.pinned_host_key.clone(),
    );
    let observed = handler.observed.clone();

    let attempt = async {
        let mut handle = client::connect(
            Arc::new(ssh_config),
            (target.host.as_str(), target.port),
            handler,
        )
        .await?;

        debug!("SSH handshake completed");

        let key = russh::keys::load_secret_key(&target.key_path, target.passphrase.as_deref())
            .map_err(|e| SshError::KeyError(format!("{}: {}", target.key_path.display(), e)))?;
        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

        let authenticated = handle
            .authenticate_publickey(&target.username, key_with_hash)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }
        Ok(handle)
    };

    let handle = tokio::time::timeout(target.timeout, attempt)
        .await
        .map_err(|_| SshError::Timeout(format!("connect to {}:{} timed out", target.host, target.port)))??;

    info!("SSH authentication successful for {}@{}", target.username, target.host);

    let fingerprint = observed.lock().clone().unwrap_or_default();
    Ok((handle, fingerprint))
}

/// Client handler for russh callbacks
///
/// Pods are ephemeral, so ~/.ssh/known_hosts is not consulted. The first key
/// seen for a pod is pinned by the caller; a different key on a later
/// connection is rejected.
pub struct ClientHandler {
    host: String,
    port: u16,
    pinned: Option<String>,
    observed: Arc<Mutex<Option<String>>>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, pinned: Option<String>) -> Self {
        Self {
            host,
            port,
            pinned,
            observed: Arc::new(Mutex::new(None)),
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);
        *self.observed.lock() = Some(actual.clone());

        match self.pinned {
            Some(ref expected) if *expected != actual => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected, actual
                );
                Err(SshError::HostKeyMismatch {
                    expected: expected.clone(),
                    actual,
                })
            }
            Some(_) => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            None => {
                info!(
                    "First contact with {}:{}, pinning host key {}",
                    self.host, self.port, actual
                );
                Ok(true)
            }
        }
    }
}
