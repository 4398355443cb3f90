//! Connection Manager
//!
//! One control connection per pod, established with bounded backoff and
//! reused by every session component. A [`ConnectionHandle`] stays valid
//! across reconnects: the transport behind it is swapped in place.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{Classify, ErrorClass};
use crate::events::{EventBus, PodEvent};
use crate::retry::BackoffPolicy;
use crate::session::{Actor, PodState, RegistryError, SessionRegistry};
use crate::ssh::{Connector, Established, ExecOutput, RemoteTransport, SshError, SshTarget};

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Pod {pod_id} unreachable after {attempts} attempts: {last_error}")]
    Unreachable {
        pod_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Authentication to pod {pod_id} failed: {reason}")]
    AuthFailed { pod_id: String, reason: String },

    #[error("Pod {pod_id} timed out on all {attempts} connection attempts")]
    Timeout { pod_id: String, attempts: u32 },

    #[error("Connection to pod {0} lost")]
    ConnectionLost(String),

    #[error("Command on pod {pod_id} timed out after {timeout:?}")]
    CommandTimeout { pod_id: String, timeout: Duration },

    #[error("Pod {0} has no SSH endpoint yet")]
    NoEndpoint(String),

    #[error("Pod {pod_id} cannot be connected in state {state}")]
    NotConnectable { pod_id: String, state: PodState },

    #[error(transparent)]
    Transport(#[from] SshError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl Classify for ConnectError {
    fn class(&self) -> ErrorClass {
        match self {
            ConnectError::Unreachable { .. } | ConnectError::Timeout { .. } => {
                ErrorClass::Transient
            }
            ConnectError::CommandTimeout { .. } => ErrorClass::Transient,
            ConnectError::AuthFailed { .. } => ErrorClass::Unauthorized,
            ConnectError::ConnectionLost(_) => ErrorClass::ConnectionLost,
            ConnectError::Transport(e) => e.class(),
            _ => ErrorClass::Fatal,
        }
    }
}

/// Connection parameters shared by every pod
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub username: String,
    pub key_path: PathBuf,
    pub passphrase: Option<String>,
    pub backoff: BackoffPolicy,
    pub attempt_timeout: Duration,
    pub command_timeout: Duration,
    pub keepalive: Duration,
}

impl ConnectOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            username: settings.ssh_user.clone(),
            key_path: settings.resolved_key_path(),
            passphrase: settings.ssh_key_passphrase.clone(),
            backoff: settings.connect.backoff.clone(),
            attempt_timeout: settings.connect.attempt_timeout(),
            command_timeout: settings.connect.command_timeout(),
            keepalive: Duration::from_secs(settings.connect.keepalive_secs),
        }
    }
}

/// Stable handle to a pod's control connection
#[derive(Clone)]
pub struct ConnectionHandle {
    pod_id: Arc<str>,
    transport: Arc<RwLock<Arc<dyn RemoteTransport>>>,
}

impl ConnectionHandle {
    fn new(pod_id: &str, transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            pod_id: Arc::from(pod_id),
            transport: Arc::new(RwLock::new(transport)),
        }
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    /// Current transport. Callers should not hold on to it across a reconnect.
    pub fn transport(&self) -> Arc<dyn RemoteTransport> {
        self.transport.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.read().is_connected()
    }

    fn replace(&self, transport: Arc<dyn RemoteTransport>) {
        *self.transport.write() = transport;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("pod_id", &self.pod_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    registry: Arc<SessionRegistry>,
    options: ConnectOptions,
    handles: DashMap<String, ConnectionHandle>,
    /// Serialises connect/reconnect per pod
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<SessionRegistry>,
        options: ConnectOptions,
    ) -> Self {
        Self {
            connector,
            registry,
            options,
            handles: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    fn events(&self) -> &EventBus {
        self.registry.events()
    }

    fn pod_lock(&self, pod_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(pod_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Live handle for a pod, if one exists
    pub fn handle(&self, pod_id: &str) -> Option<ConnectionHandle> {
        self.handles
            .get(pod_id)
            .map(|h| h.clone())
            .filter(|h| h.is_connected())
    }

    /// Connect to a pod, or return the live handle if there already is one.
    ///
    /// Moves the pod Booting -> Reachable on the first successful handshake.
    pub async fn connect(&self, pod_id: &str) -> Result<ConnectionHandle, ConnectError> {
        let lock = self.pod_lock(pod_id);
        let _guard = lock.lock().await;

        if let Some(handle) = self.handle(pod_id) {
            debug!("Reusing control connection for pod {}", pod_id);
            return Ok(handle);
        }

        let state = self
            .registry
            .state(pod_id)
            .ok_or_else(|| RegistryError::PodNotFound(pod_id.to_string()))?;
        if !matches!(
            state,
            PodState::Booting | PodState::Reachable | PodState::Connected
        ) {
            return Err(ConnectError::NotConnectable {
                pod_id: pod_id.to_string(),
                state,
            });
        }

        let established = self.establish(pod_id).await?;

        let handle = match self.handles.get(pod_id).map(|h| h.clone()) {
            Some(existing) => {
                existing.replace(established.transport);
                existing
            }
            None => {
                let handle = ConnectionHandle::new(pod_id, established.transport);
                self.handles.insert(pod_id.to_string(), handle.clone());
                handle
            }
        };

        if self.registry.state(pod_id) == Some(PodState::Booting) {
            self.registry
                .transition(pod_id, PodState::Reachable, Actor::Connection)?;
        }
        Ok(handle)
    }

    /// Replace a dropped transport behind `handle`. No-op if it is still live.
    pub async fn reconnect(&self, handle: &ConnectionHandle) -> Result<(), ConnectError> {
        let lock = self.pod_lock(handle.pod_id());
        let _guard = lock.lock().await;

        if handle.is_connected() {
            return Ok(());
        }
        info!("Reconnecting to pod {}", handle.pod_id());
        let established = self.establish(handle.pod_id()).await?;
        handle.replace(established.transport);
        Ok(())
    }

    /// Backoff loop. Marks the pod Failed when the budget runs out.
    async fn establish(&self, pod_id: &str) -> Result<Established, ConnectError> {
        let started = Instant::now();
        let policy = &self.options.backoff;
        let mut backoff = policy.schedule();
        let mut attempt = 1;

        loop {
            let record = self
                .registry
                .get(pod_id)
                .ok_or_else(|| RegistryError::PodNotFound(pod_id.to_string()))?;
            if matches!(
                record.state,
                PodState::Terminating | PodState::Terminated | PodState::Failed
            ) {
                return Err(ConnectError::NotConnectable {
                    pod_id: pod_id.to_string(),
                    state: record.state,
                });
            }
            let (host, port) = record
                .endpoint()
                .ok_or_else(|| ConnectError::NoEndpoint(pod_id.to_string()))?;

            let target = SshTarget {
                host,
                port,
                username: self.options.username.clone(),
                key_path: self.options.key_path.clone(),
                passphrase: self.options.passphrase.clone(),
                timeout: self.options.attempt_timeout,
                keepalive: self.options.keepalive,
                pinned_host_key: record.host_key.clone(),
            };

            let result = match tokio::time::timeout(
                self.options.attempt_timeout,
                self.connector.connect(pod_id, &target),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SshError::Timeout(format!(
                    "no handshake within {:?}",
                    self.options.attempt_timeout
                ))),
            };

            let elapsed = started.elapsed();
            match result {
                Ok(established) => {
                    info!(
                        "Connected to pod {} on attempt {}/{} after {:?}",
                        pod_id, attempt, policy.max_attempts, elapsed
                    );
                    self.events().emit(PodEvent::ConnectAttempt {
                        pod_id: pod_id.to_string(),
                        attempt,
                        max_attempts: policy.max_attempts,
                        elapsed,
                        error: None,
                    });
                    if record.host_key.is_none() && !established.host_key.is_empty() {
                        self.registry
                            .pin_host_key(pod_id, established.host_key.clone())?;
                    }
                    return Ok(established);
                }
                Err(e) => {
                    warn!(
                        "Connect attempt {}/{} to pod {} failed after {:?}: {}",
                        attempt, policy.max_attempts, pod_id, elapsed, e
                    );
                    self.events().emit(PodEvent::ConnectAttempt {
                        pod_id: pod_id.to_string(),
                        attempt,
                        max_attempts: policy.max_attempts,
                        elapsed,
                        error: Some(e.to_string()),
                    });

                    if e.class() == ErrorClass::Unauthorized {
                        return Err(ConnectError::AuthFailed {
                            pod_id: pod_id.to_string(),
                            reason: e.to_string(),
                        });
                    }

                    match backoff.next_delay() {
                        Some(delay) => {
                            debug!("Next connect attempt to pod {} in {:?}", pod_id, delay);
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => {
                            let reason = format!(
                                "connection budget exhausted after {} attempts: {}",
                                attempt, e
                            );
                            if self.registry.state(pod_id) != Some(PodState::Terminating) {
                                self.registry.fail(pod_id, Actor::Connection, reason)?;
                            }
                            return Err(match e {
                                SshError::Timeout(_) => ConnectError::Timeout {
                                    pod_id: pod_id.to_string(),
                                    attempts: attempt,
                                },
                                other => ConnectError::Unreachable {
                                    pod_id: pod_id.to_string(),
                                    attempts: attempt,
                                    last_error: other.to_string(),
                                },
                            });
                        }
                    }
                }
            }
        }
    }

    /// Run one command with the command timeout
    pub async fn run(
        &self,
        handle: &ConnectionHandle,
        command: &str,
    ) -> Result<ExecOutput, ConnectError> {
        let transport = handle.transport();
        if !transport.is_connected() {
            return Err(ConnectError::ConnectionLost(handle.pod_id().to_string()));
        }

        match tokio::time::timeout(self.options.command_timeout, transport.exec(command)).await {
            Err(_) => Err(ConnectError::CommandTimeout {
                pod_id: handle.pod_id().to_string(),
                timeout: self.options.command_timeout,
            }),
            Ok(Err(e)) if e.class() == ErrorClass::ConnectionLost || !transport.is_connected() => {
                Err(ConnectError::ConnectionLost(handle.pod_id().to_string()))
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(output)) => Ok(output),
        }
    }

    /// [`run`](Self::run), reconnecting and retrying exactly once on a lost connection
    pub async fn run_with_reconnect(
        &self,
        handle: &ConnectionHandle,
        command: &str,
    ) -> Result<ExecOutput, ConnectError> {
        match self.run(handle, command).await {
            Err(ConnectError::ConnectionLost(_)) => {
                warn!("Connection to pod {} lost during command, retrying once", handle.pod_id());
                self.reconnect(handle).await?;
                self.run(handle, command).await
            }
            other => other,
        }
    }

    /// Drop the pod's control connection
    pub async fn disconnect(&self, pod_id: &str) {
        if let Some((_, handle)) = self.handles.remove(pod_id) {
            info!("Closing control connection to pod {}", pod_id);
            handle.transport().disconnect().await;
        }
        self.locks.remove(pod_id);
    }
}
