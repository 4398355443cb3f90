//! Single local port forward
//!
//! Forwards connections from 127.0.0.1:<local> to a pod-side port through a
//! direct-tcpip channel on the control connection.
//! Example: local:8888 -> pod localhost:8888 (ComfyUI)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::error::{Classify, ErrorClass};
use crate::events::{EventBus, PodEvent};
use crate::ssh::SshError;

/// Pod-side host every forward targets
const REMOTE_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    /// Listening and forwarding
    Active,
    /// Lost its channel, trying to re-open once
    Reopening,
    /// Re-open failed; the local port is released
    Down,
    /// Closed on request
    Closed,
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Local port {port} for {service} is already in use")]
    PortInUse { service: String, port: u16 },

    #[error("Forward {service} -> remote port {remote_port} failed: {reason}")]
    TransportFailure {
        service: String,
        remote_port: u16,
        reason: String,
    },

    #[error("Remote port {remote_port} ({service}) is not exposed by tier {tier}")]
    PortNotInTier {
        service: String,
        remote_port: u16,
        tier: String,
    },

    #[error("Failed to bind local port for {service}: {source}")]
    Bind {
        service: String,
        #[source]
        source: std::io::Error,
    },
}

impl Classify for TunnelError {
    fn class(&self) -> ErrorClass {
        match self {
            TunnelError::TransportFailure { .. } => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

/// What to forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub service: String,
    pub remote_port: u16,
    /// Documented local port; usually equal to the remote port
    pub preferred_local_port: u16,
}

impl ForwardSpec {
    pub fn new(service: impl Into<String>, remote_port: u16) -> Self {
        Self {
            service: service.into(),
            remote_port,
            preferred_local_port: remote_port,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Budget for establishing (or re-establishing) the forward
    pub open_deadline: Duration,
    /// Fail instead of relocating when the preferred port is taken
    pub fixed_local_port: bool,
}

/// Snapshot for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub service: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// The documented local port was taken and another one was chosen
    pub relocated: bool,
    pub status: TunnelStatus,
}

/// A running forward
pub struct Tunnel {
    pub spec: ForwardSpec,
    pub local_addr: SocketAddr,
    status: Arc<RwLock<TunnelStatus>>,
    stop_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    /// Bind locally, confirm the pod-side port can be reached, then start
    /// accepting.
    pub async fn open(
        connections: Arc<ConnectionManager>,
        handle: ConnectionHandle,
        spec: ForwardSpec,
        options: TunnelOptions,
        events: EventBus,
    ) -> Result<Self, TunnelError> {
        let listener = bind_local(&spec, options.fixed_local_port).await?;
        let local_addr = listener.local_addr().map_err(|source| TunnelError::Bind {
            service: spec.service.clone(),
            source,
        })?;

        probe(&handle, &spec, options.open_deadline).await?;

        info!(
            "Started tunnel {} for pod {}: {} -> remote {}",
            spec.service,
            handle.pod_id(),
            local_addr,
            spec.remote_port
        );

        let status = Arc::new(RwLock::new(TunnelStatus::Active));
        let (stop_tx, stop_rx) = oneshot::channel();

        let tunnel = Self {
            spec: spec.clone(),
            local_addr,
            status: status.clone(),
            stop_tx: parking_lot::Mutex::new(Some(stop_tx)),
            task: tokio::sync::Mutex::new(None),
        };
        emit_status(&events, &handle, &spec, local_addr.port(), TunnelStatus::Active);

        let task = tokio::spawn(run_forward(
            connections,
            handle,
            spec,
            options,
            listener,
            status,
            stop_rx,
            events,
        ));
        *tunnel.task.lock().await = Some(task);
        Ok(tunnel)
    }

    pub fn status(&self) -> TunnelStatus {
        *self.status.read()
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            service: self.spec.service.clone(),
            local_port: self.local_port(),
            remote_port: self.spec.remote_port,
            relocated: self.spec.preferred_local_port != 0
                && self.local_port() != self.spec.preferred_local_port,
            status: self.status(),
        }
    }

    /// Stop accepting, drop in-flight streams and wait for the task. Idempotent.
    pub async fn close(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Tunnel {} task ended abnormally: {}", self.spec.service, e);
            }
        }
        let mut status = self.status.write();
        if *status != TunnelStatus::Down {
            *status = TunnelStatus::Closed;
        }
    }
}

async fn bind_local(spec: &ForwardSpec, fixed: bool) -> Result<TcpListener, TunnelError> {
    let preferred = format!("127.0.0.1:{}", spec.preferred_local_port);
    match TcpListener::bind(&preferred).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if fixed {
                return Err(TunnelError::PortInUse {
                    service: spec.service.clone(),
                    port: spec.preferred_local_port,
                });
            }
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .map_err(|source| TunnelError::Bind {
                    service: spec.service.clone(),
                    source,
                })?;
            if let Ok(addr) = listener.local_addr() {
                warn!(
                    "Port {} in use, forwarding {} on {} instead",
                    spec.preferred_local_port, spec.service, addr
                );
            }
            Ok(listener)
        }
        Err(source) => Err(TunnelError::Bind {
            service: spec.service.clone(),
            source,
        }),
    }
}

/// Open and drop one channel to prove the forward can be established.
/// A refused channel means the pod is up but the service is still starting,
/// which is fine.
async fn probe(handle: &ConnectionHandle, spec: &ForwardSpec, deadline: Duration) -> Result<(), TunnelError> {
    let transport = handle.transport();
    match tokio::time::timeout(deadline, transport.open_direct_tcpip(REMOTE_HOST, spec.remote_port)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(SshError::ChannelOpenRefused(reason))) => {
            warn!(
                "Nothing listening on remote port {} ({}) yet: {}",
                spec.remote_port, spec.service, reason
            );
            Ok(())
        }
        Ok(Err(e)) => Err(TunnelError::TransportFailure {
            service: spec.service.clone(),
            remote_port: spec.remote_port,
            reason: e.to_string(),
        }),
        Err(_) => Err(TunnelError::TransportFailure {
            service: spec.service.clone(),
            remote_port: spec.remote_port,
            reason: format!("not established within {:?}", deadline),
        }),
    }
}

fn emit_status(
    events: &EventBus,
    handle: &ConnectionHandle,
    spec: &ForwardSpec,
    local_port: u16,
    status: TunnelStatus,
) {
    events.emit(PodEvent::TunnelStatus {
        pod_id: handle.pod_id().to_string(),
        service: spec.service.clone(),
        local_port,
        remote_port: spec.remote_port,
        status,
    });
}

#[allow(clippy::too_many_arguments)]
async fn run_forward(
    connections: Arc<ConnectionManager>,
    handle: ConnectionHandle,
    spec: ForwardSpec,
    options: TunnelOptions,
    listener: TcpListener,
    status: Arc<RwLock<TunnelStatus>>,
    mut stop_rx: oneshot::Receiver<()>,
    events: EventBus,
) {
    let local_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    let mut disconnect_rx = handle.transport().subscribe_disconnect();
    let (fail_tx, mut fail_rx) = mpsc::channel::<String>(8);
    let mut connections_set = JoinSet::new();

    let final_status = loop {
        let failure = tokio::select! {
            _ = &mut stop_rx => {
                debug!("Tunnel {} stopped by request", spec.service);
                break TunnelStatus::Closed;
            }

            _ = disconnect_rx.recv() => "control connection lost".to_string(),

            Some(reason) = fail_rx.recv() => reason,

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        debug!("Accepted {} for tunnel {}", peer_addr, spec.service);
                        connections_set.spawn(forward_connection(
                            handle.clone(),
                            stream,
                            spec.clone(),
                            fail_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Accept error on tunnel {}: {}", spec.service, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                continue;
            }
        };

        // One automatic re-open, then give up on this forward only
        warn!("Tunnel {} for pod {} broke: {}", spec.service, handle.pod_id(), failure);
        *status.write() = TunnelStatus::Reopening;
        emit_status(&events, &handle, &spec, local_port, TunnelStatus::Reopening);
        connections_set.abort_all();

        match reopen(&connections, &handle, &spec, options.open_deadline).await {
            Ok(()) => {
                info!("Tunnel {} re-opened", spec.service);
                disconnect_rx = handle.transport().subscribe_disconnect();
                *status.write() = TunnelStatus::Active;
                emit_status(&events, &handle, &spec, local_port, TunnelStatus::Active);
            }
            Err(e) => {
                warn!("Tunnel {} is down: {}", spec.service, e);
                break TunnelStatus::Down;
            }
        }
    };

    connections_set.shutdown().await;
    drop(listener);
    *status.write() = final_status;
    emit_status(&events, &handle, &spec, local_port, final_status);
    info!("Tunnel {} task exited ({:?})", spec.service, final_status);
}

async fn reopen(
    connections: &ConnectionManager,
    handle: &ConnectionHandle,
    spec: &ForwardSpec,
    deadline: Duration,
) -> Result<(), TunnelError> {
    if !handle.is_connected() {
        connections
            .reconnect(handle)
            .await
            .map_err(|e| TunnelError::TransportFailure {
                service: spec.service.clone(),
                remote_port: spec.remote_port,
                reason: e.to_string(),
            })?;
    }
    probe(handle, spec, deadline).await
}

async fn forward_connection(
    handle: ConnectionHandle,
    mut local: TcpStream,
    spec: ForwardSpec,
    fail_tx: mpsc::Sender<String>,
) {
    let transport = handle.transport();
    let mut remote = match transport.open_direct_tcpip(REMOTE_HOST, spec.remote_port).await {
        Ok(stream) => stream,
        Err(SshError::ChannelOpenRefused(reason)) => {
            debug!("Remote port {} refused: {}", spec.remote_port, reason);
            return;
        }
        Err(e) => {
            let _ = fail_tx.send(e.to_string()).await;
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((sent, received)) => debug!(
            "Tunnel {} connection closed ({} bytes out, {} bytes in)",
            spec.service, sent, received
        ),
        Err(e) => debug!("Tunnel {} connection error: {}", spec.service, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectOptions;
    use crate::retry::BackoffPolicy;
    use crate::session::{Actor, PodRecord, PodState, SessionRegistry};
    use crate::testing::{MockConnector, MockTransport, PortBehavior};
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn options() -> TunnelOptions {
        TunnelOptions {
            open_deadline: Duration::from_millis(200),
            fixed_local_port: false,
        }
    }

    async fn setup(template: MockTransport) -> (Arc<ConnectionManager>, ConnectionHandle, Arc<MockConnector>) {
        let registry = Arc::new(SessionRegistry::default());
        registry.insert(PodRecord::new("pod-1", "prod", "p")).unwrap();
        registry.set_endpoint("pod-1", "127.0.0.1".into(), 22022).unwrap();
        registry.transition("pod-1", PodState::Provisioning, Actor::Deployer).unwrap();
        registry.transition("pod-1", PodState::Booting, Actor::Deployer).unwrap();

        let connector = Arc::new(MockConnector::new(template));
        let manager = Arc::new(ConnectionManager::new(
            connector.clone(),
            registry,
            ConnectOptions {
                username: "root".into(),
                key_path: PathBuf::from("/dev/null"),
                passphrase: None,
                backoff: BackoffPolicy {
                    base_ms: 1,
                    ceiling_ms: 2,
                    multiplier: 2.0,
                    jitter: 0.0,
                    max_attempts: 2,
                },
                attempt_timeout: Duration::from_millis(200),
                command_timeout: Duration::from_millis(200),
                keepalive: Duration::from_secs(30),
            },
        ));
        let handle = manager.connect("pod-1").await.unwrap();
        (manager, handle, connector)
    }

    #[tokio::test]
    async fn test_forwards_bytes() {
        let (manager, handle, connector) = setup(MockTransport::new()).await;
        let spec = ForwardSpec {
            service: "web".into(),
            remote_port: 8888,
            preferred_local_port: 0,
        };
        let tunnel = Tunnel::open(manager, handle, spec, options(), EventBus::noop())
            .await
            .unwrap();

        let mut client = TcpStream::connect(tunnel.local_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        tunnel.close().await;
        assert_eq!(tunnel.status(), TunnelStatus::Closed);
        assert_eq!(connector.template().open_streams(), 0);
        // Idempotent
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_occupied_port_is_relocated() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let (manager, handle, _) = setup(MockTransport::new()).await;
        let spec = ForwardSpec {
            service: "files".into(),
            remote_port: 3000,
            preferred_local_port: taken,
        };
        let tunnel = Tunnel::open(manager, handle, spec, options(), EventBus::noop())
            .await
            .unwrap();
        assert_ne!(tunnel.local_port(), taken);
        assert!(tunnel.info().relocated);
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_occupied_port_fails_in_fixed_mode() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let (manager, handle, _) = setup(MockTransport::new()).await;
        let spec = ForwardSpec {
            service: "files".into(),
            remote_port: 3000,
            preferred_local_port: taken,
        };
        let fixed = TunnelOptions {
            fixed_local_port: true,
            ..options()
        };
        let err = Tunnel::open(manager, handle, spec, fixed, EventBus::noop())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::PortInUse { port, .. } if port == taken));
    }

    #[tokio::test]
    async fn test_refused_remote_port_still_opens() {
        let template = MockTransport::new();
        template.set_port(7860, PortBehavior::Refuse);
        let (manager, handle, _) = setup(template).await;

        let tunnel = Tunnel::open(
            manager,
            handle,
            ForwardSpec { service: "video".into(), remote_port: 7860, preferred_local_port: 0 },
            options(),
            EventBus::noop(),
        )
        .await
        .unwrap();
        assert_eq!(tunnel.status(), TunnelStatus::Active);
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_hanging_channel_misses_deadline() {
        let template = MockTransport::new();
        template.set_port(8888, PortBehavior::Hang);
        let (manager, handle, _) = setup(template).await;

        let err = Tunnel::open(
            manager,
            handle,
            ForwardSpec { service: "web".into(), remote_port: 8888, preferred_local_port: 0 },
            options(),
            EventBus::noop(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, TunnelError::TransportFailure { .. }));
    }

    #[tokio::test]
    async fn test_reopens_after_connection_drop() {
        let (manager, handle, connector) = setup(MockTransport::new()).await;
        let tunnel = Tunnel::open(
            manager,
            handle.clone(),
            ForwardSpec { service: "web".into(), remote_port: 8888, preferred_local_port: 0 },
            options(),
            EventBus::noop(),
        )
        .await
        .unwrap();

        connector.current().unwrap().drop_connection();
        for _ in 0..50 {
            if connector.attempts() == 2 && tunnel.status() == TunnelStatus::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(connector.attempts(), 2);
        assert_eq!(tunnel.status(), TunnelStatus::Active);
        assert!(handle.is_connected());

        let mut client = TcpStream::connect(tunnel.local_addr).await.unwrap();
        client.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_goes_down_when_reopen_fails() {
        let (manager, handle, connector) = setup(MockTransport::new()).await;
        let tunnel = Tunnel::open(
            manager,
            handle,
            ForwardSpec { service: "web".into(), remote_port: 8888, preferred_local_port: 0 },
            options(),
            EventBus::noop(),
        )
        .await
        .unwrap();

        // The connection stays up but the channel breaks for good
        connector.template().set_port(8888, PortBehavior::Fail);
        let _client = TcpStream::connect(tunnel.local_addr).await.unwrap();

        for _ in 0..50 {
            if tunnel.status() == TunnelStatus::Down {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tunnel.status(), TunnelStatus::Down);
        tunnel.close().await;
        assert_eq!(tunnel.status(), TunnelStatus::Down);
    }
}
