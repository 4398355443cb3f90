//! Tunnel Bridge
//!
//! Opens every forward in a tier's port map for one session, all or nothing,
//! and drives the pod between Reachable and Connected.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{info, warn};

use super::tunnel::{ForwardSpec, Tunnel, TunnelError, TunnelInfo, TunnelOptions};
use crate::config::settings::TunnelSettings;
use crate::config::Tier;
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::session::{Actor, PodState, SessionRegistry};

/// Open forwards of one session
pub struct TunnelBridge {
    pod_id: String,
    tunnels: Vec<Tunnel>,
    registry: Arc<SessionRegistry>,
    closed: AtomicBool,
}

impl TunnelBridge {
    /// Open the tier's whole port map
    pub async fn open(
        connections: Arc<ConnectionManager>,
        registry: Arc<SessionRegistry>,
        handle: ConnectionHandle,
        tier: &Tier,
        settings: &TunnelSettings,
    ) -> Result<Self, TunnelError> {
        Self::open_ports(connections, registry, handle, tier, &tier.ports, settings).await
    }

    /// Open a subset of the tier's port map. Ports the tier does not expose
    /// are rejected before anything is bound.
    pub async fn open_ports(
        connections: Arc<ConnectionManager>,
        registry: Arc<SessionRegistry>,
        handle: ConnectionHandle,
        tier: &Tier,
        ports: &BTreeMap<String, u16>,
        settings: &TunnelSettings,
    ) -> Result<Self, TunnelError> {
        if let Some((service, port)) = ports.iter().find(|(_, p)| !tier.allows_remote_port(**p)) {
            return Err(TunnelError::PortNotInTier {
                service: service.clone(),
                remote_port: *port,
                tier: tier.key.clone(),
            });
        }

        let options = TunnelOptions {
            open_deadline: settings.open_deadline(),
            fixed_local_port: settings.fixed_local_ports,
        };
        let events = registry.events().clone();
        let pod_id = handle.pod_id().to_string();

        let results = join_all(ports.iter().map(|(service, port)| {
            Tunnel::open(
                connections.clone(),
                handle.clone(),
                ForwardSpec::new(service.clone(), *port),
                options.clone(),
                events.clone(),
            )
        }))
        .await;

        let mut tunnels = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(tunnel) => tunnels.push(tunnel),
                Err(e) => {
                    warn!("Forward for pod {} failed: {}", pod_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            for tunnel in &tunnels {
                tunnel.close().await;
            }
            return Err(e);
        }

        if registry.state(&pod_id) == Some(PodState::Reachable) {
            if let Err(e) = registry.transition(&pod_id, PodState::Connected, Actor::Bridge) {
                warn!("Pod {} not marked connected: {}", pod_id, e);
            }
        }
        info!("Opened {} tunnels for pod {}", tunnels.len(), pod_id);

        Ok(Self {
            pod_id,
            tunnels,
            registry,
            closed: AtomicBool::new(false),
        })
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    pub fn tunnels(&self) -> Vec<TunnelInfo> {
        self.tunnels.iter().map(Tunnel::info).collect()
    }

    pub fn open_count(&self) -> usize {
        if self.closed.load(Ordering::SeqCst) {
            0
        } else {
            self.tunnels.len()
        }
    }

    /// Close every tunnel. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        join_all(self.tunnels.iter().map(|t| t.close())).await;

        if self.registry.state(&self.pod_id) == Some(PodState::Connected) {
            if let Err(e) = self
                .registry
                .transition(&self.pod_id, PodState::Reachable, Actor::Bridge)
            {
                warn!("Pod {} not moved back to reachable: {}", self.pod_id, e);
            }
        }
        info!("Closed tunnels for pod {}", self.pod_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplateRegistry;
    use crate::connection::ConnectOptions;
    use crate::events::{EventBus, PodEvent};
    use crate::forwarding::TunnelStatus;
    use crate::retry::BackoffPolicy;
    use crate::session::PodRecord;
    use crate::testing::{MockConnector, MockTransport, PortBehavior};
    use std::path::PathBuf;
    use std::time::Duration;

    fn settings() -> TunnelSettings {
        TunnelSettings {
            open_deadline_ms: 200,
            fixed_local_ports: false,
        }
    }

    async fn reachable(template: MockTransport) -> (Arc<ConnectionManager>, Arc<SessionRegistry>, ConnectionHandle, Arc<MockConnector>) {
        let registry = Arc::new(SessionRegistry::new(EventBus::new(64)));
        registry.insert(PodRecord::new("pod-1", "prod", "ltx2-comfyui-prod")).unwrap();
        registry.set_endpoint("pod-1", "127.0.0.1".into(), 22022).unwrap();
        registry.transition("pod-1", PodState::Provisioning, Actor::Deployer).unwrap();
        registry.transition("pod-1", PodState::Booting, Actor::Deployer).unwrap();

        let connector = Arc::new(MockConnector::new(template));
        let connections = Arc::new(ConnectionManager::new(
            connector.clone(),
            registry.clone(),
            ConnectOptions {
                username: "root".into(),
                key_path: PathBuf::from("/dev/null"),
                passphrase: None,
                backoff: BackoffPolicy { base_ms: 1, ceiling_ms: 2, multiplier: 2.0, jitter: 0.0, max_attempts: 2 },
                attempt_timeout: Duration::from_millis(200),
                command_timeout: Duration::from_millis(200),
                keepalive: Duration::from_secs(30),
            },
        ));
        let handle = connections.connect("pod-1").await.unwrap();
        (connections, registry, handle, connector)
    }

    #[tokio::test]
    async fn test_opens_whole_port_map() {
        let (connections, registry, handle, connector) = reachable(MockTransport::new()).await;
        let templates = TemplateRegistry::builtin();
        let tier = templates.get("prod").unwrap();

        let bridge = TunnelBridge::open(connections, registry.clone(), handle, tier, &settings())
            .await
            .unwrap();
        assert_eq!(bridge.open_count(), tier.ports.len());
        let mut remote: Vec<u16> = bridge.tunnels().iter().map(|t| t.remote_port).collect();
        remote.sort_unstable();
        let mut expected: Vec<u16> = tier.ports.values().copied().collect();
        expected.sort_unstable();
        assert_eq!(remote, expected);
        assert_eq!(registry.state("pod-1"), Some(PodState::Connected));

        bridge.close().await;
        bridge.close().await;
        assert_eq!(bridge.open_count(), 0);
        assert_eq!(connector.template().open_streams(), 0);
        assert_eq!(registry.state("pod-1"), Some(PodState::Reachable));
    }

    #[tokio::test]
    async fn test_one_failing_forward_closes_the_rest() {
        let template = MockTransport::new();
        template.set_port(3000, PortBehavior::Hang);
        let (connections, registry, handle, connector) = reachable(template).await;
        let mut events = registry.events().subscribe();
        let templates = TemplateRegistry::builtin();
        let tier = templates.get("prod").unwrap();

        let err = TunnelBridge::open(connections, registry.clone(), handle, tier, &settings())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::TransportFailure { remote_port: 3000, .. }));
        assert_eq!(registry.state("pod-1"), Some(PodState::Reachable));
        assert_eq!(connector.template().open_streams(), 0);

        // The forward that did come up was torn down and its port released
        let mut opened = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PodEvent::TunnelStatus { local_port, remote_port, status: TunnelStatus::Active, .. } = event {
                assert_eq!(remote_port, 8888);
                opened.push(local_port);
            }
        }
        assert_eq!(opened.len(), 1);
        for port in opened {
            assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
        }
    }

    #[tokio::test]
    async fn test_ports_outside_tier_are_rejected() {
        let (connections, registry, handle, _) = reachable(MockTransport::new()).await;
        let templates = TemplateRegistry::builtin();
        let tier = templates.get("prod").unwrap();

        let mut ports = BTreeMap::new();
        ports.insert("ssh".to_string(), 22);
        let err = TunnelBridge::open_ports(connections, registry, handle, tier, &ports, &settings())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::PortNotInTier { remote_port: 22, .. }));
    }
}
