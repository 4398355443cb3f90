//! Pod manager
//!
//! Ties the components together behind one entry point per user-facing
//! operation. Owns the registry, the provider client, the connection manager,
//! every live session (tunnel bridge plus status monitor) and a stop handle
//! for every log watch it started.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::templates::WORKSPACE;
use crate::config::{CloudType, Settings, TemplateRegistry, Tier};
use crate::connection::{ConnectOptions, ConnectionHandle, ConnectionManager};
use crate::error::{Classify, ErrorClass, PodError};
use crate::events::{EventBus, PodEvent};
use crate::forwarding::{TunnelBridge, TunnelInfo};
use crate::monitor::{
    self, BurnSummary, CostMonitor, LogWatcher, ResourceSnapshot, StatusMonitor, WatchStop,
};
use crate::provider::{
    CreateRequest, PodDescription, Provider, ProviderClient, ProviderError, RemoteStatus,
    RunPodProvider,
};
use crate::retry::BackoffPolicy;
use crate::session::{reconciled_state, Actor, PodRecord, PodState, PodStore, SessionRegistry};
use crate::sftp::{self, PullReport};
use crate::ssh::{
    shell_escape, Connector, ExecOutput, RemoteProcess, RemoteShell, SshConnector,
};

/// Blender binary installed by the blender tier's setup script
const BLENDER_BIN: &str = "/workspace/blender/blender";

/// How `deploy` behaves
#[derive(Debug, Clone, Copy)]
pub struct DeployOptions {
    /// Reuse a running pod with the tier's pod name
    pub reuse: bool,
    /// Upload and launch the startup script
    pub run_setup: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            reuse: true,
            run_setup: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployOutcome {
    pub pod_id: String,
    pub reused: bool,
    /// Cloud the pod was created on; None when reused
    pub cloud_type: Option<CloudType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PushReport {
    pub uploaded: Vec<String>,
    /// (local path, reason)
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Wallet {
    pub burn: BurnSummary,
    pub pods: Vec<PodRecord>,
}

/// Live binding between the operator and one pod
struct Session {
    bridge: TunnelBridge,
    status: StatusMonitor,
}

pub struct PodManager {
    settings: Settings,
    templates: TemplateRegistry,
    registry: Arc<SessionRegistry>,
    provider: ProviderClient,
    terminate_policy: BackoffPolicy,
    connections: Arc<ConnectionManager>,
    store: Option<PodStore>,
    sessions: Mutex<HashMap<String, Session>>,
    /// Log watches per pod, readers are held by callers
    watchers: Mutex<HashMap<String, Vec<WatchStop>>>,
}

impl PodManager {
    pub fn new(
        settings: Settings,
        provider: Arc<dyn Provider>,
        connector: Arc<dyn Connector>,
        events: EventBus,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(events));
        let connections = Arc::new(ConnectionManager::new(
            connector,
            registry.clone(),
            ConnectOptions::from_settings(&settings),
        ));
        Self {
            templates: TemplateRegistry::with_overrides(settings.tiers.clone()),
            terminate_policy: BackoffPolicy::terminate(settings.provision.terminate_attempts),
            provider: ProviderClient::new(provider, BackoffPolicy::provider()),
            settings,
            registry,
            connections,
            store: None,
            sessions: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Manager talking to RunPod over SSH, persisting to the default state file
    pub fn from_settings(settings: Settings, events: EventBus) -> Result<Self, PodError> {
        let provider = Arc::new(RunPodProvider::new(settings.api_key.clone())?);
        let store = PodStore::open_default()?;
        Ok(Self::new(settings, provider, Arc::new(SshConnector), events).with_store(store))
    }

    pub fn with_store(mut self, store: PodStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_provider_policy(mut self, policy: BackoffPolicy) -> Self {
        self.provider = self.provider.with_policy(policy);
        self
    }

    pub fn with_terminate_policy(mut self, policy: BackoffPolicy) -> Self {
        self.terminate_policy = policy;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        self.registry.events()
    }

    async fn persist(&self) {
        if let Some(ref store) = self.store {
            if let Err(e) = store.save(&self.registry).await {
                warn!("Failed to write {}: {}", store.path().display(), e);
            }
        }
    }

    fn tier_for(&self, record: &PodRecord) -> Result<Tier, PodError> {
        self.templates
            .get(&record.tier)
            .or_else(|| self.templates.by_pod_name(&record.name))
            .cloned()
            .ok_or_else(|| PodError::UnknownTier(record.tier.clone()))
    }

    fn record(&self, pod_id: &str) -> Result<PodRecord, PodError> {
        self.registry
            .get(pod_id)
            .ok_or_else(|| crate::session::RegistryError::PodNotFound(pod_id.to_string()).into())
    }

    // ========================================================================
    // Pod selection
    // ========================================================================

    pub fn list(&self) -> Vec<PodRecord> {
        self.registry.list()
    }

    /// The explicitly named pod, or the only live one
    pub fn select_pod(&self, explicit: Option<&str>) -> Result<String, PodError> {
        if let Some(id) = explicit {
            return self.record(id).map(|r| r.id);
        }
        let live: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|r| {
                !matches!(
                    r.state,
                    PodState::Terminating | PodState::Terminated | PodState::Failed
                )
            })
            .map(|r| r.id)
            .collect();
        match live.len() {
            0 => Err(PodError::NoPods),
            1 => Ok(live.into_iter().next().unwrap_or_default()),
            _ => Err(PodError::AmbiguousPod(live)),
        }
    }

    // ========================================================================
    // Deploy
    // ========================================================================

    /// Bring up a pod for `tier_key` and, unless disabled, start its workload
    pub async fn deploy(&self, tier_key: &str, options: DeployOptions) -> Result<DeployOutcome, PodError> {
        let tier = self
            .templates
            .get(tier_key)
            .cloned()
            .ok_or_else(|| PodError::UnknownTier(tier_key.to_string()))?;

        if options.reuse {
            if let Some(pod_id) = self.find_reusable(&tier).await? {
                info!("Reusing running pod {} ({})", pod_id, tier.pod_name);
                let connected = self.connections.connect(&pod_id).await;
                self.persist().await;
                connected?;
                return Ok(DeployOutcome {
                    pod_id,
                    reused: true,
                    cloud_type: None,
                });
            }
        }

        let (pod_id, cloud_type) = self.create_with_fallback(&tier).await?;
        self.registry
            .insert(PodRecord::new(&pod_id, &tier.key, &tier.pod_name))?;
        self.registry
            .transition(&pod_id, PodState::Provisioning, Actor::Deployer)?;
        self.persist().await;

        let description = match self.wait_for_endpoint(&pod_id).await {
            Ok(d) => d,
            Err(e) => {
                if let Err(fail_err) = self.registry.fail(&pod_id, Actor::Deployer, e.to_string()) {
                    debug!("Could not mark pod {} failed: {}", pod_id, fail_err);
                }
                self.persist().await;
                return Err(e);
            }
        };
        if let (Some(host), Some(port)) = (description.host, description.ssh_port) {
            self.registry.set_endpoint(&pod_id, host, port)?;
        }
        self.registry
            .transition(&pod_id, PodState::Booting, Actor::Deployer)?;
        self.persist().await;

        let connected = self.connections.connect(&pod_id).await;
        self.persist().await;
        let handle = connected?;

        if options.run_setup {
            self.trigger_startup(&handle, &tier).await?;
        }

        Ok(DeployOutcome {
            pod_id,
            reused: false,
            cloud_type: Some(cloud_type),
        })
    }

    async fn find_reusable(&self, tier: &Tier) -> Result<Option<String>, PodError> {
        let pods = self.provider.list_pods().await?;
        for pod in pods.iter().filter(|p| p.name == tier.pod_name && p.ssh_ready()) {
            match self.registry.state(&pod.id) {
                None => {
                    self.adopt(pod, tier)?;
                    return Ok(Some(pod.id.clone()));
                }
                Some(PodState::Booting | PodState::Reachable | PodState::Connected) => {
                    return Ok(Some(pod.id.clone()));
                }
                Some(state) => debug!("Not reusing pod {} in state {}", pod.id, state),
            }
        }
        Ok(None)
    }

    /// Track a running pod this process did not create
    fn adopt(&self, pod: &PodDescription, tier: &Tier) -> Result<(), PodError> {
        let mut record = PodRecord::new(&pod.id, &tier.key, &pod.name);
        record.host = pod.host.clone();
        record.ssh_port = pod.ssh_port;
        self.registry.insert(record)?;
        self.registry
            .transition(&pod.id, PodState::Provisioning, Actor::Deployer)?;
        self.registry
            .transition(&pod.id, PodState::Booting, Actor::Deployer)?;
        info!("Tracking running pod {} ({})", pod.id, pod.name);
        Ok(())
    }

    async fn pod_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let mut public_key = self.settings.resolved_key_path().into_os_string();
        public_key.push(".pub");
        if let Ok(key) = tokio::fs::read_to_string(PathBuf::from(public_key)).await {
            env.insert("PUBLIC_KEY".to_string(), key.trim().to_string());
        }
        if let Some(ref token) = self.settings.hf_token {
            env.insert("HF_TOKEN".to_string(), token.clone());
        }
        env
    }

    /// Create on the tier's cloud; community capacity exhaustion falls back to
    /// secure once
    async fn create_with_fallback(&self, tier: &Tier) -> Result<(String, CloudType), PodError> {
        let env = self.pod_env().await;
        let request = CreateRequest {
            tier,
            cloud_type: tier.cloud_type,
            env,
        };
        match self.provider.create_pod(&request).await {
            Ok(id) => Ok((id, tier.cloud_type)),
            Err(e)
                if tier.cloud_type == CloudType::Community
                    && e.class() == ErrorClass::ResourceExhausted =>
            {
                warn!("{} on COMMUNITY cloud, retrying on SECURE", e);
                let request = CreateRequest {
                    cloud_type: CloudType::Secure,
                    ..request
                };
                let id = self.provider.create_pod(&request).await?;
                Ok((id, CloudType::Secure))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll describe until the pod runs with a public SSH endpoint
    async fn wait_for_endpoint(&self, pod_id: &str) -> Result<PodDescription, PodError> {
        let provision = &self.settings.provision;
        let started = Instant::now();
        let deadline = Duration::from_secs(provision.timeout_secs);

        loop {
            match self.provider.describe(pod_id).await? {
                Some(pod) if pod.ssh_ready() => {
                    info!("Pod {} running after {:?}", pod_id, started.elapsed());
                    return Ok(pod);
                }
                Some(pod) if matches!(pod.status, RemoteStatus::Exited | RemoteStatus::Terminated) => {
                    return Err(ProviderError::InvalidResponse(format!(
                        "pod {} stopped while provisioning ({:?})",
                        pod_id, pod.status
                    ))
                    .into());
                }
                Some(pod) => debug!("Pod {} is {:?}, waiting", pod_id, pod.status),
                None => return Err(ProviderError::NotFound(pod_id.to_string()).into()),
            }

            if started.elapsed() >= deadline {
                return Err(PodError::ProvisionTimeout {
                    pod_id: pod_id.to_string(),
                    waited_secs: provision.timeout_secs,
                });
            }
            tokio::time::sleep(Duration::from_secs(provision.poll_secs)).await;
        }
    }

    async fn upload_local(
        &self,
        handle: &ConnectionHandle,
        local: &Path,
        remote: &str,
    ) -> Result<(), PodError> {
        let contents = tokio::fs::read(local).await?;
        handle.transport().write_file(remote, &contents).await?;
        debug!("Uploaded {} to {}", local.display(), remote);
        Ok(())
    }

    /// Upload the tier's scripts (and .env) and launch the startup script
    /// detached, logging to the tier's startup log
    async fn trigger_startup(&self, handle: &ConnectionHandle, tier: &Tier) -> Result<(), PodError> {
        let scripts_dir = &self.settings.scripts_dir;
        let startup_remote = tier.remote_script_path();
        self.upload_local(handle, &scripts_dir.join(&tier.startup_script), &startup_remote)
            .await?;

        let mut executables = vec![shell_escape(&startup_remote)];
        if let Some(ref setup) = tier.setup_script {
            let remote = format!("{}/{}", WORKSPACE, setup);
            self.upload_local(handle, &scripts_dir.join(setup), &remote).await?;
            executables.push(shell_escape(&remote));
        }
        if tokio::fs::try_exists(&self.settings.env_file).await.unwrap_or(false) {
            self.upload_local(handle, &self.settings.env_file, &format!("{}/.env", WORKSPACE))
                .await?;
        }

        let command = format!(
            "chmod +x {} && cd {} && nohup bash {} > {} 2>&1 < /dev/null &",
            executables.join(" "),
            WORKSPACE,
            shell_escape(&startup_remote),
            shell_escape(&tier.startup_log)
        );
        let output = self.connections.run_with_reconnect(handle, &command).await?;
        if !output.success() {
            return Err(PodError::RemoteCommand {
                code: output.exit_code.unwrap_or_default(),
                stderr: output.stderr,
            });
        }
        info!(
            "Started {} on pod {}, logging to {}",
            tier.startup_script,
            handle.pod_id(),
            tier.startup_log
        );
        Ok(())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Open the tier's tunnels and start the status monitor. Returns the
    /// existing tunnels when a session is already open.
    pub async fn connect_session(&self, pod_id: &str) -> Result<Vec<TunnelInfo>, PodError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(pod_id) {
            return Ok(session.bridge.tunnels());
        }

        let record = self.record(pod_id)?;
        let tier = self.tier_for(&record)?;
        let handle = self.connections.connect(pod_id).await?;
        let bridge = TunnelBridge::open(
            self.connections.clone(),
            self.registry.clone(),
            handle.clone(),
            &tier,
            &self.settings.tunnels,
        )
        .await?;
        let status = StatusMonitor::spawn(
            self.connections.clone(),
            self.registry.clone(),
            handle,
            Duration::from_secs(self.settings.status.interval_secs.max(1)),
            self.settings.status.max_consecutive_failures,
        );

        let tunnels = bridge.tunnels();
        sessions.insert(pod_id.to_string(), Session { bridge, status });
        drop(sessions);
        self.persist().await;
        Ok(tunnels)
    }

    /// Close the session's tunnels and stop its monitor and log watches. The
    /// control connection stays up. Returns false when there was no tunnel
    /// session.
    pub async fn disconnect_session(&self, pod_id: &str) -> bool {
        let closed = self.close_session(pod_id).await;
        if closed {
            self.persist().await;
        }
        closed
    }

    /// Stop every log watch started for the pod and wait for each to exit
    async fn stop_watchers(&self, pod_id: &str) {
        let stoppers = self.watchers.lock().await.remove(pod_id).unwrap_or_default();
        if stoppers.is_empty() {
            return;
        }
        join_all(stoppers.iter().map(|w| w.stop())).await;
        info!("Stopped {} log watches for pod {}", stoppers.len(), pod_id);
    }

    async fn close_session(&self, pod_id: &str) -> bool {
        self.stop_watchers(pod_id).await;
        let session = self.sessions.lock().await.remove(pod_id);
        match session {
            Some(mut session) => {
                session.status.stop().await;
                session.bridge.close().await;
                info!("Session for pod {} closed", pod_id);
                true
            }
            None => false,
        }
    }

    pub async fn session_tunnels(&self, pod_id: &str) -> Option<Vec<TunnelInfo>> {
        self.sessions
            .lock()
            .await
            .get(pod_id)
            .map(|s| s.bridge.tunnels())
    }

    /// Latest telemetry from the session's monitor, None when stale or absent
    pub async fn latest_snapshot(&self, pod_id: &str) -> Option<ResourceSnapshot> {
        self.sessions
            .lock()
            .await
            .get(pod_id)
            .filter(|s| !s.status.is_stale())
            .and_then(|s| s.status.latest())
    }

    // ========================================================================
    // Remote operations
    // ========================================================================

    /// Log to follow: the service log once it exists, else the startup log
    async fn log_target(&self, handle: &ConnectionHandle, tier: &Tier) -> String {
        if let Some(ref service_log) = tier.service_log {
            let probe = format!("test -f {}", shell_escape(service_log));
            match self.connections.run(handle, &probe).await {
                Ok(output) if output.success() => return service_log.clone(),
                Ok(_) => {}
                Err(e) => debug!("Probing {} failed: {}", service_log, e),
            }
        }
        tier.startup_log.clone()
    }

    pub async fn watch(&self, pod_id: &str) -> Result<LogWatcher, PodError> {
        let tier = self.tier_for(&self.record(pod_id)?)?;
        let handle = self.connections.connect(pod_id).await?;
        let path = self.log_target(&handle, &tier).await;
        let watcher = LogWatcher::start(self.connections.clone(), handle, &path).await?;

        let mut watchers = self.watchers.lock().await;
        let running = watchers.entry(pod_id.to_string()).or_default();
        running.retain(|w| !w.is_finished());
        running.push(watcher.stopper());
        Ok(watcher)
    }

    /// One telemetry sample
    pub async fn status(&self, pod_id: &str) -> Result<ResourceSnapshot, PodError> {
        let handle = self.connections.connect(pod_id).await?;
        Ok(monitor::sample(&self.connections, &handle).await?)
    }

    pub async fn pull(
        &self,
        pod_id: &str,
        remote_dir: Option<&str>,
        local_dir: Option<&Path>,
    ) -> Result<PullReport, PodError> {
        let sync = &self.settings.sync;
        let handle = self.connections.connect(pod_id).await?;
        Ok(sftp::pull(
            &self.connections,
            &handle,
            remote_dir.unwrap_or(&sync.pull_remote_dir),
            local_dir.unwrap_or(&sync.pull_local_dir),
            Duration::from_secs(sync.chunk_timeout_secs),
        )
        .await?)
    }

    /// Upload local files into `remote_dir` (the workflows directory by
    /// default). Per-file failures are listed in the report.
    pub async fn push(
        &self,
        pod_id: &str,
        files: &[PathBuf],
        remote_dir: Option<&str>,
    ) -> Result<PushReport, PodError> {
        let remote_dir = remote_dir
            .unwrap_or(&self.settings.sync.push_remote_dir)
            .trim_end_matches('/')
            .to_string();
        let handle = self.connections.connect(pod_id).await?;

        let mkdir = self
            .connections
            .run_with_reconnect(&handle, &format!("mkdir -p {}", shell_escape(&remote_dir)))
            .await?;
        if !mkdir.success() {
            return Err(PodError::RemoteCommand {
                code: mkdir.exit_code.unwrap_or_default(),
                stderr: mkdir.stderr,
            });
        }

        let mut report = PushReport::default();
        let mut reconnected = false;
        for local in files {
            let label = local.display().to_string();
            let Some(name) = local.file_name().and_then(|n| n.to_str()) else {
                report.failed.push((label, "not a file name".into()));
                continue;
            };
            let remote = format!("{}/{}", remote_dir, name);

            let mut result = self.upload_local(&handle, local, &remote).await;
            if result.is_err() && !handle.is_connected() && !reconnected {
                reconnected = true;
                warn!("Connection lost while pushing {}, reconnecting once", label);
                self.connections.reconnect(&handle).await?;
                result = self.upload_local(&handle, local, &remote).await;
            }

            match result {
                Ok(()) => {
                    info!("Pushed {} to {}", label, remote);
                    report.uploaded.push(remote);
                }
                Err(e) => {
                    warn!("Failed to push {}: {}", label, e);
                    report.failed.push((label, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    pub async fn exec(&self, pod_id: &str, command: &str) -> Result<ExecOutput, PodError> {
        let handle = self.connections.connect(pod_id).await?;
        Ok(self.connections.run_with_reconnect(&handle, command).await?)
    }

    pub async fn shell(&self, pod_id: &str, term: &str, cols: u32, rows: u32) -> Result<RemoteShell, PodError> {
        let handle = self.connections.connect(pod_id).await?;
        Ok(handle.transport().open_shell(term, cols, rows).await?)
    }

    /// Upload a `.blend` file and render all of its frames headless. The
    /// returned process streams Blender's output; frames stay on the pod
    /// until pulled.
    pub async fn render(&self, pod_id: &str, blend: &Path) -> Result<RemoteProcess, PodError> {
        let name = blend
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| {
                Path::new(n)
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("blend"))
            })
            .ok_or_else(|| PodError::NotABlendFile(blend.display().to_string()))?;

        let handle = self.connections.connect(pod_id).await?;
        let installed = self
            .connections
            .run_with_reconnect(&handle, &format!("test -x {}", shell_escape(BLENDER_BIN)))
            .await?;
        if !installed.success() {
            return Err(PodError::BlenderMissing {
                pod_id: pod_id.to_string(),
                path: BLENDER_BIN.to_string(),
            });
        }

        let remote = format!("{}/{}", WORKSPACE, name);
        self.upload_local(&handle, blend, &remote).await?;

        let command = format!(
            "cd {} && exec {} -b {} -a 2>&1",
            WORKSPACE,
            shell_escape(BLENDER_BIN),
            shell_escape(&remote)
        );
        let process = handle.transport().spawn(&command).await?;
        info!("Rendering {} on pod {}", remote, pod_id);
        Ok(process)
    }

    // ========================================================================
    // Cost
    // ========================================================================

    /// Sample every billable pod and sum the burn
    pub async fn wallet(&self) -> Wallet {
        let burn = monitor::cost::sample_all(
            &self.provider,
            &self.registry,
            self.settings.cost.burn_threshold_per_hour,
        )
        .await;
        Wallet {
            burn,
            pods: self.registry.list_billable(),
        }
    }

    pub fn spawn_cost_monitor(&self) -> CostMonitor {
        CostMonitor::spawn(
            self.provider.clone(),
            self.registry.clone(),
            Duration::from_secs(self.settings.cost.interval_secs.max(1)),
            self.settings.cost.burn_threshold_per_hour,
        )
    }

    // ========================================================================
    // Terminate
    // ========================================================================

    /// Stop everything for the pod and terminate it with the provider.
    ///
    /// Idempotent: a Terminated pod is left alone. When the provider never
    /// confirms, the pod stays Terminating with `terminate_pending` set.
    pub async fn terminate(&self, pod_id: &str) -> Result<(), PodError> {
        let state = self.record(pod_id)?.state;
        if state == PodState::Terminated {
            info!("Pod {} already terminated", pod_id);
            return Ok(());
        }

        self.close_session(pod_id).await;
        if state != PodState::Terminating {
            self.registry
                .transition(pod_id, PodState::Terminating, Actor::Terminator)?;
        }
        self.connections.disconnect(pod_id).await;
        self.persist().await;

        match self
            .provider
            .terminate_confirmed(pod_id, &self.terminate_policy)
            .await
        {
            Ok(()) => {
                self.registry.set_terminate_pending(pod_id, false)?;
                self.registry
                    .transition(pod_id, PodState::Terminated, Actor::Terminator)?;
                info!("Pod {} terminated", pod_id);
                self.persist().await;
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                error!("Pod {} is still billing: terminate failed: {}", pod_id, reason);
                self.registry.set_terminate_pending(pod_id, true)?;
                self.registry.update(pod_id, |r| r.last_error = Some(reason.clone()))?;
                self.events().emit(PodEvent::TerminateFailed {
                    pod_id: pod_id.to_string(),
                    error: reason.clone(),
                });
                self.persist().await;
                Err(PodError::TerminateFailed {
                    pod_id: pod_id.to_string(),
                    reason,
                })
            }
        }
    }

    // ========================================================================
    // Startup reconcile
    // ========================================================================

    /// Load the persisted pod table, reconcile it with the provider, track
    /// running tier pods we do not know about, and finish pending terminates
    pub async fn reconcile(&self) -> Result<Vec<PodRecord>, PodError> {
        if let Some(ref store) = self.store {
            for mut record in store.load().await? {
                if self.registry.contains(&record.id) {
                    continue;
                }
                match self.provider.describe(&record.id).await {
                    Ok(remote) => {
                        let state = reconciled_state(record.state, remote.as_ref().map(|d| d.status));
                        if let Some(pod) = remote {
                            if pod.host.is_some() && pod.ssh_port.is_some() {
                                record.host = pod.host;
                                record.ssh_port = pod.ssh_port;
                            }
                        }
                        if state != record.state {
                            info!("Pod {} resumes as {} (was {})", record.id, state, record.state);
                            record.state = state;
                            record.state_since = Utc::now();
                        }
                    }
                    Err(e) => {
                        warn!("Could not describe pod {}: {}", record.id, e);
                        if record.state.is_addressable() {
                            record.state = PodState::Booting;
                        }
                    }
                }
                self.registry.restore(record);
            }
        }

        match self.provider.list_pods().await {
            Ok(pods) => {
                for pod in pods.iter().filter(|p| p.ssh_ready() && !self.registry.contains(&p.id)) {
                    if let Some(tier) = self.templates.by_pod_name(&pod.name).cloned() {
                        self.adopt(pod, &tier)?;
                    }
                }
            }
            Err(e) => warn!("Could not list pods: {}", e),
        }

        for record in self.registry.list_by_state(PodState::Terminating) {
            info!("Retrying terminate of pod {}", record.id);
            if let Err(e) = self.terminate(&record.id).await {
                warn!("{}", e);
            }
        }

        self.persist().await;
        Ok(self.registry.list())
    }
}
