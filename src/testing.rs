//! Scripted fakes for unit tests: connector, transport and provider.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::templates::CloudType;
use crate::provider::{CreateRequest, PodDescription, Provider, ProviderError, RemoteStatus};
use crate::ssh::{
    BoxedReader, BoxedStream, Connector, Established, ExecOutput, ProcessOutput, RemoteProcess,
    RemoteTransport, SshError, SshTarget,
};

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// How a remote port answers direct-tcpip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortBehavior {
    /// Accepts and echoes bytes back
    Echo,
    /// Nothing listening yet
    Refuse,
    /// Never answers
    Hang,
    /// The channel open fails at the transport level
    Fail,
}

/// Scripted exec result
#[derive(Debug, Clone)]
pub enum ExecResponse {
    Output(ExecOutput),
    Timeout,
    Disconnected,
    Hang,
}

impl ExecResponse {
    pub fn stdout(stdout: &str) -> Self {
        ExecResponse::Output(ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    pub fn exit(code: u32, stderr: &str) -> Self {
        ExecResponse::Output(ExecOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(code),
        })
    }
}

/// How a spawned process ends after its scripted output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnEnd {
    /// Keeps running until closed
    Hang,
    /// The whole connection drops
    DropConnection,
    /// The process exits with this code
    Exit(u32),
}

#[derive(Debug, Clone)]
pub struct SpawnScript {
    pub output: Vec<String>,
    pub end: SpawnEnd,
}

#[derive(Debug, Clone)]
pub struct MockFile {
    pub data: Vec<u8>,
    pub mtime: i64,
}

/// Behaviour shared by every connection made from the same script
#[derive(Default)]
struct Script {
    responses: Mutex<Vec<(String, ExecResponse)>>,
    exec_log: Mutex<Vec<String>>,
    files: Mutex<BTreeMap<String, MockFile>>,
    unreadable: Mutex<Vec<String>>,
    /// path -> bytes served before the read fails, consumed on use
    truncated_reads: Mutex<HashMap<String, usize>>,
    ports: Mutex<HashMap<u16, PortBehavior>>,
    spawns: Mutex<VecDeque<SpawnScript>>,
    spawn_log: Mutex<Vec<String>>,
    open_streams: Arc<AtomicUsize>,
    stream_opens: AtomicUsize,
}

struct ConnState {
    connected: AtomicBool,
    disconnect_tx: broadcast::Sender<()>,
}

impl ConnState {
    fn new() -> Arc<Self> {
        let (disconnect_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            connected: AtomicBool::new(true),
            disconnect_tx,
        })
    }
}

/// In-memory [`RemoteTransport`]
#[derive(Clone)]
pub struct MockTransport {
    script: Arc<Script>,
    conn: Arc<ConnState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Script::default()),
            conn: ConnState::new(),
        }
    }

    /// New live connection sharing this one's script
    pub fn fork(&self) -> Self {
        Self {
            script: self.script.clone(),
            conn: ConnState::new(),
        }
    }

    /// First registered pattern contained in the command wins
    pub fn on_exec(&self, pattern: &str, response: ExecResponse) {
        let mut responses = self.script.responses.lock();
        responses.retain(|(p, _)| p != pattern);
        responses.push((pattern.to_string(), response));
    }

    pub fn exec_log(&self) -> Vec<String> {
        self.script.exec_log.lock().clone()
    }

    pub fn add_file(&self, path: &str, data: &[u8], mtime: i64) {
        self.script.files.lock().insert(
            path.to_string(),
            MockFile {
                data: data.to_vec(),
                mtime,
            },
        );
    }

    pub fn file(&self, path: &str) -> Option<MockFile> {
        self.script.files.lock().get(path).cloned()
    }

    pub fn make_unreadable(&self, path: &str) {
        self.script.unreadable.lock().push(path.to_string());
    }

    /// Next read of `path` fails after `bytes`
    pub fn truncate_next_read(&self, path: &str, bytes: usize) {
        self.script.truncated_reads.lock().insert(path.to_string(), bytes);
    }

    pub fn set_port(&self, port: u16, behavior: PortBehavior) {
        self.script.ports.lock().insert(port, behavior);
    }

    pub fn push_spawn(&self, output: &[&str], end: SpawnEnd) {
        self.script.spawns.lock().push_back(SpawnScript {
            output: output.iter().map(|s| s.to_string()).collect(),
            end,
        });
    }

    pub fn spawn_log(&self) -> Vec<String> {
        self.script.spawn_log.lock().clone()
    }

    /// Forwarded streams currently open
    pub fn open_streams(&self) -> usize {
        self.script.open_streams.load(Ordering::SeqCst)
    }

    /// Total direct-tcpip channels ever opened
    pub fn stream_opens(&self) -> usize {
        self.script.stream_opens.load(Ordering::SeqCst)
    }

    /// Simulate the peer dropping the connection
    pub fn drop_connection(&self) {
        if self.conn.connected.swap(false, Ordering::SeqCst) {
            let _ = self.conn.disconnect_tx.send(());
        }
    }

    fn check_connected(&self) -> Result<(), SshError> {
        if self.conn.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SshError::Disconnected)
        }
    }

    fn find_listing(&self, command: &str) -> Option<ExecOutput> {
        if !command.starts_with("find ") {
            return None;
        }
        let dir = command.split('\'').nth(1)?.trim_end_matches('/').to_string();
        let prefix = format!("{}/", dir);
        let files = self.script.files.lock();
        let stdout: String = files
            .iter()
            .filter_map(|(path, file)| {
                path.strip_prefix(&prefix).map(|rel| {
                    format!("{}\t{}\t{}.0000000000\n", rel, file.data.len(), file.mtime)
                })
            })
            .collect();
        Some(ExecOutput {
            stdout,
            stderr: String::new(),
            exit_code: Some(0),
        })
    }
}

/// Stream wrapper that tracks how many forwarded streams are alive
struct CountedStream {
    inner: DuplexStream,
    counter: Arc<AtomicUsize>,
}

impl Drop for CountedStream {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncRead for CountedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Reader that always fails, appended to truncated reads
struct BrokenReader;

impl AsyncRead for BrokenReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        self.check_connected()?;
        self.script.exec_log.lock().push(command.to_string());

        let scripted = self
            .script
            .responses
            .lock()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, response)| response.clone());

        match scripted {
            Some(ExecResponse::Output(out)) => Ok(out),
            Some(ExecResponse::Timeout) => Err(SshError::Timeout("scripted".into())),
            Some(ExecResponse::Disconnected) => {
                self.drop_connection();
                Err(SshError::Disconnected)
            }
            Some(ExecResponse::Hang) => {
                std::future::pending::<()>().await;
                Err(SshError::Timeout("unreachable".into()))
            }
            None => Ok(self.find_listing(command).unwrap_or(ExecOutput {
                exit_code: Some(0),
                ..Default::default()
            })),
        }
    }

    async fn spawn(&self, command: &str) -> Result<RemoteProcess, SshError> {
        self.check_connected()?;
        self.script.spawn_log.lock().push(command.to_string());

        let script = self.script.spawns.lock().pop_front().unwrap_or(SpawnScript {
            output: Vec::new(),
            end: SpawnEnd::Hang,
        });

        let (out_tx, out_rx) = mpsc::channel(64);
        let (close_tx, close_rx) = oneshot::channel::<()>();
        let this = self.clone();
        let mut disconnected = self.conn.disconnect_tx.subscribe();

        tokio::spawn(async move {
            for chunk in script.output {
                if out_tx.send(ProcessOutput::Stdout(chunk.into_bytes())).await.is_err() {
                    return;
                }
            }
            match script.end {
                SpawnEnd::Hang => {
                    tokio::select! {
                        _ = close_rx => {
                            let _ = out_tx.send(ProcessOutput::Exit(None)).await;
                        }
                        _ = disconnected.recv() => {}
                    }
                }
                SpawnEnd::DropConnection => {
                    // Let the reader drain what was sent first
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    this.drop_connection();
                }
                SpawnEnd::Exit(code) => {
                    let _ = out_tx.send(ProcessOutput::Exit(Some(code))).await;
                }
            }
        });

        Ok(RemoteProcess::new(out_rx, close_tx))
    }

    async fn open_direct_tcpip(&self, _host: &str, port: u16) -> Result<BoxedStream, SshError> {
        self.check_connected()?;
        let behavior = self
            .script
            .ports
            .lock()
            .get(&port)
            .copied()
            .unwrap_or(PortBehavior::Echo);

        match behavior {
            PortBehavior::Refuse => Err(SshError::ChannelOpenRefused("ConnectFailed".into())),
            PortBehavior::Fail => Err(SshError::ChannelError(format!("port {} unavailable", port))),
            PortBehavior::Hang => {
                std::future::pending::<()>().await;
                Err(SshError::Timeout("unreachable".into()))
            }
            PortBehavior::Echo => {
                let (local, mut remote) = tokio::io::duplex(4096);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match remote.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if remote.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
                self.script.open_streams.fetch_add(1, Ordering::SeqCst);
                self.script.stream_opens.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(CountedStream {
                    inner: local,
                    counter: self.script.open_streams.clone(),
                }))
            }
        }
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<BoxedReader, SshError> {
        self.check_connected()?;
        if self.script.unreadable.lock().iter().any(|p| p == path) {
            return Err(SshError::SftpError(format!("permission denied: {}", path)));
        }
        let data = self
            .script
            .files
            .lock()
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| SshError::SftpError(format!("no such file: {}", path)))?;

        let start = (offset as usize).min(data.len());
        let truncated = self.script.truncated_reads.lock().remove(path);
        match truncated {
            Some(limit) => {
                let end = limit.max(start).min(data.len());
                let head = io::Cursor::new(data[start..end].to_vec());
                Ok(Box::new(head.chain(BrokenReader)))
            }
            None => Ok(Box::new(io::Cursor::new(data[start..].to_vec()))),
        }
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SshError> {
        self.check_connected()?;
        self.add_file(path, contents, 0);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.connected.load(Ordering::SeqCst)
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.conn.disconnect_tx.subscribe()
    }

    async fn disconnect(&self) {
        self.drop_connection();
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Connector that fails a scripted number of times before handing out forks
/// of a template transport
pub struct MockConnector {
    template: MockTransport,
    fail_first: AtomicU32,
    auth_fails: AtomicBool,
    attempts: AtomicU32,
    host_key: Mutex<String>,
    current: Mutex<Option<MockTransport>>,
}

impl MockConnector {
    pub fn new(template: MockTransport) -> Self {
        Self {
            template,
            fail_first: AtomicU32::new(0),
            auth_fails: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            host_key: Mutex::new("SHA256:mock".to_string()),
            current: Mutex::new(None),
        }
    }

    /// Refuse the next `n` attempts
    pub fn fail_first(self, n: u32) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn never_accept(self) -> Self {
        self.fail_first(u32::MAX)
    }

    pub fn reject_auth(self) -> Self {
        self.auth_fails.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_host_key(&self, key: &str) {
        *self.host_key.lock() = key.to_string();
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Transport handed out by the last successful connect
    pub fn current(&self) -> Option<MockTransport> {
        self.current.lock().clone()
    }

    pub fn template(&self) -> &MockTransport {
        &self.template
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _pod_id: &str, target: &SshTarget) -> Result<Established, SshError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(SshError::IoError(io::Error::from(io::ErrorKind::ConnectionRefused)));
        }
        if self.auth_fails.load(Ordering::SeqCst) {
            return Err(SshError::AuthenticationFailed("publickey rejected".into()));
        }

        let host_key = self.host_key.lock().clone();
        if let Some(ref pinned) = target.pinned_host_key {
            if *pinned != host_key {
                return Err(SshError::HostKeyMismatch {
                    expected: pinned.clone(),
                    actual: host_key,
                });
            }
        }

        let transport = self.template.fork();
        *self.current.lock() = Some(transport.clone());
        Ok(Established {
            transport: Arc::new(transport),
            host_key,
        })
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// In-memory cloud
#[derive(Default)]
pub struct MockProvider {
    pods: Mutex<BTreeMap<String, PodDescription>>,
    /// pod id -> describes left before it reports running
    booting: Mutex<HashMap<String, u32>>,
    boot_describes: AtomicU32,
    next_id: AtomicU32,
    community_exhausted: AtomicBool,
    create_failures: Mutex<VecDeque<ProviderError>>,
    describe_failures: Mutex<VecDeque<ProviderError>>,
    terminate_failures: Mutex<VecDeque<ProviderError>>,
    created: Mutex<Vec<(String, CloudType)>>,
    create_calls: AtomicU32,
    describe_calls: AtomicU32,
    terminate_calls: AtomicU32,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_running(&self, id: &str, name: &str, cost_per_hr: f64) {
        self.pods.lock().insert(
            id.to_string(),
            PodDescription {
                id: id.to_string(),
                name: name.to_string(),
                status: RemoteStatus::Running,
                host: Some("127.0.0.1".to_string()),
                ssh_port: Some(22022),
                cost_per_hr,
                gpu: Some("RTX A6000".to_string()),
            },
        );
    }

    pub fn set_status(&self, id: &str, status: RemoteStatus) {
        if let Some(pod) = self.pods.lock().get_mut(id) {
            pod.status = status;
        }
    }

    pub fn set_cost(&self, id: &str, cost_per_hr: f64) {
        if let Some(pod) = self.pods.lock().get_mut(id) {
            pod.cost_per_hr = cost_per_hr;
        }
    }

    /// New pods report pending for `n` describes before running
    pub fn boot_after(&self, n: u32) {
        self.boot_describes.store(n, Ordering::SeqCst);
    }

    pub fn exhaust_community(&self) {
        self.community_exhausted.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_creates(&self, n: usize, error: ProviderError) {
        push_failures(&self.create_failures, n, error);
    }

    pub fn fail_next_describes(&self, n: usize, error: ProviderError) {
        push_failures(&self.describe_failures, n, error);
    }

    pub fn fail_next_terminates(&self, n: usize, error: ProviderError) {
        push_failures(&self.terminate_failures, n, error);
    }

    pub fn pod(&self, id: &str) -> Option<PodDescription> {
        self.pods.lock().get(id).cloned()
    }

    pub fn created(&self) -> Vec<(String, CloudType)> {
        self.created.lock().clone()
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> u32 {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> u32 {
        self.terminate_calls.load(Ordering::SeqCst)
    }
}

/// Queue `n` copies of a failure. ProviderError is not Clone, so copies are
/// rebuilt from the display text with the same class.
fn push_failures(queue: &Mutex<VecDeque<ProviderError>>, n: usize, error: ProviderError) {
    let mut queue = queue.lock();
    for _ in 1..n {
        queue.push_back(same_class(&error));
    }
    if n > 0 {
        queue.push_back(error);
    }
}

fn same_class(error: &ProviderError) -> ProviderError {
    match error {
        ProviderError::MissingApiKey => ProviderError::MissingApiKey,
        ProviderError::Unauthorized(m) => ProviderError::Unauthorized(m.clone()),
        ProviderError::RateLimited => ProviderError::RateLimited,
        ProviderError::Http { status, message } => ProviderError::Http {
            status: *status,
            message: message.clone(),
        },
        ProviderError::Network(m) => ProviderError::Network(m.clone()),
        ProviderError::ResourceExhausted(m) => ProviderError::ResourceExhausted(m.clone()),
        ProviderError::NotFound(m) => ProviderError::NotFound(m.clone()),
        ProviderError::InvalidResponse(m) => ProviderError::InvalidResponse(m.clone()),
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn create_pod(&self, request: &CreateRequest<'_>) -> Result<String, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.create_failures.lock().pop_front() {
            return Err(e);
        }
        if request.cloud_type == CloudType::Community
            && self.community_exhausted.load(Ordering::SeqCst)
        {
            return Err(ProviderError::ResourceExhausted(
                "no community instances".into(),
            ));
        }

        let id = format!("pod-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.created
            .lock()
            .push((request.tier.pod_name.clone(), request.cloud_type));
        self.pods.lock().insert(
            id.clone(),
            PodDescription {
                id: id.clone(),
                name: request.tier.pod_name.clone(),
                status: RemoteStatus::Pending,
                host: None,
                ssh_port: None,
                cost_per_hr: 0.5,
                gpu: Some(request.tier.gpu_type_id.clone()),
            },
        );
        self.booting
            .lock()
            .insert(id.clone(), self.boot_describes.load(Ordering::SeqCst));
        Ok(id)
    }

    async fn describe(&self, pod_id: &str) -> Result<Option<PodDescription>, ProviderError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.describe_failures.lock().pop_front() {
            return Err(e);
        }

        let mut booting = self.booting.lock();
        if let Some(left) = booting.get_mut(pod_id) {
            if *left == 0 {
                booting.remove(pod_id);
                if let Some(pod) = self.pods.lock().get_mut(pod_id) {
                    pod.status = RemoteStatus::Running;
                    pod.host = Some("127.0.0.1".to_string());
                    pod.ssh_port = Some(22022);
                }
            } else {
                *left -= 1;
            }
        }
        Ok(self.pods.lock().get(pod_id).cloned())
    }

    async fn list_pods(&self) -> Result<Vec<PodDescription>, ProviderError> {
        Ok(self.pods.lock().values().cloned().collect())
    }

    async fn terminate(&self, pod_id: &str) -> Result<(), ProviderError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.terminate_failures.lock().pop_front() {
            return Err(e);
        }
        match self.pods.lock().remove(pod_id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound(pod_id.to_string())),
        }
    }
}
