//! Remote transport over a pod's control connection
//!
//! [`RemoteTransport`] is the seam between the session manager and russh:
//! one-shot commands, long-running processes, direct-tcpip streams and SFTP
//! reads/writes, all multiplexed over the single control connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::{self, SshTarget};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};

/// Bidirectional byte stream (a forwarded TCP connection)
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Result of a one-shot remote command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// None when the remote side closed without reporting a status
    pub exit_code: Option<u32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Output of a long-running remote process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Last message; the process is gone
    Exit(Option<u32>),
}

/// Handle to a remote process started with [`RemoteTransport::spawn`]
#[derive(Debug)]
pub struct RemoteProcess {
    output: mpsc::Receiver<ProcessOutput>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl RemoteProcess {
    pub fn new(output: mpsc::Receiver<ProcessOutput>, close_tx: oneshot::Sender<()>) -> Self {
        Self {
            output,
            close_tx: Some(close_tx),
        }
    }

    /// Next chunk of output; None once the channel is gone
    pub async fn recv(&mut self) -> Option<ProcessOutput> {
        self.output.recv().await
    }

    /// Close the channel. The remote process sees its stdio go away.
    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        self.close();
    }
}

/// Input to an interactive shell
#[derive(Debug, Clone, PartialEq)]
pub enum ShellInput {
    Data(Vec<u8>),
    Resize(u32, u32),
    Eof,
}

/// Interactive PTY shell
pub struct RemoteShell {
    pub input: mpsc::Sender<ShellInput>,
    pub output: mpsc::Receiver<ProcessOutput>,
}

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run a command to completion
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError>;

    /// Start a command and stream its output
    async fn spawn(&self, command: &str) -> Result<RemoteProcess, SshError>;

    /// Open a direct-tcpip channel to `host:port` as seen from the pod
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<BoxedStream, SshError>;

    /// Open a remote file for reading, starting at `offset`
    async fn open_read(&self, path: &str, offset: u64) -> Result<BoxedReader, SshError>;

    /// Create or truncate a remote file with `contents`
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SshError>;

    async fn open_shell(&self, _term: &str, _cols: u32, _rows: u32) -> Result<RemoteShell, SshError> {
        Err(SshError::Unsupported("interactive shell".into()))
    }

    fn is_connected(&self) -> bool;

    /// Fires once when the connection goes away
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;

    /// Close the connection and wait (briefly) for the owner task to confirm
    async fn disconnect(&self);
}

/// A freshly established control connection
pub struct Established {
    pub transport: Arc<dyn RemoteTransport>,
    /// Server host key fingerprint seen during the handshake
    pub host_key: String,
}

/// Makes control connections. One attempt per call; retries live above.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, pod_id: &str, target: &SshTarget) -> Result<Established, SshError>;
}

/// russh-backed connector
#[derive(Debug, Default, Clone)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, pod_id: &str, target: &SshTarget) -> Result<Established, SshError> {
        let (handle, host_key) = client::connect(target).await?;
        let controller = spawn_handle_owner_task(handle, pod_id.to_string());
        Ok(Established {
            transport: Arc::new(SshTransport::new(controller, pod_id.to_string())),
            host_key,
        })
    }
}

const DISCONNECT_CONFIRM: Duration = Duration::from_secs(2);

/// [`RemoteTransport`] over a [`HandleController`]
pub struct SshTransport {
    controller: HandleController,
    pod_id: String,
    sftp: tokio::sync::Mutex<Option<Arc<SftpSession>>>,
}

impl SshTransport {
    pub fn new(controller: HandleController, pod_id: String) -> Self {
        Self {
            controller,
            pod_id,
            sftp: tokio::sync::Mutex::new(None),
        }
    }

    pub fn controller(&self) -> &HandleController {
        &self.controller
    }

    /// Cached SFTP subsystem session, opened on first use
    async fn sftp(&self) -> Result<Arc<SftpSession>, SshError> {
        let mut guard = self.sftp.lock().await;
        if let Some(ref sftp) = *guard {
            return Ok(sftp.clone());
        }

        info!("Opening SFTP subsystem for pod {}", self.pod_id);
        let channel = self.controller.open_session_channel().await?;
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SshError::SftpError(format!("Failed to request SFTP subsystem: {}", e))
        })?;
        let sftp = Arc::new(SftpSession::new(channel.into_stream()).await?);
        *guard = Some(sftp.clone());
        Ok(sftp)
    }

    async fn reset_sftp(&self) {
        *self.sftp.lock().await = None;
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        let mut channel = self.controller.open_session_channel().await?;

        debug!("exec on pod {}: {}", self.pod_id, command);
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code: Option<u32> = None;

        // Eof can arrive before ExitStatus; wait for Close
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        if exit_code.is_none() && !self.controller.is_connected() {
            return Err(SshError::Disconnected);
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn spawn(&self, command: &str) -> Result<RemoteProcess, SshError> {
        let mut channel = self.controller.open_session_channel().await?;
        channel.exec(true, command).await?;

        let (out_tx, out_rx) = mpsc::channel::<ProcessOutput>(256);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let pod_id = self.pod_id.clone();

        tokio::spawn(async move {
            let mut exit_code = None;
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        debug!("Closing remote process channel on pod {}", pod_id);
                        let _ = channel.eof().await;
                        let _ = channel.close().await;
                        break;
                    }
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if out_tx.send(ProcessOutput::Stdout(data.to_vec())).await.is_err() {
                                let _ = channel.close().await;
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            let _ = out_tx.send(ProcessOutput::Stderr(data.to_vec())).await;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                        Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    }
                }
            }
            let _ = out_tx.send(ProcessOutput::Exit(exit_code)).await;
        });

        Ok(RemoteProcess::new(out_rx, close_tx))
    }

    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<BoxedStream, SshError> {
        let channel = self
            .controller
            .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<BoxedReader, SshError> {
        let sftp = self.sftp().await?;
        let mut file = match sftp.open(path).await {
            Ok(file) => file,
            Err(e) => {
                if !self.controller.is_connected() {
                    self.reset_sftp().await;
                    return Err(SshError::Disconnected);
                }
                return Err(e.into());
            }
        };
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SshError> {
        let sftp = self.sftp().await?;
        let mut file = match sftp.create(path).await {
            Ok(file) => file,
            Err(e) => {
                if !self.controller.is_connected() {
                    self.reset_sftp().await;
                    return Err(SshError::Disconnected);
                }
                return Err(e.into());
            }
        };
        file.write_all(contents).await?;
        file.shutdown().await?;
        Ok(())
    }

    async fn open_shell(&self, term: &str, cols: u32, rows: u32) -> Result<RemoteShell, SshError> {
        let mut channel = self.controller.open_session_channel().await?;
        channel
            .request_pty(false, term, cols, rows, 0, 0, &[])
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        info!("Interactive shell started on pod {}", self.pod_id);

        let (in_tx, mut in_rx) = mpsc::channel::<ShellInput>(1024);
        let (out_tx, out_rx) = mpsc::channel::<ProcessOutput>(1024);
        let pod_id = self.pod_id.clone();

        tokio::spawn(async move {
            let mut exit_code = None;
            loop {
                tokio::select! {
                    Some(input) = in_rx.recv() => match input {
                        ShellInput::Data(data) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                warn!("Failed to send data to shell on pod {}: {}", pod_id, e);
                                break;
                            }
                        }
                        ShellInput::Resize(cols, rows) => {
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                warn!("Failed to resize PTY: {}", e);
                            }
                        }
                        ShellInput::Eof => {
                            let _ = channel.eof().await;
                        }
                    },
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            let _ = out_tx.send(ProcessOutput::Stdout(data.to_vec())).await;
                        }
                        Some(ChannelMsg::ExtendedData { data, .. }) => {
                            let _ = out_tx.send(ProcessOutput::Stderr(data.to_vec())).await;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                        Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    },
                }
            }
            debug!("Shell channel closed on pod {}", pod_id);
            let _ = out_tx.send(ProcessOutput::Exit(exit_code)).await;
        });

        Ok(RemoteShell {
            input: in_tx,
            output: out_rx,
        })
    }

    fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.controller.subscribe_disconnect()
    }

    async fn disconnect(&self) {
        let mut closed = self.controller.subscribe_disconnect();
        self.reset_sftp().await;
        self.controller.disconnect().await;
        if self.controller.is_connected() {
            let _ = tokio::time::timeout(DISCONNECT_CONFIRM, closed.recv()).await;
        }
    }
}

/// Quote a string for a POSIX shell
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
