//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>` of a pod's control
//! connection. Everything else (exec, log follow, tunnels, SFTP) talks to it
//! through a cloneable [`HandleController`] over an mpsc channel.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, pod_id);
//! let channel = controller.open_session_channel().await?;
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner checks whether the peer closed the connection.
/// Dead peers are found by russh's own keepalive, configured in `client`.
const LIVENESS_CHECK: Duration = Duration::from_secs(1);

/// Requests served by the owner task
pub enum HandleCommand {
    /// Open a session channel (exec, shell, sftp)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (local forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    Disconnect,
}

/// Cloneable front for a pod's control connection
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fired once when the owner task exits
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Controller over a bare command channel (tests drive the receiver)
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self { cmd_tx, disconnect_tx }
    }

    /// Receiver that gets `()` when the SSH connection closes
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(SshError::from)
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(SshError::from)
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// False once the owner task has exited
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Move `handle` into its owner task. The task stops on `Disconnect`, when
/// the peer goes away, or when the last controller is dropped.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, pod_id: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;
        info!(pod = %pod_id, "control connection owner started");

        let mut liveness = tokio::time::interval(LIVENESS_CHECK);

        loop {
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => {
                        info!(pod = %pod_id, "no controllers left, closing");
                        break;
                    }
                },
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!(pod = %pod_id, "control connection closed by peer");
                        break;
                    }
                    continue;
                }
            };

            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!(pod = %pod_id, "session channel opened for a caller that went away");
                    }
                }

                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!(pod = %pod_id, port, "forward channel opened for a caller that went away");
                    }
                }

                HandleCommand::Disconnect => {
                    info!(pod = %pod_id, "disconnect requested");
                    break;
                }
            }
        }

        // Tunnels and log followers hear about it before the socket goes
        let _ = disconnect_tx_clone.send(());

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "podctl closing", "en")
            .await;
        info!(pod = %pod_id, "control connection owner stopped");
    });

    HandleController { cmd_tx, disconnect_tx }
}

/// Fail every queued request so no caller waits on a dead connection
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
