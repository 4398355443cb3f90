//! Log Watcher
//!
//! Follows a remote log file over the control connection and hands out its
//! lines as a [`Stream`]. The remote `tail` reports its pid first so that
//! cancelling kills the follower on the pod rather than just dropping the
//! local reader. A [`WatchStop`] lets the owner of the pod's session stop a
//! watch that somebody else is reading.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{ConnectError, ConnectionHandle, ConnectionManager};
use crate::ssh::{shell_escape, ProcessOutput, RemoteProcess};

const PID_MARKER: &str = "__follow_pid__=";

/// Lines of backlog shown when the watch starts
const BACKLOG_LINES: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Line(String),
    /// The connection dropped and could not be resumed. Always the last item.
    ConnectionLost,
}

/// Shell command that prints its pid, then becomes `tail -F`
pub fn follow_command(path: &str, backlog: u32) -> String {
    format!(
        "echo {}$$; exec tail -n {} -F {} 2>&1",
        PID_MARKER,
        backlog,
        shell_escape(path)
    )
}

/// Stops a running watch from outside its reader. Clones share the same
/// watch; a second `stop` waits for the first to finish.
#[derive(Clone)]
pub struct WatchStop {
    inner: Arc<tokio::sync::Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>>,
}

impl WatchStop {
    fn new(cancel_tx: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(Some((cancel_tx, task)))),
        }
    }

    /// Kill the remote follower and wait until the local task has exited
    pub async fn stop(&self) {
        let mut guard = self.inner.lock().await;
        if let Some((cancel_tx, task)) = guard.take() {
            let _ = cancel_tx.send(());
            let _ = task.await;
        }
    }

    /// True once the watch has ended on its own or been stopped
    pub fn is_finished(&self) -> bool {
        match self.inner.try_lock() {
            Ok(guard) => guard.as_ref().map_or(true, |(_, task)| task.is_finished()),
            Err(_) => false,
        }
    }
}

/// Live follow of one remote file
pub struct LogWatcher {
    path: String,
    rx: mpsc::Receiver<LogEvent>,
    stop: WatchStop,
}

impl LogWatcher {
    /// Start following `path`
    pub async fn start(
        connections: Arc<ConnectionManager>,
        handle: ConnectionHandle,
        path: &str,
    ) -> Result<Self, ConnectError> {
        let process = handle
            .transport()
            .spawn(&follow_command(path, BACKLOG_LINES))
            .await?;
        info!("Watching {} on pod {}", path, handle.pod_id());

        let (tx, rx) = mpsc::channel(256);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(follow_loop(
            connections,
            handle,
            path.to_string(),
            process,
            tx,
            cancel_rx,
        ));

        Ok(Self {
            path: path.to_string(),
            rx,
            stop: WatchStop::new(cancel_tx, task),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn stopper(&self) -> WatchStop {
        self.stop.clone()
    }

    /// Next event, or None once the watch has ended
    pub async fn next_event(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }

    /// Kill the remote follower and wait for the local task. The watcher
    /// yields nothing afterwards.
    pub async fn cancel(&mut self) {
        self.stop.stop().await;
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Stream for LogWatcher {
    type Item = LogEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LogEvent>> {
        self.rx.poll_recv(cx)
    }
}

/// Splits raw output into lines and picks out the pid marker
#[derive(Default)]
struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }
}

enum Outcome {
    Cancelled,
    ReaderGone,
    Ended,
}

async fn follow_loop(
    connections: Arc<ConnectionManager>,
    handle: ConnectionHandle,
    path: String,
    mut process: RemoteProcess,
    tx: mpsc::Sender<LogEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let pod_id = handle.pod_id().to_string();
    let mut resumed = false;

    loop {
        let mut pid: Option<u32> = None;
        let outcome = pump(&mut process, &tx, &mut cancel_rx, &mut pid).await;

        match outcome {
            Outcome::Cancelled | Outcome::ReaderGone => {
                kill_follower(&connections, &handle, pid).await;
                process.close();
                break;
            }
            Outcome::Ended if handle.is_connected() => {
                debug!("Follow of {} on pod {} ended", path, pod_id);
                break;
            }
            Outcome::Ended if resumed => {
                warn!("Connection to pod {} lost again while watching {}", pod_id, path);
                report_lost(&tx, &mut cancel_rx).await;
                break;
            }
            Outcome::Ended => {
                resumed = true;
                warn!("Connection to pod {} lost while watching {}, resuming", pod_id, path);
                match resume(&connections, &handle, &path).await {
                    Ok(next) => process = next,
                    Err(e) => {
                        warn!("Could not resume watching {} on pod {}: {}", path, pod_id, e);
                        report_lost(&tx, &mut cancel_rx).await;
                        break;
                    }
                }
            }
        }
    }
    debug!("Log watcher for {} on pod {} finished", path, pod_id);
}

async fn pump(
    process: &mut RemoteProcess,
    tx: &mpsc::Sender<LogEvent>,
    cancel_rx: &mut oneshot::Receiver<()>,
    pid: &mut Option<u32>,
) -> Outcome {
    let mut splitter = LineSplitter::default();
    loop {
        tokio::select! {
            _ = &mut *cancel_rx => return Outcome::Cancelled,
            msg = process.recv() => match msg {
                Some(ProcessOutput::Stdout(data)) => {
                    for line in splitter.push(&data) {
                        if pid.is_none() {
                            if let Some(rest) = line.strip_prefix(PID_MARKER) {
                                *pid = rest.trim().parse().ok();
                                continue;
                            }
                        }
                        tokio::select! {
                            _ = &mut *cancel_rx => return Outcome::Cancelled,
                            sent = tx.send(LogEvent::Line(line)) => {
                                if sent.is_err() {
                                    return Outcome::ReaderGone;
                                }
                            }
                        }
                    }
                }
                Some(ProcessOutput::Stderr(data)) => {
                    debug!("tail stderr: {}", String::from_utf8_lossy(&data).trim());
                }
                Some(ProcessOutput::Exit(_)) | None => return Outcome::Ended,
            }
        }
    }
}

/// Tell the reader the watch ended for good, unless it is being stopped.
/// A watch stopped on purpose ends without `ConnectionLost`.
async fn report_lost(tx: &mpsc::Sender<LogEvent>, cancel_rx: &mut oneshot::Receiver<()>) {
    tokio::select! {
        biased;
        _ = cancel_rx => {}
        _ = tx.send(LogEvent::ConnectionLost) => {}
    }
}

/// Reconnect once and follow from the current end of the file
async fn resume(
    connections: &ConnectionManager,
    handle: &ConnectionHandle,
    path: &str,
) -> Result<RemoteProcess, ConnectError> {
    connections.reconnect(handle).await?;
    let process = handle.transport().spawn(&follow_command(path, 0)).await?;
    info!("Resumed watching {} on pod {}", path, handle.pod_id());
    Ok(process)
}

async fn kill_follower(connections: &ConnectionManager, handle: &ConnectionHandle, pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    match connections.run(handle, &format!("kill {} 2>/dev/null", pid)).await {
        Ok(_) => debug!("Killed remote follower {} on pod {}", pid, handle.pod_id()),
        Err(e) => debug!("Could not kill remote follower {} on pod {}: {}", pid, handle.pod_id(), e),
    }
}
