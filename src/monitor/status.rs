//! Status Monitor
//!
//! Samples GPU, VRAM, RAM and disk usage on a pod with one batched command
//! per cycle.
//!
//! - The loop only runs while the pod is Connected and stops as soon as it
//!   leaves that state
//! - A failed sample is reported and the loop carries on
//! - After `max_consecutive_failures` in a row telemetry is marked stale

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::connection::{ConnectError, ConnectionHandle, ConnectionManager};
use crate::error::{Classify, ErrorClass};
use crate::events::PodEvent;
use crate::session::{PodState, SessionRegistry};

/// GPU via nvidia-smi (MiB, no units), memory from /proc/meminfo, disk of the
/// workspace volume in bytes
const SAMPLE_COMMAND: &str = "echo '===GPU==='; nvidia-smi --query-gpu=name,utilization.gpu,memory.used,memory.total --format=csv,noheader,nounits 2>/dev/null; echo '===MEM==='; grep -E '^(MemTotal|MemAvailable):' /proc/meminfo 2>/dev/null; echo '===DISK==='; df -B1 --output=used,size /workspace 2>/dev/null | tail -n 1; echo '===END==='";

/// One telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub timestamp_ms: u64,
    pub gpu_name: Option<String>,
    /// Averaged across GPUs
    pub gpu_util_percent: Option<f64>,
    pub vram_used_mb: Option<u64>,
    pub vram_total_mb: Option<u64>,
    pub ram_used_bytes: Option<u64>,
    pub ram_total_bytes: Option<u64>,
    pub disk_used_bytes: Option<u64>,
    pub disk_total_bytes: Option<u64>,
}

impl ResourceSnapshot {
    pub fn vram_percent(&self) -> Option<f64> {
        percent(self.vram_used_mb, self.vram_total_mb)
    }

    pub fn ram_percent(&self) -> Option<f64> {
        percent(self.ram_used_bytes, self.ram_total_bytes)
    }

    pub fn disk_percent(&self) -> Option<f64> {
        percent(self.disk_used_bytes, self.disk_total_bytes)
    }
}

fn percent(used: Option<u64>, total: Option<u64>) -> Option<f64> {
    match (used, total) {
        (Some(used), Some(total)) if total > 0 => Some(used as f64 / total as f64 * 100.0),
        _ => None,
    }
}

#[derive(Error, Debug)]
pub enum SampleError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Status command exited with {code}: {stderr}")]
    Exit { code: u32, stderr: String },

    #[error("Status output contained no metrics")]
    Empty,
}

impl Classify for SampleError {
    fn class(&self) -> ErrorClass {
        match self {
            SampleError::Connect(e) => e.class(),
            _ => ErrorClass::Fatal,
        }
    }
}

/// Take one sample
pub async fn sample(
    connections: &ConnectionManager,
    handle: &ConnectionHandle,
) -> Result<ResourceSnapshot, SampleError> {
    let output = connections.run(handle, SAMPLE_COMMAND).await?;
    if let Some(code) = output.exit_code.filter(|c| *c != 0) {
        return Err(SampleError::Exit {
            code,
            stderr: output.stderr,
        });
    }
    let snapshot = parse_snapshot(&output.stdout);
    if snapshot.gpu_util_percent.is_none()
        && snapshot.ram_total_bytes.is_none()
        && snapshot.disk_total_bytes.is_none()
    {
        return Err(SampleError::Empty);
    }
    Ok(snapshot)
}

/// Periodic sampler bound to one session
pub struct StatusMonitor {
    pod_id: String,
    latest: Arc<RwLock<Option<ResourceSnapshot>>>,
    stale: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StatusMonitor {
    pub fn spawn(
        connections: Arc<ConnectionManager>,
        registry: Arc<SessionRegistry>,
        handle: ConnectionHandle,
        interval: Duration,
        max_consecutive_failures: u32,
    ) -> Self {
        let pod_id = handle.pod_id().to_string();
        let latest = Arc::new(RwLock::new(None));
        let stale = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = oneshot::channel();
        // Subscribe before spawning so no state change is missed
        let state_rx = registry.events().subscribe();

        let task = tokio::spawn(sampling_loop(
            connections,
            registry,
            handle,
            state_rx,
            interval,
            max_consecutive_failures.max(1),
            latest.clone(),
            stale.clone(),
            stop_rx,
        ));

        Self {
            pod_id,
            latest,
            stale,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.latest.read().clone()
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait until it has exited
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn sampling_loop(
    connections: Arc<ConnectionManager>,
    registry: Arc<SessionRegistry>,
    handle: ConnectionHandle,
    mut state_rx: broadcast::Receiver<PodEvent>,
    interval: Duration,
    max_failures: u32,
    latest: Arc<RwLock<Option<ResourceSnapshot>>>,
    stale: Arc<AtomicBool>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let pod_id = handle.pod_id().to_string();
    let events = registry.events().clone();
    let mut watch_states = !events.is_noop();
    let mut ticker = tokio::time::interval(interval);
    let mut consecutive_failures: u32 = 0;

    debug!("Status monitor started for pod {}", pod_id);

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                debug!("Status monitor stop requested for pod {}", pod_id);
                break;
            }

            event = state_rx.recv(), if watch_states => match event {
                Ok(PodEvent::StateChanged { pod_id: ref changed, to, .. })
                    if *changed == pod_id && to != PodState::Connected =>
                {
                    debug!("Pod {} left connected ({}), stopping status monitor", pod_id, to);
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => watch_states = false,
                _ => {}
            },

            _ = ticker.tick() => {
                if registry.state(&pod_id) != Some(PodState::Connected) {
                    debug!("Pod {} not connected, stopping status monitor", pod_id);
                    break;
                }

                match sample(&connections, &handle).await {
                    Ok(snapshot) => {
                        if consecutive_failures >= max_failures {
                            debug!("Telemetry for pod {} recovered", pod_id);
                        }
                        consecutive_failures = 0;
                        stale.store(false, Ordering::SeqCst);
                        trace!("Status sample for pod {}: {:?}", pod_id, snapshot);
                        *latest.write() = Some(snapshot.clone());
                        events.emit(PodEvent::Telemetry {
                            pod_id: pod_id.clone(),
                            snapshot,
                        });
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            "Status sample failed for pod {} ({}/{}): {}",
                            pod_id, consecutive_failures, max_failures, e
                        );
                        if consecutive_failures == max_failures {
                            warn!(
                                "Telemetry for pod {} is stale after {} consecutive failures",
                                pod_id, consecutive_failures
                            );
                            stale.store(true, Ordering::SeqCst);
                            events.emit(PodEvent::TelemetryStale {
                                pod_id: pod_id.clone(),
                                consecutive_failures,
                            });
                        }
                    }
                }
            }
        }
    }

    debug!("Status monitor stopped for pod {}", pod_id);
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─── Parsers ──────────────────────────────────────────────────────────────

/// Extract section between markers
fn extract_section<'a>(output: &'a str, marker: &str) -> Option<&'a str> {
    let start_marker = format!("==={}===", marker);
    let start = output.find(&start_marker)?;
    let rest = &output[start + start_marker.len()..];
    let end = rest.find("===").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

pub(crate) fn parse_snapshot(output: &str) -> ResourceSnapshot {
    let gpu = parse_gpu(output);
    let mem = parse_meminfo(output);
    let disk = parse_disk(output);

    ResourceSnapshot {
        timestamp_ms: now_ms(),
        gpu_name: gpu.as_ref().map(|g| g.name.clone()),
        gpu_util_percent: gpu.as_ref().map(|g| g.util),
        vram_used_mb: gpu.as_ref().map(|g| g.vram_used),
        vram_total_mb: gpu.as_ref().map(|g| g.vram_total),
        ram_used_bytes: mem.map(|(used, _)| used),
        ram_total_bytes: mem.map(|(_, total)| total),
        disk_used_bytes: disk.map(|(used, _)| used),
        disk_total_bytes: disk.map(|(_, total)| total),
    }
}

struct GpuSummary {
    name: String,
    util: f64,
    vram_used: u64,
    vram_total: u64,
}

/// `name, util, used, total` per GPU. Utilisation is averaged, memory summed.
fn parse_gpu(output: &str) -> Option<GpuSummary> {
    let section = extract_section(output, "GPU")?;
    let mut names = Vec::new();
    let mut util_sum = 0.0;
    let mut used = 0;
    let mut total = 0;

    for line in section.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            continue;
        }
        let (Ok(u), Ok(m_used), Ok(m_total)) = (
            fields[1].parse::<f64>(),
            fields[2].parse::<u64>(),
            fields[3].parse::<u64>(),
        ) else {
            continue;
        };
        names.push(fields[0].to_string());
        util_sum += u;
        used += m_used;
        total += m_total;
    }

    if names.is_empty() {
        return None;
    }
    let count = names.len();
    let name = if count == 1 {
        names.remove(0)
    } else {
        format!("{}x {}", count, names[0])
    };
    Some(GpuSummary {
        name,
        util: util_sum / count as f64,
        vram_used: used,
        vram_total: total,
    })
}

/// MemTotal/MemAvailable (kB) -> (used, total) in bytes
fn parse_meminfo(output: &str) -> Option<(u64, u64)> {
    let section = extract_section(output, "MEM")?;
    let mut total = None;
    let mut available = None;
    for line in section.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next();
        let value = parts.next().and_then(|v| v.parse::<u64>().ok());
        match key {
            Some("MemTotal:") => total = value,
            Some("MemAvailable:") => available = value,
            _ => {}
        }
    }
    let total = total?;
    let available = available.unwrap_or(0);
    Some((total.saturating_sub(available) * 1024, total * 1024))
}

/// `used size` in bytes
fn parse_disk(output: &str) -> Option<(u64, u64)> {
    let section = extract_section(output, "DISK")?;
    let line = section.lines().last()?;
    let mut parts = line.split_whitespace();
    let used = parts.next()?.parse().ok()?;
    let total = parts.next()?.parse().ok()?;
    Some((used, total))
}
