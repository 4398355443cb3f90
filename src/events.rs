//! Pod Event System
//!
//! Lifecycle, connection, tunnel, telemetry and cost events, fanned out over a
//! tokio broadcast channel to whoever renders them (the CLI, a future UI).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::forwarding::TunnelStatus;
use crate::monitor::status::ResourceSnapshot;
use crate::session::PodState;

/// Events published by the pod manager and its background tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PodEvent {
    StateChanged {
        pod_id: String,
        from: PodState,
        to: PodState,
    },
    /// One connection attempt finished; `error` is None on success
    ConnectAttempt {
        pod_id: String,
        attempt: u32,
        max_attempts: u32,
        elapsed: Duration,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TunnelStatus {
        pod_id: String,
        service: String,
        local_port: u16,
        remote_port: u16,
        status: TunnelStatus,
    },
    Telemetry {
        pod_id: String,
        snapshot: ResourceSnapshot,
    },
    /// Telemetry went stale after too many failed samples
    TelemetryStale {
        pod_id: String,
        consecutive_failures: u32,
    },
    /// Aggregate burn is above the configured threshold. Advisory only.
    CostWarning {
        aggregate_hourly: f64,
        threshold: f64,
        pods: usize,
    },
    TerminateFailed {
        pod_id: String,
        error: String,
    },
}

/// Event emitter shared by every component.
///
/// A noop bus drops everything, which is what one-shot commands and most
/// tests want.
#[derive(Clone)]
pub struct EventBus {
    tx: Option<broadcast::Sender<PodEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx: Some(tx) }
    }

    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: PodEvent) {
        if let Some(ref tx) = self.tx {
            // No subscribers is fine
            let _ = tx.send(event);
        }
    }

    /// Subscribe to events. A noop bus hands out a receiver that never yields.
    pub fn subscribe(&self) -> broadcast::Receiver<PodEvent> {
        match self.tx {
            Some(ref tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.tx.is_none()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("noop", &self.is_noop())
            .finish()
    }
}
