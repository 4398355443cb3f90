//! Session Registry
//!
//! Table of every known pod and its lifecycle state. The only shared mutable
//! structure in the crate: other components get cloned snapshots, and every
//! state change goes through [`SessionRegistry::transition`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::state::{Actor, PodState};
use crate::events::{EventBus, PodEvent};

/// Last cost observation for a pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSample {
    pub hourly_rate: f64,
    /// Rate times hours since creation
    pub accrued: f64,
    pub sampled_at: DateTime<Utc>,
}

/// One pod as tracked locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodRecord {
    pub id: String,
    pub tier: String,
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    pub state: PodState,
    pub created_at: DateTime<Utc>,
    pub state_since: DateTime<Utc>,
    #[serde(default)]
    pub last_cost: Option<CostSample>,
    /// SHA256 fingerprint pinned on first successful handshake
    #[serde(default)]
    pub host_key: Option<String>,
    /// Terminate was requested but the provider has not confirmed it
    #[serde(default)]
    pub terminate_pending: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PodRecord {
    pub fn new(id: impl Into<String>, tier: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tier: tier.into(),
            name: name.into(),
            host: None,
            ssh_port: None,
            state: PodState::Requested,
            created_at: now,
            state_since: now,
            last_cost: None,
            host_key: None,
            terminate_pending: false,
            last_error: None,
        }
    }

    /// SSH endpoint once the provider has published one
    pub fn endpoint(&self) -> Option<(String, u16)> {
        match (&self.host, self.ssh_port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        }
    }
}

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Pod not found: {0}")]
    PodNotFound(String),

    #[error("Pod already tracked: {0}")]
    AlreadyExists(String),

    #[error("Illegal transition for pod {pod_id}: {from} -> {to}")]
    IllegalTransition {
        pod_id: String,
        from: PodState,
        to: PodState,
    },

    #[error("{actor:?} may not move pod {pod_id} from {from} to {to}")]
    WrongWriter {
        pod_id: String,
        actor: Actor,
        from: PodState,
        to: PodState,
    },
}

/// Global pod registry
pub struct SessionRegistry {
    pods: DashMap<String, PodRecord>,
    events: EventBus,
    /// Held across the exists-check and insert
    create_lock: parking_lot::Mutex<()>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(EventBus::noop())
    }
}

impl SessionRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            pods: DashMap::new(),
            events,
            create_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start tracking a pod the provider just acknowledged (state Requested)
    pub fn insert(&self, record: PodRecord) -> Result<PodRecord, RegistryError> {
        let _guard = self.create_lock.lock();
        if self.pods.contains_key(&record.id) {
            return Err(RegistryError::AlreadyExists(record.id));
        }
        info!(
            "Tracking pod {} ({}, tier {}) in state {}",
            record.id, record.name, record.tier, record.state
        );
        self.pods.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// Put a record back as-is (startup reconcile). Replaces any existing entry.
    pub fn restore(&self, record: PodRecord) {
        debug!("Restoring pod {} in state {}", record.id, record.state);
        self.pods.insert(record.id.clone(), record);
    }

    /// Move a pod to `to`. Returns the previous state.
    pub fn transition(
        &self,
        pod_id: &str,
        to: PodState,
        actor: Actor,
    ) -> Result<PodState, RegistryError> {
        let from = {
            let mut entry = self
                .pods
                .get_mut(pod_id)
                .ok_or_else(|| RegistryError::PodNotFound(pod_id.to_string()))?;
            let from = entry.state;
            let writers = from.writers(to);
            if writers.is_empty() {
                return Err(RegistryError::IllegalTransition {
                    pod_id: pod_id.to_string(),
                    from,
                    to,
                });
            }
            if !writers.contains(&actor) {
                return Err(RegistryError::WrongWriter {
                    pod_id: pod_id.to_string(),
                    actor,
                    from,
                    to,
                });
            }
            entry.state = to;
            entry.state_since = Utc::now();
            from
        };

        info!("Pod {} state {} -> {}", pod_id, from, to);
        self.events.emit(PodEvent::StateChanged {
            pod_id: pod_id.to_string(),
            from,
            to,
        });
        Ok(from)
    }

    /// Move a pod to Failed and record why. No-op if it already failed or is gone.
    pub fn fail(&self, pod_id: &str, actor: Actor, reason: impl Into<String>) -> Result<(), RegistryError> {
        let reason = reason.into();
        match self.state(pod_id) {
            None => Err(RegistryError::PodNotFound(pod_id.to_string())),
            Some(PodState::Failed) | Some(PodState::Terminated) => Ok(()),
            Some(_) => {
                warn!("Pod {} failed: {}", pod_id, reason);
                self.update(pod_id, |r| r.last_error = Some(reason))?;
                self.transition(pod_id, PodState::Failed, actor).map(|_| ())
            }
        }
    }

    /// Mutate non-state fields of a record
    pub fn update<F>(&self, pod_id: &str, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut PodRecord),
    {
        let mut entry = self
            .pods
            .get_mut(pod_id)
            .ok_or_else(|| RegistryError::PodNotFound(pod_id.to_string()))?;
        let state = entry.state;
        f(&mut entry);
        // State only moves through transition()
        entry.state = state;
        Ok(())
    }

    pub fn set_endpoint(&self, pod_id: &str, host: String, port: u16) -> Result<(), RegistryError> {
        self.update(pod_id, |r| {
            r.host = Some(host);
            r.ssh_port = Some(port);
        })
    }

    pub fn record_cost(&self, pod_id: &str, sample: CostSample) -> Result<(), RegistryError> {
        self.update(pod_id, |r| r.last_cost = Some(sample))
    }

    pub fn set_terminate_pending(&self, pod_id: &str, pending: bool) -> Result<(), RegistryError> {
        self.update(pod_id, |r| r.terminate_pending = pending)
    }

    pub fn pin_host_key(&self, pod_id: &str, fingerprint: String) -> Result<(), RegistryError> {
        self.update(pod_id, |r| r.host_key = Some(fingerprint))
    }

    /// Snapshot of one record
    pub fn get(&self, pod_id: &str) -> Option<PodRecord> {
        self.pods.get(pod_id).map(|r| r.clone())
    }

    pub fn state(&self, pod_id: &str) -> Option<PodState> {
        self.pods.get(pod_id).map(|r| r.state)
    }

    pub fn contains(&self, pod_id: &str) -> bool {
        self.pods.contains_key(pod_id)
    }

    /// Snapshot of all records, oldest first
    pub fn list(&self) -> Vec<PodRecord> {
        let mut pods: Vec<PodRecord> = self.pods.iter().map(|r| r.clone()).collect();
        pods.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pods
    }

    /// Records that are still billable
    pub fn list_billable(&self) -> Vec<PodRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.state.is_billable())
            .collect()
    }

    pub fn list_by_state(&self, state: PodState) -> Vec<PodRecord> {
        self.list().into_iter().filter(|r| r.state == state).collect()
    }

    pub fn count(&self) -> usize {
        self.pods.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const ACTORS: [Actor; 4] = [
        Actor::Deployer,
        Actor::Connection,
        Actor::Bridge,
        Actor::Terminator,
    ];

    fn registry_with(state: PodState) -> SessionRegistry {
        let registry = SessionRegistry::default();
        let mut record = PodRecord::new("pod-1", "prod", "ltx2-comfyui-prod");
        record.state = state;
        registry.restore(record);
        registry
    }

    /// Independent statement of the lifecycle table, including the
    /// session-close edge and early terminates described in `state`
    fn expected_legal(from: PodState, to: PodState) -> bool {
        use PodState::*;
        match (from, to) {
            (Requested, Provisioning)
            | (Provisioning, Booting)
            | (Booting, Reachable)
            | (Reachable, Connected)
            | (Terminating, Terminated) => true,
            // Session closed, control connection kept
            (Connected, Reachable) => true,
            (Terminated, _) => false,
            (Terminating, Terminating) => false,
            (_, Terminating) => true,
            (Failed, Failed) => false,
            (_, Failed) => true,
            _ => false,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let registry = SessionRegistry::default();
        registry
            .insert(PodRecord::new("pod-1", "prod", "ltx2-comfyui-prod"))
            .unwrap();
        let record = registry.get("pod-1").unwrap();
        assert_eq!(record.state, PodState::Requested);
        assert!(matches!(
            registry.insert(PodRecord::new("pod-1", "prod", "x")),
            Err(RegistryError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_transition_emits_and_updates() {
        let registry = registry_with(PodState::Booting);
        let from = registry
            .transition("pod-1", PodState::Reachable, Actor::Connection)
            .unwrap();
        assert_eq!(from, PodState::Booting);
        assert_eq!(registry.state("pod-1"), Some(PodState::Reachable));
    }

    #[test]
    fn test_wrong_writer_is_rejected() {
        let registry = registry_with(PodState::Booting);
        let err = registry
            .transition("pod-1", PodState::Reachable, Actor::Bridge)
            .unwrap_err();
        assert!(matches!(err, RegistryError::WrongWriter { .. }));
        assert_eq!(registry.state("pod-1"), Some(PodState::Booting));
    }

    #[test]
    fn test_randomized_transition_requests() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..2000 {
            let from = PodState::ALL[rng.gen_range(0..PodState::ALL.len())];
            let to = PodState::ALL[rng.gen_range(0..PodState::ALL.len())];
            let registry = registry_with(from);

            let accepted = ACTORS
                .iter()
                .any(|actor| registry.transition("pod-1", to, *actor).is_ok());

            assert_eq!(accepted, expected_legal(from, to), "{} -> {}", from, to);
            let expected_state = if accepted { to } else { from };
            assert_eq!(registry.state("pod-1"), Some(expected_state));
        }
    }

    #[test]
    fn test_update_cannot_change_state() {
        let registry = registry_with(PodState::Booting);
        registry
            .update("pod-1", |r| {
                r.state = PodState::Connected;
                r.host = Some("1.2.3.4".into());
            })
            .unwrap();
        let record = registry.get("pod-1").unwrap();
        assert_eq!(record.state, PodState::Booting);
        assert_eq!(record.host.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_fail_records_reason_once() {
        let registry = registry_with(PodState::Booting);
        registry.fail("pod-1", Actor::Connection, "budget spent").unwrap();
        registry.fail("pod-1", Actor::Connection, "again").unwrap();
        let record = registry.get("pod-1").unwrap();
        assert_eq!(record.state, PodState::Failed);
        assert_eq!(record.last_error.as_deref(), Some("budget spent"));
    }

    #[test]
    fn test_unknown_pod() {
        let registry = SessionRegistry::default();
        assert!(matches!(
            registry.transition("nope", PodState::Booting, Actor::Deployer),
            Err(RegistryError::PodNotFound(_))
        ));
    }
}
