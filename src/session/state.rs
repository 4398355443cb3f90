//! Pod lifecycle state machine
//!
//! ```text
//! Requested -> Provisioning -> Booting -> Reachable <-> Connected
//!      \            \             \          \            /
//!       +------------+-------------+----------+----------+--> Terminating -> Terminated
//!  any non-terminal state --> Failed --> Terminating
//! ```
//!
//! Every edge has a fixed set of components allowed to drive it. Asking for
//! an edge that is not in the table, or driving it from the wrong component,
//! is rejected by the registry.
//!
//! Two groups of edges extend the plain forward chain on purpose:
//!
//! - `Connected -> Reachable`: closing a session drops the tunnels but keeps
//!   the confirmed control connection, so the pod goes back to Reachable
//!   rather than being torn down.
//! - `{Requested, Provisioning, Booting, Reachable} -> Terminating`: a pod
//!   bills from the moment it is created, so terminate has to work before a
//!   session ever opened, not only from Connected and Failed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodState {
    Requested,
    Provisioning,
    Booting,
    Reachable,
    Connected,
    Terminating,
    Terminated,
    Failed,
}

/// Component that drives a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actor {
    /// Creation and readiness polling against the provider
    Deployer,
    /// Connection retry loop
    Connection,
    /// Tunnel bridge open/close
    Bridge,
    /// Termination path
    Terminator,
}

impl PodState {
    pub const ALL: [PodState; 8] = [
        PodState::Requested,
        PodState::Provisioning,
        PodState::Booting,
        PodState::Reachable,
        PodState::Connected,
        PodState::Terminating,
        PodState::Terminated,
        PodState::Failed,
    ];

    /// Terminated is the only state nothing leaves
    pub fn is_terminal(self) -> bool {
        self == PodState::Terminated
    }

    /// SSH has been confirmed on this pod
    pub fn is_addressable(self) -> bool {
        matches!(self, PodState::Reachable | PodState::Connected)
    }

    /// Still billed by the provider as far as we know
    pub fn is_billable(self) -> bool {
        !matches!(self, PodState::Terminated)
    }

    /// Components allowed to drive `self -> to`. Empty when the edge does not exist.
    pub fn writers(self, to: PodState) -> &'static [Actor] {
        use PodState::*;
        match (self, to) {
            (Requested, Provisioning) => &[Actor::Deployer],
            (Provisioning, Booting) => &[Actor::Deployer],
            (Booting, Reachable) => &[Actor::Connection],
            (Reachable, Connected) => &[Actor::Bridge],
            // Session closed, connection still confirmed
            (Connected, Reachable) => &[Actor::Bridge],
            (Terminating, Terminated) => &[Actor::Terminator],
            (from, Terminating) if from != Terminating && !from.is_terminal() => {
                &[Actor::Terminator]
            }
            (from, Failed) if from != Failed && !from.is_terminal() => &[
                Actor::Deployer,
                Actor::Connection,
                Actor::Bridge,
                Actor::Terminator,
            ],
            _ => &[],
        }
    }

    pub fn can_transition_to(self, to: PodState) -> bool {
        !self.writers(to).is_empty()
    }

    pub fn label(self) -> &'static str {
        match self {
            PodState::Requested => "requested",
            PodState::Provisioning => "provisioning",
            PodState::Booting => "booting",
            PodState::Reachable => "reachable",
            PodState::Connected => "connected",
            PodState::Terminating => "terminating",
            PodState::Terminated => "terminated",
            PodState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PodState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
