//! Pod table persistence
//!
//! The registry is written to state.json after every lifecycle change so a
//! restarted process still knows which pods it is paying for. On startup the
//! table is reconciled against what the provider reports.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::registry::{PodRecord, SessionRegistry};
use super::state::PodState;
use crate::config::storage::{self, JsonStore, StorageError};
use crate::provider::RemoteStatus;

pub const STATE_VERSION: u32 = 1;

/// On-disk document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodTable {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub pods: Vec<PodRecord>,
}

/// Reads and writes the pod table
pub struct PodStore {
    store: JsonStore<PodTable>,
}

impl PodStore {
    /// Store at the default state.json location
    pub fn open_default() -> Result<Self, StorageError> {
        Ok(Self::with_path(storage::state_file()?))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            store: JsonStore::with_path(path),
        }
    }

    pub async fn load(&self) -> Result<Vec<PodRecord>, StorageError> {
        Ok(self.store.load().await?.pods)
    }

    /// Write the registry's current contents
    pub async fn save(&self, registry: &SessionRegistry) -> Result<(), StorageError> {
        let table = PodTable {
            version: STATE_VERSION,
            pods: registry.list(),
        };
        self.store.save(&table).await
    }

    pub fn path(&self) -> &std::path::Path {
        self.store.path()
    }
}

/// State a persisted record resumes in, given what the provider reports.
/// `remote` is None when the provider no longer knows the pod.
pub fn reconciled_state(persisted: PodState, remote: Option<RemoteStatus>) -> PodState {
    match (persisted, remote) {
        (PodState::Terminated, _) => PodState::Terminated,
        (_, None) | (_, Some(RemoteStatus::Terminated)) => PodState::Terminated,
        // Termination has to be finished, whatever the pod is doing
        (PodState::Terminating, _) => PodState::Terminating,
        (PodState::Failed, _) => PodState::Failed,
        (_, Some(RemoteStatus::Exited)) | (_, Some(RemoteStatus::Unknown)) => PodState::Failed,
        // SSH must be re-confirmed by this process
        (_, Some(RemoteStatus::Running)) => PodState::Booting,
        (_, Some(RemoteStatus::Pending)) => PodState::Provisioning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_reconcile_rules() {
        use PodState::*;
        assert_eq!(reconciled_state(Connected, Some(RemoteStatus::Running)), Booting);
        assert_eq!(reconciled_state(Reachable, Some(RemoteStatus::Running)), Booting);
        assert_eq!(reconciled_state(Provisioning, Some(RemoteStatus::Pending)), Provisioning);
        assert_eq!(reconciled_state(Connected, None), Terminated);
        assert_eq!(reconciled_state(Booting, Some(RemoteStatus::Exited)), Failed);
        assert_eq!(reconciled_state(Terminating, Some(RemoteStatus::Running)), Terminating);
        assert_eq!(reconciled_state(Terminating, None), Terminated);
        assert_eq!(reconciled_state(Failed, Some(RemoteStatus::Running)), Failed);
        assert_eq!(reconciled_state(Terminated, Some(RemoteStatus::Running)), Terminated);
    }

    #[tokio::test]
    async fn test_save_and_load_table() {
        let dir = tempdir().unwrap();
        let store = PodStore::with_path(dir.path().join("state.json"));

        let registry = SessionRegistry::default();
        let mut record = PodRecord::new("pod-1", "prod", "ltx2-comfyui-prod");
        record.state = PodState::Connected;
        record.host = Some("10.0.0.1".into());
        record.ssh_port = Some(22022);
        record.host_key = Some("SHA256:abc".into());
        registry.restore(record.clone());

        store.save(&registry).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[tokio::test]
    async fn test_missing_table_is_empty() {
        let dir = tempdir().unwrap();
        let store = PodStore::with_path(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_empty());
    }
}
