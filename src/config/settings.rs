//! User settings
//!
//! Every field has a serde default so a partial (or empty) config.json loads.
//! Environment variables override what the file says.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::storage::{self, expand_home, JsonStore, StorageError};
use super::templates::Tier;
use crate::retry::BackoffPolicy;

pub const ENV_API_KEY: &str = "RUNPOD_API_KEY";
pub const ENV_SSH_KEY_PATH: &str = "SSH_KEY_PATH";
pub const ENV_HF_TOKEN: &str = "HF_TOKEN";

/// Control connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectSettings {
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Per-attempt handshake + auth timeout
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    /// Timeout for a single remote command round trip
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

fn default_attempt_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    30
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            attempt_timeout_secs: default_attempt_timeout(),
            command_timeout_secs: default_command_timeout(),
            keepalive_secs: default_keepalive(),
        }
    }
}

impl ConnectSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Deadline for each forward to be established (ms)
    #[serde(default = "default_open_deadline")]
    pub open_deadline_ms: u64,
    /// Refuse to relocate a forward when its documented local port is taken
    #[serde(default)]
    pub fixed_local_ports: bool,
}

fn default_open_deadline() -> u64 {
    5000
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            open_deadline_ms: default_open_deadline(),
            fixed_local_ports: false,
        }
    }
}

impl TunnelSettings {
    pub fn open_deadline(&self) -> Duration {
        Duration::from_millis(self.open_deadline_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSettings {
    #[serde(default = "default_status_interval")]
    pub interval_secs: u64,
    /// Consecutive failed samples before telemetry is marked stale
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

fn default_status_interval() -> u64 {
    5
}

fn default_max_failures() -> u32 {
    3
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_status_interval(),
            max_consecutive_failures: default_max_failures(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSettings {
    #[serde(default = "default_cost_interval")]
    pub interval_secs: u64,
    /// Aggregate $/hr across tracked pods above which a warning is raised
    #[serde(default = "default_burn_threshold")]
    pub burn_threshold_per_hour: f64,
}

fn default_cost_interval() -> u64 {
    60
}

fn default_burn_threshold() -> f64 {
    2.0
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_cost_interval(),
            burn_threshold_per_hour: default_burn_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_pull_remote")]
    pub pull_remote_dir: String,
    #[serde(default = "default_pull_local")]
    pub pull_local_dir: PathBuf,
    #[serde(default = "default_push_remote")]
    pub push_remote_dir: String,
    /// Timeout for a single read/write chunk
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_secs: u64,
}

fn default_pull_remote() -> String {
    "/workspace/ComfyUI/output".to_string()
}

fn default_pull_local() -> PathBuf {
    PathBuf::from("output")
}

fn default_push_remote() -> String {
    "/workspace/ComfyUI/user/default/workflows".to_string()
}

fn default_chunk_timeout() -> u64 {
    30
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            pull_remote_dir: default_pull_remote(),
            pull_local_dir: default_pull_local(),
            push_remote_dir: default_push_remote(),
            chunk_timeout_secs: default_chunk_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionSettings {
    #[serde(default = "default_provision_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_provision_poll")]
    pub poll_secs: u64,
    /// Attempts for the terminate call before it is reported as pending
    #[serde(default = "default_terminate_attempts")]
    pub terminate_attempts: u32,
}

fn default_provision_timeout() -> u64 {
    300
}

fn default_provision_poll() -> u64 {
    5
}

fn default_terminate_attempts() -> u32 {
    8
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_provision_timeout(),
            poll_secs: default_provision_poll(),
            terminate_attempts: default_terminate_attempts(),
        }
    }
}

/// Top-level settings document (config.json)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub hf_token: Option<String>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_key_path")]
    pub ssh_key_path: PathBuf,
    #[serde(default)]
    pub ssh_key_passphrase: Option<String>,
    /// Local directory holding startup/setup scripts
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
    /// Uploaded next to the startup script when present
    #[serde(default = "default_env_file")]
    pub env_file: PathBuf,
    #[serde(default)]
    pub connect: ConnectSettings,
    #[serde(default)]
    pub tunnels: TunnelSettings,
    #[serde(default)]
    pub status: StatusSettings,
    #[serde(default)]
    pub cost: CostSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub provision: ProvisionSettings,
    /// Extra or replacement tiers
    #[serde(default)]
    pub tiers: Vec<Tier>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_key_path() -> PathBuf {
    PathBuf::from("~/.ssh/id_ed25519")
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("scripts")
}

fn default_env_file() -> PathBuf {
    PathBuf::from(".env")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            hf_token: None,
            ssh_user: default_ssh_user(),
            ssh_key_path: default_ssh_key_path(),
            ssh_key_passphrase: None,
            scripts_dir: default_scripts_dir(),
            env_file: default_env_file(),
            connect: ConnectSettings::default(),
            tunnels: TunnelSettings::default(),
            status: StatusSettings::default(),
            cost: CostSettings::default(),
            sync: SyncSettings::default(),
            provision: ProvisionSettings::default(),
            tiers: Vec::new(),
        }
    }
}

impl Settings {
    /// Load config.json from the config directory and apply env overrides
    pub async fn load() -> Result<Self, StorageError> {
        let store: JsonStore<Settings> = JsonStore::with_path(storage::config_file()?);
        let mut settings = store.load().await?;
        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Apply overrides from a key lookup (the process environment in practice)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(path) = lookup(ENV_SSH_KEY_PATH).filter(|v| !v.is_empty()) {
            self.ssh_key_path = PathBuf::from(path);
        }
        if let Some(token) = lookup(ENV_HF_TOKEN).filter(|v| !v.is_empty()) {
            self.hf_token = Some(token);
        }
    }

    pub fn resolved_key_path(&self) -> PathBuf {
        expand_home(&self.ssh_key_path)
    }
}
