//! Error taxonomy
//!
//! Every boundary error type in the crate maps onto an [`ErrorClass`]. Retry
//! loops decide on the class alone, never on message text.

use thiserror::Error;

use crate::config::storage::StorageError;
use crate::connection::ConnectError;
use crate::forwarding::TunnelError;
use crate::monitor::SampleError;
use crate::provider::ProviderError;
use crate::session::registry::RegistryError;
use crate::sftp::PullError;
use crate::ssh::SshError;

/// How a failure should be handled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff
    Transient,
    /// Bad credentials or host key; fail fast
    Unauthorized,
    /// Provider out of capacity or quota; surface, pod goes to Failed
    ResourceExhausted,
    /// The control connection dropped; one bounded reconnect for in-flight work
    ConnectionLost,
    /// Operation continued, individual failures are listed in its result
    PartialFailure,
    /// Anything else; not retried
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

/// Implemented by every error that feeds a retry decision
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Errors returned by the pod manager
#[derive(Error, Debug)]
pub enum PodError {
    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    #[error("No running pods")]
    NoPods,

    #[error("Several pods are running, pick one of: {}", .0.join(", "))]
    AmbiguousPod(Vec<String>),

    #[error("Pod {pod_id} did not become ready within {waited_secs}s")]
    ProvisionTimeout { pod_id: String, waited_secs: u64 },

    #[error("{0} is not a .blend file")]
    NotABlendFile(String),

    #[error("Blender is not installed on pod {pod_id} (expected {path}); deploy the blender tier with its setup script")]
    BlenderMissing { pod_id: String, path: String },

    #[error("Remote command exited with {code}: {stderr}")]
    RemoteCommand { code: u32, stderr: String },

    #[error("Termination of {pod_id} not confirmed: {reason}")]
    TerminateFailed { pod_id: String, reason: String },

    #[error("{failed} of {total} uploads failed")]
    PartialUpload { failed: usize, total: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Pull(#[from] PullError),

    #[error(transparent)]
    Sample(#[from] SampleError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for PodError {
    fn class(&self) -> ErrorClass {
        match self {
            PodError::Provider(e) => e.class(),
            PodError::Connect(e) => e.class(),
            PodError::Ssh(e) => e.class(),
            PodError::Tunnel(e) => e.class(),
            PodError::Pull(e) => e.class(),
            PodError::Sample(e) => e.class(),
            PodError::PartialUpload { .. } => ErrorClass::PartialFailure,
            PodError::Io(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}
