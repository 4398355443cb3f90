//! Cloud Provider Client
//!
//! The minimal surface the session manager needs from the cloud: create,
//! describe, list, terminate, and hourly cost. [`ProviderClient`] wraps any
//! [`Provider`] with classified retries.

pub mod runpod;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::templates::{CloudType, Tier};
use crate::error::{Classify, ErrorClass};
use crate::retry::{retry_with_backoff, BackoffPolicy};

pub use runpod::RunPodProvider;

/// Pod status as the provider reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Pending,
    Running,
    Exited,
    Terminated,
    Unknown,
}

/// Everything `describe` tells us about a pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodDescription {
    pub id: String,
    pub name: String,
    pub status: RemoteStatus,
    /// Public SSH endpoint, once mapped
    pub host: Option<String>,
    pub ssh_port: Option<u16>,
    pub cost_per_hr: f64,
    #[serde(default)]
    pub gpu: Option<String>,
}

impl PodDescription {
    /// Running with a public SSH endpoint
    pub fn ssh_ready(&self) -> bool {
        self.status == RemoteStatus::Running && self.host.is_some() && self.ssh_port.is_some()
    }
}

/// What to create
#[derive(Debug, Clone)]
pub struct CreateRequest<'a> {
    pub tier: &'a Tier,
    pub cloud_type: CloudType,
    pub env: BTreeMap<String, String>,
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("No API key configured (set RUNPOD_API_KEY)")]
    MissingApiKey,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limited by provider")]
    RateLimited,

    #[error("Provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("No capacity: {0}")]
    ResourceExhausted(String),

    #[error("Pod not found: {0}")]
    NotFound(String),

    #[error("Unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl Classify for ProviderError {
    fn class(&self) -> ErrorClass {
        match self {
            ProviderError::MissingApiKey | ProviderError::Unauthorized(_) => {
                ErrorClass::Unauthorized
            }
            ProviderError::RateLimited | ProviderError::Network(_) => ErrorClass::Transient,
            ProviderError::Http { status, .. } if *status >= 500 => ErrorClass::Transient,
            ProviderError::ResourceExhausted(_) => ErrorClass::ResourceExhausted,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Cloud API boundary
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create a pod; returns its id
    async fn create_pod(&self, request: &CreateRequest<'_>) -> Result<String, ProviderError>;

    /// `Ok(None)` when the provider does not know the pod
    async fn describe(&self, pod_id: &str) -> Result<Option<PodDescription>, ProviderError>;

    async fn list_pods(&self) -> Result<Vec<PodDescription>, ProviderError>;

    /// `Err(NotFound)` when the pod is already gone
    async fn terminate(&self, pod_id: &str) -> Result<(), ProviderError>;

    /// Hourly rate in USD
    async fn hourly_cost(&self, pod_id: &str) -> Result<f64, ProviderError> {
        self.describe(pod_id)
            .await?
            .map(|d| d.cost_per_hr)
            .ok_or_else(|| ProviderError::NotFound(pod_id.to_string()))
    }
}

/// Provider calls with backoff on transient errors
#[derive(Clone)]
pub struct ProviderClient {
    inner: Arc<dyn Provider>,
    policy: BackoffPolicy,
}

impl ProviderClient {
    pub fn new(inner: Arc<dyn Provider>, policy: BackoffPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Same provider, different retry policy
    pub fn with_policy(&self, policy: BackoffPolicy) -> Self {
        Self {
            inner: self.inner.clone(),
            policy,
        }
    }

    pub async fn create_pod(&self, request: &CreateRequest<'_>) -> Result<String, ProviderError> {
        let label = format!("create pod {}", request.tier.pod_name);
        retry_with_backoff(&self.policy, &label, |_| self.inner.create_pod(request)).await
    }

    pub async fn describe(&self, pod_id: &str) -> Result<Option<PodDescription>, ProviderError> {
        let label = format!("describe {}", pod_id);
        retry_with_backoff(&self.policy, &label, |_| self.inner.describe(pod_id)).await
    }

    pub async fn list_pods(&self) -> Result<Vec<PodDescription>, ProviderError> {
        retry_with_backoff(&self.policy, "list pods", |_| self.inner.list_pods()).await
    }

    pub async fn hourly_cost(&self, pod_id: &str) -> Result<f64, ProviderError> {
        let label = format!("cost {}", pod_id);
        retry_with_backoff(&self.policy, &label, |_| self.inner.hourly_cost(pod_id)).await
    }

    /// Terminate until confirmed. A pod the provider no longer knows counts
    /// as terminated. Uses its own, more patient, policy.
    pub async fn terminate_confirmed(
        &self,
        pod_id: &str,
        policy: &BackoffPolicy,
    ) -> Result<(), ProviderError> {
        let label = format!("terminate {}", pod_id);
        let result = retry_with_backoff(policy, &label, |attempt| async move {
            if attempt > 1 {
                info!("Terminate attempt {}/{} for pod {}", attempt, policy.max_attempts, pod_id);
            }
            match self.inner.terminate(pod_id).await {
                Ok(()) | Err(ProviderError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await;

        if let Err(ref e) = result {
            warn!("Terminate for pod {} not confirmed: {}", pod_id, e);
        }
        result
    }
}
