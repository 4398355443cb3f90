//! RunPod GraphQL client

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{CreateRequest, PodDescription, Provider, ProviderError, RemoteStatus};
use crate::config::templates::WORKSPACE;

pub const DEFAULT_ENDPOINT: &str = "https://api.runpod.io/graphql";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const POD_FIELDS: &str = "id name desiredStatus costPerHr \
    machine { gpuDisplayName } \
    runtime { ports { ip isIpPublic privatePort publicPort type } }";

#[derive(Debug, Deserialize)]
struct GqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GqlError>,
}

#[derive(Debug, Deserialize)]
struct GqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlPod {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    desired_status: Option<String>,
    #[serde(default)]
    cost_per_hr: Option<f64>,
    #[serde(default)]
    machine: Option<GqlMachine>,
    #[serde(default)]
    runtime: Option<GqlRuntime>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlMachine {
    #[serde(default)]
    gpu_display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GqlRuntime {
    #[serde(default)]
    ports: Option<Vec<GqlPort>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlPort {
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    is_ip_public: bool,
    private_port: u16,
    #[serde(default)]
    public_port: Option<u16>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvVar<'a> {
    key: &'a str,
    value: &'a str,
}

fn describe_pod(pod: GqlPod) -> PodDescription {
    let ports = pod
        .runtime
        .as_ref()
        .and_then(|r| r.ports.as_deref())
        .unwrap_or(&[]);

    let status = match pod.desired_status.as_deref() {
        Some("RUNNING") if pod.runtime.is_some() => RemoteStatus::Running,
        Some("RUNNING") | Some("CREATED") | Some("RESTARTING") => RemoteStatus::Pending,
        Some("EXITED") => RemoteStatus::Exited,
        Some("TERMINATED") => RemoteStatus::Terminated,
        _ => RemoteStatus::Unknown,
    };

    let ssh = ports.iter().find(|p| {
        p.private_port == 22 && p.is_ip_public && p.kind.as_deref().map_or(true, |k| k == "tcp")
    });

    PodDescription {
        id: pod.id,
        name: pod.name,
        status,
        host: ssh.and_then(|p| p.ip.clone()),
        ssh_port: ssh.and_then(|p| p.public_port),
        cost_per_hr: pod.cost_per_hr.unwrap_or(0.0),
        gpu: pod.machine.and_then(|m| m.gpu_display_name),
    }
}

/// Map GraphQL error messages onto the error taxonomy
fn classify_messages(messages: &[String]) -> ProviderError {
    let joined = messages.join("; ");
    let lower = joined.to_lowercase();
    if lower.contains("unauthorized") || lower.contains("api key") || lower.contains("forbidden") {
        ProviderError::Unauthorized(joined)
    } else if lower.contains("no longer any instances available")
        || lower.contains("not enough")
        || lower.contains("no instances")
        || lower.contains("insufficient")
        || lower.contains("quota")
        || lower.contains("capacity")
    {
        ProviderError::ResourceExhausted(joined)
    } else if lower.contains("not found") || lower.contains("does not exist") {
        ProviderError::NotFound(joined)
    } else if lower.contains("rate limit") || lower.contains("too many requests") {
        ProviderError::RateLimited
    } else {
        ProviderError::InvalidResponse(joined)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ProviderError::Network(e.to_string())
    } else {
        ProviderError::InvalidResponse(e.to_string())
    }
}

/// GraphQL client for the RunPod API
pub struct RunPodProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl RunPodProvider {
    pub fn new(api_key: Option<String>) -> Result<Self, ProviderError> {
        Self::with_endpoint(api_key, DEFAULT_ENDPOINT.to_string())
    }

    pub fn with_endpoint(api_key: Option<String>, endpoint: String) -> Result<Self, ProviderError> {
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .ok_or(ProviderError::MissingApiKey)?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    async fn query(&self, query: &str, variables: Value) -> Result<Value, ProviderError> {
        let body = serde_json::to_string(&json!({ "query": query, "variables": variables }))
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_reqwest_error)?;

        match status {
            401 | 403 => return Err(ProviderError::Unauthorized(format!("HTTP {}", status))),
            429 => return Err(ProviderError::RateLimited),
            s if !(200..300).contains(&s) => {
                return Err(ProviderError::Http {
                    status: s,
                    message: text.chars().take(200).collect(),
                })
            }
            _ => {}
        }

        let parsed: GqlResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(format!("{}: {}", e, text)))?;

        if !parsed.errors.is_empty() {
            let messages: Vec<String> = parsed.errors.into_iter().map(|e| e.message).collect();
            return Err(classify_messages(&messages));
        }

        parsed
            .data
            .ok_or_else(|| ProviderError::InvalidResponse("response without data".into()))
    }
}

#[async_trait]
impl Provider for RunPodProvider {
    async fn create_pod(&self, request: &CreateRequest<'_>) -> Result<String, ProviderError> {
        let tier = request.tier;
        let env: Vec<EnvVar<'_>> = request
            .env
            .iter()
            .map(|(key, value)| EnvVar { key, value })
            .collect();

        let input = json!({
            "cloudType": request.cloud_type.as_str(),
            "gpuCount": 1,
            "gpuTypeId": tier.gpu_type_id,
            "name": tier.pod_name,
            "imageName": tier.image(),
            "minMemoryInGb": tier.system_ram_gb,
            "volumeInGb": tier.volume_disk_gb,
            "containerDiskInGb": tier.container_disk_gb,
            "ports": tier.exposed_ports(),
            "volumeMountPath": WORKSPACE,
            "env": env,
        });

        info!(
            "Creating pod {} ({} on {})",
            tier.pod_name,
            tier.gpu_type_id,
            request.cloud_type.as_str()
        );

        let data = self
            .query(
                "mutation Deploy($input: PodFindAndDeployOnDemandInput) { \
                 podFindAndDeployOnDemand(input: $input) { id } }",
                json!({ "input": input }),
            )
            .await?;

        data.pointer("/podFindAndDeployOnDemand/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::ResourceExhausted(format!(
                    "no pod returned for {} on {}",
                    tier.gpu_type_id,
                    request.cloud_type.as_str()
                ))
            })
    }

    async fn describe(&self, pod_id: &str) -> Result<Option<PodDescription>, ProviderError> {
        let query = format!(
            "query Pod($input: PodFilter) {{ pod(input: $input) {{ {} }} }}",
            POD_FIELDS
        );
        let data = match self.query(&query, json!({ "input": { "podId": pod_id } })).await {
            Ok(data) => data,
            Err(ProviderError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        match data.get("pod") {
            None | Some(Value::Null) => Ok(None),
            Some(pod) => {
                let pod: GqlPod = serde_json::from_value(pod.clone())
                    .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
                debug!("Pod {} desired status {:?}", pod.id, pod.desired_status);
                Ok(Some(describe_pod(pod)))
            }
        }
    }

    async fn list_pods(&self) -> Result<Vec<PodDescription>, ProviderError> {
        let query = format!("query Pods {{ myself {{ pods {{ {} }} }} }}", POD_FIELDS);
        let data = self.query(&query, json!({})).await?;
        let pods = data
            .pointer("/myself/pods")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        let pods: Vec<GqlPod> = serde_json::from_value(pods)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(pods.into_iter().map(describe_pod).collect())
    }

    async fn terminate(&self, pod_id: &str) -> Result<(), ProviderError> {
        info!("Requesting termination of pod {}", pod_id);
        self.query(
            "mutation Terminate($input: PodTerminateInput!) { podTerminate(input: $input) }",
            json!({ "input": { "podId": pod_id } }),
        )
        .await
        .map(|_| ())
    }
}
