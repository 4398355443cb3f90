//! Tier catalog
//!
//! Static description of every deployable pod configuration: GPU class, the
//! services to tunnel, and which startup script brings the workload up.
//! Loaded once per process and never mutated afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAGE: &str = "runpod/pytorch:2.4.0-py3.11-cuda12.4.1-devel-ubuntu22.04";
const BLACKWELL_IMAGE: &str = "runpod/pytorch:2.6.0-py3.11-cuda12.6.1-devel-ubuntu22.04";

/// Mount point of the persistent volume on every pod
pub const WORKSPACE: &str = "/workspace";
pub const STARTUP_LOG: &str = "/workspace/startup.log";
const WAN2GP_SERVICE_LOG: &str = "/workspace/wan2gp_service.log";

/// Well-known service ports
pub const WEB_PORT: u16 = 8888;
pub const FILES_PORT: u16 = 3000;
pub const VIDEO_PORT: u16 = 7860;
pub const VNC_PORT: u16 = 5901;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CloudType {
    Secure,
    Community,
}

impl CloudType {
    pub fn as_str(self) -> &'static str {
        match self {
            CloudType::Secure => "SECURE",
            CloudType::Community => "COMMUNITY",
        }
    }
}

/// One deployable tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Catalog key, e.g. "prod"
    pub key: String,
    /// Pod name on the provider; also used to find a reusable pod
    pub pod_name: String,
    pub description: String,
    pub gpu_type_id: String,
    #[serde(default = "default_cloud_type")]
    pub cloud_type: CloudType,
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default = "default_min_vram")]
    pub min_vram_gb: u32,
    #[serde(default = "default_system_ram")]
    pub system_ram_gb: u32,
    #[serde(default = "default_container_disk")]
    pub container_disk_gb: u32,
    #[serde(default = "default_volume_disk")]
    pub volume_disk_gb: u32,
    /// Service name -> remote port
    pub ports: BTreeMap<String, u16>,
    pub startup_script: String,
    #[serde(default)]
    pub setup_script: Option<String>,
    #[serde(default = "default_startup_log")]
    pub startup_log: String,
    /// Log written by the long-running service once it is up
    #[serde(default)]
    pub service_log: Option<String>,
}

fn default_cloud_type() -> CloudType {
    CloudType::Secure
}

fn default_min_vram() -> u32 {
    48
}

fn default_system_ram() -> u32 {
    48
}

fn default_container_disk() -> u32 {
    40
}

fn default_volume_disk() -> u32 {
    150
}

fn default_startup_log() -> String {
    STARTUP_LOG.to_string()
}

impl Tier {
    pub fn image(&self) -> &str {
        self.image_name.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    /// Provider port declaration: every service over http plus ssh
    pub fn exposed_ports(&self) -> String {
        let mut ports: Vec<String> = self.ports.values().map(|p| format!("{}/http", p)).collect();
        ports.push("22/tcp".to_string());
        ports.join(",")
    }

    pub fn allows_remote_port(&self, port: u16) -> bool {
        self.ports.values().any(|p| *p == port)
    }

    /// Remote path the startup script is uploaded to
    pub fn remote_script_path(&self) -> String {
        format!("{}/{}", WORKSPACE, self.startup_script)
    }
}

struct Spec<'a> {
    key: &'a str,
    pod_name: &'a str,
    description: &'a str,
    gpu: &'a str,
    cloud: CloudType,
    vram: u32,
    script: &'a str,
    ports: &'a [(&'a str, u16)],
}

impl Spec<'_> {
    fn build(&self) -> Tier {
        Tier {
            key: self.key.to_string(),
            pod_name: self.pod_name.to_string(),
            description: self.description.to_string(),
            gpu_type_id: self.gpu.to_string(),
            cloud_type: self.cloud,
            image_name: None,
            min_vram_gb: self.vram,
            system_ram_gb: default_system_ram(),
            container_disk_gb: default_container_disk(),
            volume_disk_gb: default_volume_disk(),
            ports: self
                .ports
                .iter()
                .map(|(name, port)| (name.to_string(), *port))
                .collect(),
            startup_script: self.script.to_string(),
            setup_script: None,
            startup_log: default_startup_log(),
            service_log: None,
        }
    }
}

const COMFY_PORTS: &[(&str, u16)] = &[("web", WEB_PORT), ("files", FILES_PORT)];
const VIDEO_PORTS: &[(&str, u16)] = &[("video", VIDEO_PORT), ("files", FILES_PORT)];

/// Built-in tiers
pub fn builtin_tiers() -> Vec<Tier> {
    let mut tiers = vec![
        Spec {
            key: "prod",
            pod_name: "ltx2-comfyui-prod",
            description: "RTX A6000 (48GB) - High Performance",
            gpu: "NVIDIA RTX A6000",
            cloud: CloudType::Secure,
            vram: 48,
            script: "start.sh",
            ports: COMFY_PORTS,
        }
        .build(),
        Spec {
            key: "value",
            pod_name: "ltx2-comfyui-value",
            description: "NVIDIA A40 (48GB) - Best Value",
            gpu: "NVIDIA A40",
            cloud: CloudType::Community,
            vram: 48,
            script: "start.sh",
            ports: COMFY_PORTS,
        }
        .build(),
    ];

    let mut budget = Spec {
        key: "budget",
        pod_name: "hunyuan-comfyui-budget",
        description: "RTX A5000 (24GB) - Quantized Hunyuan",
        gpu: "NVIDIA RTX A5000",
        cloud: CloudType::Secure,
        vram: 24,
        script: "start_budget.sh",
        ports: COMFY_PORTS,
    }
    .build();
    budget.setup_script = Some("setup_hunyuan.py".to_string());
    tiers.push(budget);

    let wan2gp = [
        ("wan2gp", "wan2gp-video-gen", "NVIDIA A40 (48GB) - Wan2GP Standard", "NVIDIA A40", CloudType::Community, 48),
        ("wan2gp-prod", "wan2gp-video-prod", "RTX A6000 (48GB) - Wan2GP Ultra", "NVIDIA RTX A6000", CloudType::Secure, 48),
        ("wan2gp-5090", "wan2gp-video-extreme", "RTX 5090 (32GB) - Blackwell Extreme", "NVIDIA GeForce RTX 5090", CloudType::Community, 32),
        ("wan2gp-4090", "wan2gp-video-4090", "RTX 4090 (24GB) - Wan2GP Premium", "NVIDIA GeForce RTX 4090", CloudType::Community, 24),
    ];
    for (key, pod_name, description, gpu, cloud, vram) in wan2gp {
        let mut tier = Spec {
            key,
            pod_name,
            description,
            gpu,
            cloud,
            vram,
            script: "start_wan2gp.sh",
            ports: VIDEO_PORTS,
        }
        .build();
        tier.service_log = Some(WAN2GP_SERVICE_LOG.to_string());
        match key {
            "wan2gp-5090" => {
                tier.image_name = Some(BLACKWELL_IMAGE.to_string());
                tier.system_ram_gb = 64;
                tier.container_disk_gb = 100;
                tier.volume_disk_gb = 200;
            }
            "wan2gp-4090" => {
                tier.system_ram_gb = 80;
                tier.container_disk_gb = 80;
                tier.volume_disk_gb = 200;
            }
            _ => {}
        }
        tiers.push(tier);
    }

    let mut blender = Spec {
        key: "blender",
        pod_name: "blender-workstation",
        description: "RTX A6000 (48GB) - Blender workstation over VNC",
        gpu: "NVIDIA RTX A6000",
        cloud: CloudType::Secure,
        vram: 48,
        script: "setup_blender.sh",
        ports: &[("files", FILES_PORT), ("vnc", VNC_PORT)],
    }
    .build();
    blender.system_ram_gb = 70;
    tiers.push(blender);

    tiers
}

/// Lookup table over built-in and user-defined tiers
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    tiers: BTreeMap<String, Tier>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateRegistry {
    pub fn builtin() -> Self {
        Self::from_tiers(builtin_tiers())
    }

    pub fn from_tiers(tiers: impl IntoIterator<Item = Tier>) -> Self {
        Self {
            tiers: tiers.into_iter().map(|t| (t.key.clone(), t)).collect(),
        }
    }

    /// Built-ins with user tiers layered on top; same key replaces
    pub fn with_overrides(overrides: impl IntoIterator<Item = Tier>) -> Self {
        let mut registry = Self::builtin();
        for tier in overrides {
            registry.tiers.insert(tier.key.clone(), tier);
        }
        registry
    }

    pub fn get(&self, key: &str) -> Option<&Tier> {
        self.tiers.get(key)
    }

    /// Find the tier whose pod name matches a provider-side pod name
    pub fn by_pod_name(&self, pod_name: &str) -> Option<&Tier> {
        self.tiers.values().find(|t| t.pod_name == pod_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.values()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let registry = TemplateRegistry::builtin();
        assert_eq!(registry.len(), 8);

        let prod = registry.get("prod").unwrap();
        assert_eq!(prod.ports.get("web"), Some(&8888));
        assert_eq!(prod.ports.get("files"), Some(&3000));
        assert_eq!(prod.image(), DEFAULT_IMAGE);
        assert_eq!(prod.startup_log, STARTUP_LOG);

        let budget = registry.get("budget").unwrap();
        assert_eq!(budget.setup_script.as_deref(), Some("setup_hunyuan.py"));

        let extreme = registry.get("wan2gp-5090").unwrap();
        assert_eq!(extreme.ports.get("video"), Some(&7860));
        assert_eq!(extreme.image(), BLACKWELL_IMAGE);
        assert!(extreme.service_log.is_some());
    }

    #[test]
    fn test_not_every_tier_exposes_every_service() {
        let registry = TemplateRegistry::builtin();
        assert!(!registry.get("wan2gp").unwrap().ports.contains_key("web"));
        assert!(!registry.get("prod").unwrap().ports.contains_key("video"));
    }

    #[test]
    fn test_exposed_ports_include_ssh() {
        let registry = TemplateRegistry::builtin();
        assert_eq!(
            registry.get("prod").unwrap().exposed_ports(),
            "3000/http,8888/http,22/tcp"
        );
    }

    #[test]
    fn test_overrides_replace_by_key() {
        let mut custom = TemplateRegistry::builtin().get("prod").unwrap().clone();
        custom.gpu_type_id = "NVIDIA H100 80GB HBM3".into();
        let mut extra = custom.clone();
        extra.key = "h100".into();
        extra.pod_name = "h100-pod".into();

        let registry = TemplateRegistry::with_overrides(vec![custom, extra]);
        assert_eq!(registry.len(), 9);
        assert_eq!(registry.get("prod").unwrap().gpu_type_id, "NVIDIA H100 80GB HBM3");
        assert_eq!(registry.by_pod_name("h100-pod").unwrap().key, "h100");
    }

    #[test]
    fn test_tier_deserializes_with_defaults() {
        let json = r#"{
            "key": "mini",
            "pod_name": "mini-pod",
            "description": "small",
            "gpu_type_id": "NVIDIA L4",
            "ports": {"web": 8888},
            "startup_script": "start.sh"
        }"#;
        let tier: Tier = serde_json::from_str(json).unwrap();
        assert_eq!(tier.cloud_type, CloudType::Secure);
        assert_eq!(tier.volume_disk_gb, 150);
        assert_eq!(tier.startup_log, STARTUP_LOG);
        assert_eq!(tier.remote_script_path(), "/workspace/start.sh");
    }
}
