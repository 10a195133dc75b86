//! Cluster node description

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Node role in the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Worker node, runs the agent service
    #[default]
    Worker,
    /// Master node, runs the server service
    Master,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Worker => write!(f, "worker"),
            NodeRole::Master => write!(f, "master"),
        }
    }
}

/// Position of a master in the control plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlPlaneTier {
    /// Initializes the cluster
    Primary,
    /// Joins the primary as an additional server
    Secondary,
    /// Not part of the control plane
    #[default]
    None,
}

impl std::fmt::Display for ControlPlaneTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlPlaneTier::Primary => write!(f, "primary"),
            ControlPlaneTier::Secondary => write!(f, "secondary"),
            ControlPlaneTier::None => write!(f, "none"),
        }
    }
}

/// GPU vendor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    #[default]
    Nvidia,
}

/// GPU features of a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuProfile {
    /// Vendor
    #[serde(default)]
    pub vendor: GpuVendor,
    /// Card model, informational
    #[serde(default)]
    pub model: Option<String>,
    /// Number of devices
    #[serde(default = "default_gpu_count")]
    pub count: u32,
}

fn default_gpu_count() -> u32 {
    1
}

/// Per-node SSH overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshOverride {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

/// Cluster node
///
/// Identity is `id`; the address may change without changing identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Stable node ID
    pub id: String,
    /// Hostname, as reported in the cluster node list
    pub hostname: String,
    /// Address used for SSH and the API endpoint
    pub address: String,
    /// Node role
    #[serde(default)]
    pub role: NodeRole,
    /// Control-plane tier (masters only)
    #[serde(default)]
    pub control_plane_tier: ControlPlaneTier,
    /// GPU profile, if the node carries accelerators
    #[serde(default)]
    pub gpu: Option<GpuProfile>,
    /// Node labels passed to the runtime
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// SSH overrides
    #[serde(default)]
    pub ssh: Option<SshOverride>,
}

impl Node {
    /// Create a node with no labels, GPU or SSH overrides
    pub fn new(id: &str, hostname: &str, address: &str, role: NodeRole, tier: ControlPlaneTier) -> Self {
        Self {
            id: id.to_string(),
            hostname: hostname.to_string(),
            address: address.to_string(),
            role,
            control_plane_tier: tier,
            gpu: None,
            labels: BTreeMap::new(),
            ssh: None,
        }
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Attach a GPU profile
    pub fn with_gpu(mut self, gpu: GpuProfile) -> Self {
        self.gpu = Some(gpu);
        self
    }

    /// Check if node is a master
    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }

    /// Check if node initializes the cluster
    pub fn is_primary(&self) -> bool {
        self.control_plane_tier == ControlPlaneTier::Primary
    }

    /// Check if node is a secondary master
    pub fn is_secondary(&self) -> bool {
        self.is_master() && self.control_plane_tier == ControlPlaneTier::Secondary
    }

    /// Check if node has a GPU profile
    pub fn has_gpu(&self) -> bool {
        self.gpu.is_some()
    }

    /// Runtime systemd unit on this node
    pub fn runtime_service(&self) -> &'static str {
        if self.is_master() {
            "k3s"
        } else {
            "k3s-agent"
        }
    }

    /// Environment file of the runtime unit
    pub fn service_env_file(&self) -> String {
        format!("/etc/systemd/system/{}.service.env", self.runtime_service())
    }

    /// API endpoint served by this node (masters)
    pub fn api_endpoint(&self, port: u16) -> String {
        format!("https://{}:{}", self.address, port)
    }
}
