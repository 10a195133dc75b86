//! Cluster file parser

use super::types::ClusterConfig;
use crate::error::{KeelError, Result};
use crate::registry::{ControlPlaneTier, NodeRole};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default cluster file names
pub const DEFAULT_CLUSTER_FILES: &[&str] = &["keel.yaml", "keel.yml", "cluster.yaml", "cluster.yml"];

/// Cluster file parser
pub struct ConfigParser;

impl ConfigParser {
    /// Find cluster file in directory
    pub fn find_cluster_file(dir: &Path) -> Option<PathBuf> {
        for name in DEFAULT_CLUSTER_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Parse cluster file from path
    pub fn parse_file(path: &Path) -> Result<ClusterConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KeelError::ConfigParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_str(&content)
    }

    /// Parse cluster file from string
    pub fn parse_str(content: &str) -> Result<ClusterConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| KeelError::ConfigParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Validate a cluster configuration, returning non-fatal warnings
    pub fn validate(config: &ClusterConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if config.nodes.is_empty() {
            return Err(KeelError::InvalidConfig(
                "Cluster file declares no nodes".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        let mut primaries = Vec::new();

        for node in &config.nodes {
            if node.id.is_empty() {
                return Err(KeelError::InvalidConfig(
                    "Every node needs a non-empty id".to_string(),
                ));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(KeelError::InvalidConfig(format!(
                    "Duplicate node id '{}'",
                    node.id
                )));
            }
            if node.address.is_empty() {
                return Err(KeelError::InvalidConfig(format!(
                    "Node '{}' has no address",
                    node.id
                )));
            }

            match (node.role, node.control_plane_tier) {
                (NodeRole::Master, ControlPlaneTier::Primary) => primaries.push(node.id.as_str()),
                (NodeRole::Master, ControlPlaneTier::Secondary) => {}
                (NodeRole::Master, ControlPlaneTier::None) => {
                    return Err(KeelError::InvalidConfig(format!(
                        "Master '{}' must be in the primary or secondary tier",
                        node.id
                    )));
                }
                (NodeRole::Worker, ControlPlaneTier::None) => {}
                (NodeRole::Worker, tier) => {
                    return Err(KeelError::InvalidConfig(format!(
                        "Worker '{}' cannot be in the {} control-plane tier",
                        node.id, tier
                    )));
                }
            }

            for key in node.labels.keys() {
                if key.trim().is_empty() {
                    return Err(KeelError::InvalidConfig(format!(
                        "Node '{}' has a label with an empty key",
                        node.id
                    )));
                }
            }

            if node.gpu.is_some() && node.role == NodeRole::Master {
                warnings.push(format!(
                    "Node '{}' is a master with a GPU profile; GPU workloads will schedule on the control plane",
                    node.id
                ));
            }
        }

        match primaries.len() {
            1 => {}
            0 => {
                return Err(KeelError::InvalidConfig(
                    "Exactly one node must be the primary master, found none".to_string(),
                ))
            }
            _ => {
                return Err(KeelError::InvalidConfig(format!(
                    "Exactly one node must be the primary master, found {}",
                    primaries.join(", ")
                )))
            }
        }

        if config.health.attempts == 0 {
            return Err(KeelError::InvalidConfig(
                "health.attempts must be at least 1".to_string(),
            ));
        }
        if config.concurrency.max_parallel_nodes == 0 {
            return Err(KeelError::InvalidConfig(
                "concurrency.max_parallel_nodes must be at least 1".to_string(),
            ));
        }
        if config.rotation.authorized_keys_window == 0 {
            return Err(KeelError::InvalidConfig(
                "rotation.authorized_keys_window must be at least 1".to_string(),
            ));
        }

        if config.ssh.identity_file.is_none()
            && config.nodes.iter().any(|n| {
                n.ssh
                    .as_ref()
                    .and_then(|s| s.identity_file.as_ref())
                    .is_none()
            })
        {
            warnings.push(
                "No ssh.identity_file set; sessions will rely on the local ssh agent".to_string(),
            );
        }

        Ok(warnings)
    }
}
