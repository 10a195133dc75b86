//! Static node registry

use super::node::Node;
use crate::config::{ClusterConfig, ConfigParser, SshConfig};
use crate::error::{KeelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Resolved SSH credentials for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCredentials {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
}

/// Every node in the cluster, in declaration order
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    ssh: SshConfig,
    api_port: u16,
}

impl NodeRegistry {
    /// Build a registry from a validated cluster file
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        ConfigParser::validate(config)?;
        Ok(Self::from_parts(
            config.nodes.clone(),
            config.ssh.clone(),
            config.runtime.api_port,
        ))
    }

    /// Build a registry without cluster-file validation
    pub fn from_parts(nodes: Vec<Node>, ssh: SshConfig, api_port: u16) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        Self {
            nodes,
            index,
            ssh,
            api_port,
        }
    }

    /// Get a node by ID
    pub fn get(&self, id: &str) -> Result<&Node> {
        self.index
            .get(id)
            .map(|&i| &self.nodes[i])
            .ok_or_else(|| KeelError::NodeNotFound(id.to_string()))
    }

    /// List all nodes
    pub fn all(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node that initializes the cluster
    pub fn primary(&self) -> Result<&Node> {
        self.nodes
            .iter()
            .find(|n| n.is_primary())
            .ok_or_else(|| KeelError::InvalidConfig("No primary master declared".to_string()))
    }

    /// Secondary masters, in declaration order
    pub fn secondary_masters(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_secondary())
    }

    /// All masters, primary first
    pub fn masters(&self) -> Vec<&Node> {
        let mut masters: Vec<&Node> = self.nodes.iter().filter(|n| n.is_master()).collect();
        masters.sort_by_key(|n| !n.is_primary());
        masters
    }

    /// Workers, in declaration order
    pub fn workers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.is_master())
    }

    /// Control-plane API port
    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    /// API endpoint of the primary master, handed to collaborators
    pub fn master_endpoint(&self) -> Result<String> {
        Ok(self.primary()?.api_endpoint(self.api_port))
    }

    /// SSH defaults
    pub fn ssh(&self) -> &SshConfig {
        &self.ssh
    }

    /// Resolve SSH credentials, applying per-node overrides
    pub fn credentials(&self, node: &Node) -> NodeCredentials {
        let over = node.ssh.clone().unwrap_or_default();
        NodeCredentials {
            user: over.user.unwrap_or_else(|| self.ssh.user.clone()),
            port: over.port.unwrap_or(self.ssh.port),
            identity_file: over
                .identity_file
                .or_else(|| self.ssh.identity_file.clone()),
        }
    }

    /// Restrict the registry to the given node IDs; the primary is always kept
    pub fn select(&self, ids: &[String]) -> Result<Self> {
        if ids.is_empty() {
            return Ok(self.clone());
        }
        for id in ids {
            self.get(id)?;
        }

        let nodes = self
            .nodes
            .iter()
            .filter(|n| n.is_primary() || ids.contains(&n.id))
            .cloned()
            .collect();

        Ok(Self::from_parts(nodes, self.ssh.clone(), self.api_port))
    }
}

#[cfg(test)]
pub(crate) fn test_registry(secondaries: usize, workers: usize) -> NodeRegistry {
    use super::node::{ControlPlaneTier, NodeRole};

    let mut nodes = vec![Node::new(
        "m1",
        "master-1",
        "10.0.0.10",
        NodeRole::Master,
        ControlPlaneTier::Primary,
    )];
    for i in 0..secondaries {
        nodes.push(Node::new(
            &format!("m{}", i + 2),
            &format!("master-{}", i + 2),
            &format!("10.0.0.{}", 11 + i),
            NodeRole::Master,
            ControlPlaneTier::Secondary,
        ));
    }
    for i in 0..workers {
        nodes.push(Node::new(
            &format!("w{}", i + 1),
            &format!("worker-{}", i + 1),
            &format!("10.0.1.{}", 20 + i),
            NodeRole::Worker,
            ControlPlaneTier::None,
        ));
    }

    NodeRegistry::from_parts(nodes, SshConfig::default(), 6443)
}
