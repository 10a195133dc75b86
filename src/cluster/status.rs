//! Per-node status and cluster-level aggregation

use crate::provision::InstallDecision;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a node ended up after a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum NodeStatus {
    Ready,
    Failed { reason: String },
    /// Not started, e.g. the run was cancelled first
    Pending,
    /// A dependency failed
    Blocked { by: String },
}

impl NodeStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, NodeStatus::Ready)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Ready => write!(f, "ready"),
            NodeStatus::Failed { reason } => write!(f, "failed: {}", reason),
            NodeStatus::Pending => write!(f, "pending"),
            NodeStatus::Blocked { by } => write!(f, "blocked by {}", by),
        }
    }
}

/// Outcome for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub node: String,
    pub hostname: String,
    pub role: String,
    pub status: NodeStatus,
    /// Install decision of the last attempt, when it got that far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallDecision>,
    /// Chain attempts made
    #[serde(default)]
    pub attempts: u32,
}

/// Result of a provisioning run or a probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterReport {
    pub cluster: String,
    pub master_endpoint: String,
    pub nodes: Vec<NodeOutcome>,
}

impl ClusterReport {
    /// AND of every node's ready flag
    pub fn cluster_ready(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|n| n.status.is_ready())
    }

    pub fn node(&self, id: &str) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|n| n.node == id)
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.status, NodeStatus::Failed { .. }))
    }

    /// Handoff values for collaborators
    pub fn outputs(&self) -> ClusterOutputs {
        ClusterOutputs {
            master_endpoint: self.master_endpoint.clone(),
            cluster_ready: self.cluster_ready(),
            nodes: self
                .nodes
                .iter()
                .map(|n| (n.node.clone(), n.status.clone()))
                .collect(),
        }
    }
}

/// Named outputs consumed by tunnel/ingress declarations and rollout gates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOutputs {
    pub master_endpoint: String,
    pub cluster_ready: bool,
    pub nodes: BTreeMap<String, NodeStatus>,
}
