//! Provisioning steps and the per-node state machine

use crate::config::TimeoutConfig;
use crate::remote::RemoteCommand;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of a provisioning step, in chain order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    SystemPrep,
    RuntimeInstall,
    NodeConfig,
    HealthCheck,
}

impl StepKind {
    /// The per-node chain
    pub const CHAIN: [StepKind; 4] = [
        StepKind::SystemPrep,
        StepKind::RuntimeInstall,
        StepKind::NodeConfig,
        StepKind::HealthCheck,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::SystemPrep => "system-prep",
            StepKind::RuntimeInstall => "runtime-install",
            StepKind::NodeConfig => "node-config",
            StepKind::HealthCheck => "health-check",
        }
    }

    /// Wall-clock budget for each remote call made by this step
    pub fn timeout(&self, timeouts: &TimeoutConfig) -> Duration {
        let secs = match self {
            StepKind::SystemPrep => timeouts.system_prep_secs,
            StepKind::RuntimeInstall => timeouts.runtime_install_secs,
            StepKind::NodeConfig => timeouts.node_config_secs,
            StepKind::HealthCheck => timeouts.probe_secs,
        };
        Duration::from_secs(secs)
    }

    /// The step that must complete before this one on the same node
    pub fn previous(&self) -> Option<StepKind> {
        match self {
            StepKind::SystemPrep => None,
            StepKind::RuntimeInstall => Some(StepKind::SystemPrep),
            StepKind::NodeConfig => Some(StepKind::RuntimeInstall),
            StepKind::HealthCheck => Some(StepKind::NodeConfig),
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A named unit of remote work bound to one node
#[derive(Debug, Clone)]
pub struct ProvisioningStep {
    /// `<node>/<kind>`
    pub name: String,
    pub node: String,
    pub kind: StepKind,
    /// Commands in execution order. Commands that depend on probe results
    /// (package manager, join token) are resolved when the step runs.
    pub commands: Vec<RemoteCommand>,
    /// Names of steps that must finish first
    pub depends_on: Vec<String>,
    pub timeout: Duration,
}

impl ProvisioningStep {
    pub fn step_name(node: &str, kind: StepKind) -> String {
        format!("{}/{}", node, kind)
    }
}

/// Per-node provisioning state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    Pending,
    SystemPrep,
    RuntimeInstall,
    NodeConfig,
    HealthCheck,
    Ready,
    Failed,
}

impl NodeState {
    /// The state entered when `kind` starts
    pub fn entering(kind: StepKind) -> Self {
        match kind {
            StepKind::SystemPrep => NodeState::SystemPrep,
            StepKind::RuntimeInstall => NodeState::RuntimeInstall,
            StepKind::NodeConfig => NodeState::NodeConfig,
            StepKind::HealthCheck => NodeState::HealthCheck,
        }
    }

    /// Linear successor on success
    pub fn next(&self) -> NodeState {
        match self {
            NodeState::Pending => NodeState::SystemPrep,
            NodeState::SystemPrep => NodeState::RuntimeInstall,
            NodeState::RuntimeInstall => NodeState::NodeConfig,
            NodeState::NodeConfig => NodeState::HealthCheck,
            NodeState::HealthCheck | NodeState::Ready => NodeState::Ready,
            NodeState::Failed => NodeState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Ready | NodeState::Failed)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::SystemPrep => "system-prep",
            NodeState::RuntimeInstall => "runtime-install",
            NodeState::NodeConfig => "node-config",
            NodeState::HealthCheck => "health-check",
            NodeState::Ready => "ready",
            NodeState::Failed => "failed",
        };
        f.write_str(s)
    }
}
