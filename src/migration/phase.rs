//! Rollout phases and the components each one enables

use crate::error::{KeelError, Result};
use serde::{Deserialize, Serialize};

/// Rollout phase, in the only order phases may be entered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationPhase {
    /// Provisioning only; the legacy procedure still owns credentials
    #[default]
    Preparation,
    /// Health checks run next to the legacy procedure
    ParallelValidation,
    /// Keel owns every component
    Cutover,
    /// Legacy procedure removed
    Cleanup,
}

impl MigrationPhase {
    pub const ALL: [MigrationPhase; 4] = [
        MigrationPhase::Preparation,
        MigrationPhase::ParallelValidation,
        MigrationPhase::Cutover,
        MigrationPhase::Cleanup,
    ];

    pub fn next(self) -> Option<MigrationPhase> {
        match self {
            MigrationPhase::Preparation => Some(MigrationPhase::ParallelValidation),
            MigrationPhase::ParallelValidation => Some(MigrationPhase::Cutover),
            MigrationPhase::Cutover => Some(MigrationPhase::Cleanup),
            MigrationPhase::Cleanup => None,
        }
    }

    /// Forward moves only; staying put is allowed
    pub fn can_transition_to(self, target: MigrationPhase) -> bool {
        target >= self
    }

    /// Components active in this phase
    pub fn enabled_components(self) -> &'static [Component] {
        match self {
            MigrationPhase::Preparation => &[Component::ClusterProvisioning],
            MigrationPhase::ParallelValidation => {
                &[Component::ClusterProvisioning, Component::HealthVerification]
            }
            MigrationPhase::Cutover | MigrationPhase::Cleanup => &Component::ALL,
        }
    }

    /// Whether the legacy procedure may be retired once everything is healthy
    pub fn allows_retirement(self) -> bool {
        matches!(self, MigrationPhase::Cutover | MigrationPhase::Cleanup)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationPhase::Preparation => write!(f, "preparation"),
            MigrationPhase::ParallelValidation => write!(f, "parallel-validation"),
            MigrationPhase::Cutover => write!(f, "cutover"),
            MigrationPhase::Cleanup => write!(f, "cleanup"),
        }
    }
}

impl std::str::FromStr for MigrationPhase {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "preparation" => Ok(MigrationPhase::Preparation),
            "parallel-validation" => Ok(MigrationPhase::ParallelValidation),
            "cutover" => Ok(MigrationPhase::Cutover),
            "cleanup" => Ok(MigrationPhase::Cleanup),
            other => Err(KeelError::InvalidConfig(format!(
                "Unknown migration phase '{}', expected one of preparation, parallel-validation, cutover, cleanup",
                other
            ))),
        }
    }
}

/// Independently health-checked parts of the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    ClusterProvisioning,
    SshKeyRotation,
    TokenRotation,
    HealthVerification,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::ClusterProvisioning,
        Component::SshKeyRotation,
        Component::TokenRotation,
        Component::HealthVerification,
    ];
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::ClusterProvisioning => write!(f, "cluster-provisioning"),
            Component::SshKeyRotation => write!(f, "ssh-key-rotation"),
            Component::TokenRotation => write!(f, "token-rotation"),
            Component::HealthVerification => write!(f, "health-verification"),
        }
    }
}

/// Operator guidance for one phase
pub(crate) struct PhaseGuide {
    pub completed: &'static [&'static str],
    pub active: &'static [&'static str],
    pub next_steps: &'static [&'static str],
}

pub(crate) fn guide(phase: MigrationPhase) -> PhaseGuide {
    match phase {
        MigrationPhase::Preparation => PhaseGuide {
            completed: &[],
            active: &["Declarative cluster provisioning"],
            next_steps: &[
                "Provision the cluster with `keel provision` and confirm every node is ready",
                "Record the current join token and SSH key in the config store",
                "Move to parallel-validation once provisioning is repeatable",
            ],
        },
        MigrationPhase::ParallelValidation => PhaseGuide {
            completed: &["Declarative cluster provisioning"],
            active: &["Health verification next to the legacy checks"],
            next_steps: &[
                "Compare `keel status` with the legacy health checks after every change",
                "Keep changing credentials with the legacy procedure for now",
                "Move to cutover once both agree",
            ],
        },
        MigrationPhase::Cutover => PhaseGuide {
            completed: &["Declarative cluster provisioning", "Parallel health validation"],
            active: &["SSH key rotation", "Join token rotation", "Health verification"],
            next_steps: &[
                "Rotate the SSH key and the join token with `keel rotate`",
                "Stop running the legacy procedure",
                "Retire the legacy procedure once every component reports healthy",
            ],
        },
        MigrationPhase::Cleanup => PhaseGuide {
            completed: &[
                "Declarative cluster provisioning",
                "Parallel health validation",
                "Credential rotation cutover",
            ],
            active: &["Steady-state operation"],
            next_steps: &[
                "Delete the legacy scripts and the credentials only they used",
                "Run `keel rotate ssh` and `keel rotate token` on a schedule",
            ],
        },
    }
}
