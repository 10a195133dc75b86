//! Node provisioning
//!
//! A node moves through a fixed chain of steps. Each step is a list of
//! typed remote commands, so a plan can be inspected without touching a
//! host.

pub mod flags;
pub mod provisioner;
pub mod step;
pub mod version;

pub use flags::JoinInfo;
pub use provisioner::{parse_node_list, NodeListEntry, NodeProvisioner, NodeReport, ProvisionSettings};
pub use step::{NodeState, ProvisioningStep, StepKind};
pub use version::{InstallDecision, InstalledVersion, InstalledVersions};
