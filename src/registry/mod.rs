//! Node registry
//!
//! Static description of every node: address, role, control-plane tier,
//! GPU profile, labels and SSH credentials.

pub mod node;
#[allow(clippy::module_inception)]
pub mod registry;

pub use node::{ControlPlaneTier, GpuProfile, GpuVendor, Node, NodeRole, SshOverride};
pub use registry::{NodeCredentials, NodeRegistry};

#[cfg(test)]
pub(crate) use registry::test_registry;
