//! Cluster provisioning
//!
//! Composes node provisioners along the dependency graph and aggregates
//! their results into a single readiness signal.

pub mod graph;
pub mod orchestrator;
pub mod status;

pub use graph::DependencyGraph;
pub use orchestrator::ClusterOrchestrator;
pub use status::{ClusterOutputs, ClusterReport, NodeOutcome, NodeStatus};
