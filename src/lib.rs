//! Keel - node provisioning and credential rotation for small k3s clusters
//!
//! Keel brings a fleet of hosts described in a cluster file to a running
//! k3s cluster and keeps the fleet's credentials fresh:
//!
//! - Idempotent per-node provisioning over SSH
//! - Dependency-ordered cluster orchestration (primary, secondaries, workers)
//! - SSH key and join token rotation without a credential gap
//! - Phased rollout reporting for replacing a legacy procedure

pub mod cluster;
pub mod config;
pub mod error;
pub mod migration;
pub mod provision;
pub mod registry;
pub mod remote;
pub mod rotation;
pub mod secret;
pub mod store;

pub use error::{KeelError, Result};
