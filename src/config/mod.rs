//! Cluster file loading
//!
//! The cluster file is the static description of every node plus the
//! defaults used by provisioning and rotation.

pub mod parser;
pub mod types;

pub use parser::ConfigParser;
pub use types::{
    ClusterConfig, ConcurrencyConfig, HealthConfig, MigrationConfig, MirrorConfig,
    RotationConfig, RuntimeConfig, SshConfig, StoreConfig, TimeoutConfig,
};
