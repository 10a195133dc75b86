//! Migration from the legacy procedure
//!
//! Four ordered phases, each enabling a fixed set of components. Readiness
//! to retire the legacy procedure is derived from component health.

pub mod orchestrator;
pub mod phase;

pub use orchestrator::{ComponentHealth, MigrationOrchestrator, MigrationStatus};
pub use phase::{Component, MigrationPhase};
