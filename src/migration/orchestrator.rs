//! Rollout readiness
//!
//! The phase is an operator decision fixed at construction. The
//! orchestrator only reports what the phase enables and whether the legacy
//! procedure can be retired.

use super::phase::{guide, Component, MigrationPhase};
use crate::config::MigrationConfig;
use serde::Serialize;
use std::collections::HashMap;

/// Health of one component as reported by its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub component: Component,
    pub enabled: bool,
    /// `None` when nothing was reported
    pub healthy: Option<bool>,
}

/// Readiness report for the current phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub phase: MigrationPhase,
    pub next_phase: Option<MigrationPhase>,
    pub completed: Vec<String>,
    pub active: Vec<String>,
    pub next_steps: Vec<String>,
    pub components: Vec<ComponentHealth>,
    pub script_retirement_ready: bool,
}

impl MigrationStatus {
    /// Enabled components that are not known to be healthy
    pub fn blocking(&self) -> Vec<Component> {
        self.components
            .iter()
            .filter(|c| c.enabled && c.healthy != Some(true))
            .map(|c| c.component)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOrchestrator {
    phase: MigrationPhase,
}

impl MigrationOrchestrator {
    pub fn new(phase: MigrationPhase) -> Self {
        Self { phase }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.phase)
    }

    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    pub fn is_enabled(&self, component: Component) -> bool {
        self.phase.enabled_components().contains(&component)
    }

    /// Aggregate component health; a missing entry counts as unhealthy
    pub fn status(&self, health: &HashMap<Component, bool>) -> MigrationStatus {
        let components: Vec<ComponentHealth> = Component::ALL
            .iter()
            .map(|&component| ComponentHealth {
                component,
                enabled: self.is_enabled(component),
                healthy: health.get(&component).copied(),
            })
            .collect();

        let all_healthy = components
            .iter()
            .filter(|c| c.enabled)
            .all(|c| c.healthy == Some(true));

        let guide = guide(self.phase);
        let lines = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        MigrationStatus {
            phase: self.phase,
            next_phase: self.phase.next(),
            completed: lines(guide.completed),
            active: lines(guide.active),
            next_steps: lines(guide.next_steps),
            components,
            script_retirement_ready: self.phase.allows_retirement() && all_healthy,
        }
    }
}
