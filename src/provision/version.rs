//! Installed runtime versions
//!
//! The provisioner records what it finds on each node so that "already
//! installed" and "installed, but a different version" stay distinct.

use crate::error::{KeelError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// What a node reported about its runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledVersion {
    /// Parsed version, `None` when the binary is missing
    pub version: Option<String>,
    /// Whether the runtime unit was active
    pub active: bool,
    pub observed_at: DateTime<Utc>,
}

/// What RuntimeInstall does on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum InstallDecision {
    /// Nothing running; install
    Install,
    /// Active and matching (or nothing pinned); skip
    AlreadyPresent { version: Option<String> },
    /// Active with another version, and upgrades on drift are enabled
    Upgrade { from: Option<String>, to: String },
    /// Active with another version; left alone and reported
    VersionDrift { installed: Option<String>, desired: String },
}

impl InstallDecision {
    /// Decide from a status probe and a version probe
    pub fn decide(observed: &InstalledVersion, desired: Option<&str>, upgrade_on_drift: bool) -> Self {
        if !observed.active {
            return InstallDecision::Install;
        }

        match desired {
            None => InstallDecision::AlreadyPresent {
                version: observed.version.clone(),
            },
            Some(want) if observed.version.as_deref() == Some(want) => {
                InstallDecision::AlreadyPresent {
                    version: observed.version.clone(),
                }
            }
            Some(want) if upgrade_on_drift => InstallDecision::Upgrade {
                from: observed.version.clone(),
                to: want.to_string(),
            },
            Some(want) => InstallDecision::VersionDrift {
                installed: observed.version.clone(),
                desired: want.to_string(),
            },
        }
    }

    /// Whether the install script runs
    pub fn runs_installer(&self) -> bool {
        matches!(self, InstallDecision::Install | InstallDecision::Upgrade { .. })
    }
}

impl std::fmt::Display for InstallDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "unknown".to_string());
        match self {
            InstallDecision::Install => write!(f, "install"),
            InstallDecision::AlreadyPresent { version } => {
                write!(f, "already present ({})", show(version))
            }
            InstallDecision::Upgrade { from, to } => write!(f, "upgrade {} -> {}", show(from), to),
            InstallDecision::VersionDrift { installed, desired } => {
                write!(f, "version drift ({} installed, {} desired)", show(installed), desired)
            }
        }
    }
}

/// Pull the version out of `k3s version v1.30.4+k3s1 (b0c3f2d1)`
pub fn parse_version(output: &str) -> Option<String> {
    let line = output.lines().next()?;
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        if word == "version" {
            return words.next().map(|v| v.to_string());
        }
    }
    None
}

/// Node ID to last observed runtime version
#[derive(Debug, Clone, Default)]
pub struct InstalledVersions {
    entries: Arc<RwLock<HashMap<String, InstalledVersion>>>,
}

impl InstalledVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node: &str, observed: InstalledVersion) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;
        entries.insert(node.to_string(), observed);
        Ok(())
    }

    pub fn get(&self, node: &str) -> Result<Option<InstalledVersion>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(entries.get(node).cloned())
    }

    /// Snapshot, sorted by node ID
    pub fn list(&self) -> Result<Vec<(String, InstalledVersion)>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;
        let mut list: Vec<_> = entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(active: bool, version: Option<&str>) -> InstalledVersion {
        InstalledVersion {
            version: version.map(|v| v.to_string()),
            active,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("k3s version v1.30.4+k3s1 (b0c3f2d1)\ngo version go1.22.5\n"),
            Some("v1.30.4+k3s1".to_string())
        );
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn test_decisions() {
        assert_eq!(
            InstallDecision::decide(&observed(false, None), Some("v1.30.4+k3s1"), false),
            InstallDecision::Install
        );
        assert!(matches!(
            InstallDecision::decide(&observed(true, Some("v1.29.0+k3s1")), None, false),
            InstallDecision::AlreadyPresent { .. }
        ));
        assert!(matches!(
            InstallDecision::decide(&observed(true, Some("v1.30.4+k3s1")), Some("v1.30.4+k3s1"), true),
            InstallDecision::AlreadyPresent { .. }
        ));

        let drift = InstallDecision::decide(&observed(true, Some("v1.29.0+k3s1")), Some("v1.30.4+k3s1"), false);
        assert!(matches!(drift, InstallDecision::VersionDrift { .. }));
        assert!(!drift.runs_installer());

        let upgrade = InstallDecision::decide(&observed(true, Some("v1.29.0+k3s1")), Some("v1.30.4+k3s1"), true);
        assert_eq!(
            upgrade,
            InstallDecision::Upgrade {
                from: Some("v1.29.0+k3s1".to_string()),
                to: "v1.30.4+k3s1".to_string(),
            }
        );
        assert!(upgrade.runs_installer());
    }

    #[test]
    fn test_arena_records_latest() {
        let versions = InstalledVersions::new();
        versions.record("w1", observed(false, None)).unwrap();
        versions.record("w1", observed(true, Some("v1.30.4+k3s1"))).unwrap();
        versions.record("m1", observed(true, Some("v1.30.4+k3s1"))).unwrap();

        let list = versions.list().unwrap();
        assert_eq!(list[0].0, "m1");
        assert!(versions.get("w1").unwrap().unwrap().active);
        assert!(versions.get("w9").unwrap().is_none());
    }
}
