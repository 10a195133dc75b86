//! Local record of an in-flight rotation
//!
//! Written right after Generate and updated as nodes take the new material.
//! Until RecordExternally succeeds this is the only copy of the tentative
//! credential, so it is written atomically with mode 0600.

use super::material::{CredentialClass, CredentialMaterial};
use crate::error::{KeelError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// How far an in-flight rotation got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JournalPhase {
    /// Material generated, not yet on every node
    Distributing,
    /// On every node and verified, not yet recorded externally
    Verified,
}

impl std::fmt::Display for JournalPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalPhase::Distributing => write!(f, "distributing"),
            JournalPhase::Verified => write!(f, "verified"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationJournal {
    pub class: CredentialClass,
    pub rotation_id: String,
    pub phase: JournalPhase,
    pub material: CredentialMaterial,
    /// Material the nodes held before this rotation
    #[serde(default)]
    pub previous: Option<CredentialMaterial>,
    /// Nodes that already hold the new material
    #[serde(default)]
    pub updated_nodes: Vec<String>,
    /// Ready node count observed before the first node was touched
    #[serde(default)]
    pub baseline_ready: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RotationJournal {
    pub fn new(
        class: CredentialClass,
        material: CredentialMaterial,
        previous: Option<CredentialMaterial>,
    ) -> Self {
        let now = Utc::now();
        Self {
            class,
            rotation_id: Uuid::new_v4().to_string(),
            phase: JournalPhase::Distributing,
            material,
            previous,
            updated_nodes: Vec::new(),
            baseline_ready: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn mark_updated(&mut self, node: &str) {
        if !self.is_updated(node) {
            self.updated_nodes.push(node.to_string());
        }
        self.updated_at = Utc::now();
    }

    pub fn is_updated(&self, node: &str) -> bool {
        self.updated_nodes.iter().any(|n| n == node)
    }

    pub fn mark_verified(&mut self) {
        self.phase = JournalPhase::Verified;
        self.updated_at = Utc::now();
    }

    /// Nodes out of `all` that still hold the old material
    pub fn pending<'a>(&self, all: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        all.into_iter()
            .filter(|n| !self.is_updated(n))
            .map(|n| n.to_string())
            .collect()
    }
}

/// Directory of journals, one file per credential class
#[derive(Debug, Clone)]
pub struct JournalStore {
    dir: PathBuf,
}

impl JournalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/keel/journal`
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keel")
            .join("journal")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, class: CredentialClass) -> PathBuf {
        self.dir.join(format!("{}.json", class.name()))
    }

    pub fn load(&self, class: CredentialClass) -> Result<Option<RotationJournal>> {
        let path = self.path(class);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let journal: RotationJournal = serde_json::from_str(&content)?;
        if journal.class != class {
            return Err(KeelError::Store(format!(
                "{} holds a {} journal",
                path.display(),
                journal.class
            )));
        }
        Ok(Some(journal))
    }

    pub fn save(&self, journal: &RotationJournal) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(journal)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        tmp.persist(self.path(journal.class))
            .map_err(|e| KeelError::Io(e.error))?;
        Ok(())
    }

    pub fn clear(&self, class: CredentialClass) -> Result<()> {
        let path = self.path(class);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
