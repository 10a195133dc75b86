//! SSH authorized-key rotation
//!
//! Keys are additive: the new public key is appended next to the old one,
//! proven by logging in with it alone, and the file is only trimmed after
//! the new key is recorded. Nodes are independent, so distribution runs in
//! parallel.

use super::kind::{Baseline, CredentialKind, DistributionOrder, NodeAccess};
use super::material::{ssh_fingerprint, CredentialClass, CredentialMaterial};
use crate::error::{KeelError, Result};
use crate::registry::Node;
use crate::remote::command::MANAGED_KEY_TAG;
use crate::remote::{ExecOutput, Identity, RemoteCommand};
use crate::secret::Secret;
use crate::store::{ConfigStore, StoreValue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

/// A freshly generated key pair
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub private_key: Secret,
    /// OpenSSH public key line
    pub public_key: String,
}

/// Source of new key pairs
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    async fn generate(&self, comment: &str) -> Result<GeneratedKey>;
}

/// Generates ed25519 keys with the local `ssh-keygen`
#[derive(Debug, Clone)]
pub struct SshKeygen {
    program: String,
}

impl Default for SshKeygen {
    fn default() -> Self {
        Self {
            program: "ssh-keygen".to_string(),
        }
    }
}

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(&self, comment: &str) -> Result<GeneratedKey> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("id_ed25519");

        let output = Command::new(&self.program)
            .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
            .arg(&path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| KeelError::KeyGeneration(format!("could not run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(KeelError::KeyGeneration(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let private_key = tokio::fs::read_to_string(&path).await?;
        let public_key = tokio::fs::read_to_string(path.with_extension("pub")).await?;

        Ok(GeneratedKey {
            private_key: Secret::new(private_key),
            public_key: public_key.trim().to_string(),
        })
    }
}

/// Comment stamped on managed keys: `keel-managed@<host>`
pub fn managed_comment() -> String {
    format!(
        "{}@{}",
        MANAGED_KEY_TAG,
        gethostname::gethostname().to_string_lossy()
    )
}

/// The recorded managed key, as a session identity
pub fn managed_identity(store: &dyn ConfigStore) -> Result<Option<Identity>> {
    Ok(store
        .get_secret(&CredentialClass::SshKey.key("private_key"))?
        .map(Identity::Inline))
}

/// Rotates the managed SSH key in every node's authorized-keys file
pub struct SshKeyKind {
    access: NodeAccess,
    generator: Arc<dyn KeyGenerator>,
    authorized_keys: String,
    window: usize,
}

impl SshKeyKind {
    pub fn new(access: NodeAccess, generator: Arc<dyn KeyGenerator>, authorized_keys: &str, window: usize) -> Self {
        Self {
            access,
            generator,
            authorized_keys: authorized_keys.to_string(),
            window: window.max(1),
        }
    }

    fn public_key(material: &CredentialMaterial) -> Result<&str> {
        material
            .public
            .as_deref()
            .ok_or_else(|| KeelError::Internal("SSH material without a public key".to_string()))
    }

    /// Run with `material`'s private key, or the access identity when there
    /// is no managed key yet. Hosts that do not trust the key yet, such as
    /// nodes added after the last rotation, are reached with the configured
    /// credentials.
    async fn run_with(
        &self,
        node: &Node,
        material: Option<&CredentialMaterial>,
        command: &RemoteCommand,
    ) -> Result<ExecOutput> {
        match material {
            Some(m) => {
                self.access
                    .run_preferring(node, Identity::Inline(m.value.clone()), command)
                    .await
            }
            None => self.access.run(node, command).await,
        }
    }

    async fn managed_lines(&self, node: &Node, current: Option<&CredentialMaterial>) -> Result<Vec<String>> {
        let output = self
            .run_with(
                node,
                current,
                &RemoteCommand::ReadFile {
                    path: self.authorized_keys.clone(),
                },
            )
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| l.contains(MANAGED_KEY_TAG))
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl CredentialKind for SshKeyKind {
    fn class(&self) -> CredentialClass {
        CredentialClass::SshKey
    }

    fn order(&self) -> DistributionOrder {
        DistributionOrder::Parallel
    }

    async fn generate(&self, interval_days: u32) -> Result<CredentialMaterial> {
        let key = self.generator.generate(&managed_comment()).await?;
        Ok(CredentialMaterial::key_pair(key.private_key, key.public_key, interval_days))
    }

    async fn current_material(&self, store: &dyn ConfigStore) -> Result<Option<CredentialMaterial>> {
        let class = self.class();
        let Some(private) = store.get_secret(&class.key("private_key"))? else {
            return Ok(None);
        };
        let public = store.get_plain(&class.key("public_key"))?.ok_or_else(|| {
            KeelError::Store(format!("{} is set but {} is not", class.key("private_key"), class.key("public_key")))
        })?;
        let interval = store
            .get_plain(&class.key("rotation_interval_days"))?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        let mut material = CredentialMaterial::key_pair(private, public, interval);
        if let Some(last) = store.get_plain(&class.key("last_rotation"))? {
            if let Ok(at) = DateTime::parse_from_rfc3339(last.trim()) {
                material.created_at = at.with_timezone(&Utc);
            }
        }
        Ok(Some(material))
    }

    async fn distribute_to(
        &self,
        node: &Node,
        material: &CredentialMaterial,
        previous: Option<&CredentialMaterial>,
    ) -> Result<()> {
        let public = Self::public_key(material)?;
        self.run_with(
            node,
            previous,
            &RemoteCommand::BackupFile {
                path: self.authorized_keys.clone(),
            },
        )
        .await?;
        self.run_with(
            node,
            previous,
            &RemoteCommand::AppendLine {
                path: self.authorized_keys.clone(),
                line: public.to_string(),
            },
        )
        .await?;
        tracing::debug!("[{}] appended key {}", node.id, material.fingerprint);
        Ok(())
    }

    async fn verify(&self, nodes: &[Node], material: &CredentialMaterial, _baseline: &Baseline) -> Result<()> {
        for node in nodes {
            let output = self
                .access
                .run_as(node, Identity::Inline(material.value.clone()), &RemoteCommand::Probe)
                .await?;
            if output.text() != "keel-ok" {
                return Err(KeelError::Connection {
                    node: node.id.clone(),
                    message: format!("unexpected probe output: {}", output.text()),
                });
            }
            tracing::debug!("[{}] new key accepted", node.id);
        }
        Ok(())
    }

    async fn revoke_old(&self, node: &Node, material: &CredentialMaterial) -> Result<()> {
        self.run_with(
            node,
            Some(material),
            &RemoteCommand::TrimToLast {
                path: self.authorized_keys.clone(),
                keep: self.window,
            },
        )
        .await?;
        Ok(())
    }

    async fn rollback(
        &self,
        node: &Node,
        material: &CredentialMaterial,
        previous: Option<&CredentialMaterial>,
    ) -> Result<()> {
        self.run_with(
            node,
            previous,
            &RemoteCommand::RemoveLine {
                path: self.authorized_keys.clone(),
                line: Self::public_key(material)?.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    async fn node_fingerprint(&self, node: &Node, current: Option<&CredentialMaterial>) -> Result<Option<String>> {
        Ok(self
            .managed_lines(node, current)
            .await?
            .last()
            .map(|line| ssh_fingerprint(line)))
    }

    /// Drop managed keys newer than the recorded one
    async fn restore(&self, node: &Node, recorded: &CredentialMaterial) -> Result<()> {
        let public = Self::public_key(recorded)?;
        let fingerprint = ssh_fingerprint(public);
        let lines = self.managed_lines(node, Some(recorded)).await?;
        let newer = lines
            .iter()
            .rposition(|l| ssh_fingerprint(l) == fingerprint)
            .map(|i| lines[i + 1..].to_vec())
            .unwrap_or(lines);

        for line in newer {
            self.run_with(
                node,
                Some(recorded),
                &RemoteCommand::RemoveLine {
                    path: self.authorized_keys.clone(),
                    line,
                },
            )
            .await?;
        }
        self.run_with(
            node,
            Some(recorded),
            &RemoteCommand::AppendLine {
                path: self.authorized_keys.clone(),
                line: public.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    fn secret_entries(&self, material: &CredentialMaterial) -> Vec<(String, StoreValue)> {
        let class = self.class();
        vec![
            (class.key("private_key"), StoreValue::Secret(material.value.clone())),
            (
                class.key("public_key"),
                StoreValue::plain(material.public.clone().unwrap_or_default()),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::registry::test_registry;
    use crate::remote::sim::{SimKeyGenerator, SimulatedFleet, AUTHORIZED_KEYS, OPERATOR_KEY};
    use crate::remote::RetryPolicy;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn kind(fleet: Arc<SimulatedFleet>, registry: crate::registry::NodeRegistry) -> SshKeyKind {
        let access = NodeAccess::new(Arc::new(registry), fleet)
            .with_retry(RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)));
        SshKeyKind::new(access, Arc::new(SimKeyGenerator::default()), AUTHORIZED_KEYS, 3)
    }

    #[tokio::test]
    async fn test_additive_distribution_and_verify() {
        let registry = test_registry(0, 1);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let ssh = kind(fleet.clone(), registry.clone());
        let w1 = registry.get("w1").unwrap().clone();

        let material = ssh.generate(90).await.unwrap();
        assert!(material.public.as_deref().unwrap().contains(MANAGED_KEY_TAG));
        assert!(material.fingerprint.starts_with("SHA256:"));

        // not yet trusted
        assert!(ssh.verify(&[w1.clone()], &material, &Baseline::default()).await.is_err());

        ssh.distribute_to(&w1, &material, None).await.unwrap();
        let keys = fleet.authorized_keys("w1");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], OPERATOR_KEY);
        assert!(fleet.host("w1").files.contains_key("/root/.ssh/authorized_keys.keel.bak"));

        ssh.verify(&[w1.clone()], &material, &Baseline::default()).await.unwrap();
        assert_eq!(
            ssh.node_fingerprint(&w1, None).await.unwrap().as_deref(),
            Some(material.fingerprint.as_str())
        );
    }

    #[tokio::test]
    async fn test_rollback_removes_only_the_new_key() {
        let registry = test_registry(0, 1);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let ssh = kind(fleet.clone(), registry.clone());
        let w1 = registry.get("w1").unwrap().clone();

        let material = ssh.generate(90).await.unwrap();
        ssh.distribute_to(&w1, &material, None).await.unwrap();
        ssh.rollback(&w1, &material, None).await.unwrap();

        assert_eq!(fleet.authorized_keys("w1"), vec![OPERATOR_KEY.to_string()]);
        assert!(ssh.node_fingerprint(&w1, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_keeps_window() {
        let registry = test_registry(0, 1);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let ssh = kind(fleet.clone(), registry.clone());
        let w1 = registry.get("w1").unwrap().clone();

        let mut previous: Option<CredentialMaterial> = None;
        for _ in 0..4 {
            let material = ssh.generate(90).await.unwrap();
            ssh.distribute_to(&w1, &material, previous.as_ref()).await.unwrap();
            ssh.revoke_old(&w1, &material).await.unwrap();
            previous = Some(material);
        }

        let keys = fleet.authorized_keys("w1");
        assert_eq!(keys.len(), 3);
        assert!(!keys.contains(&OPERATOR_KEY.to_string()));
        assert_eq!(keys[2], previous.unwrap().public.unwrap());
    }

    #[tokio::test]
    async fn test_restore_drops_unrecorded_keys() {
        let registry = test_registry(0, 1);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let ssh = kind(fleet.clone(), registry.clone());
        let w1 = registry.get("w1").unwrap().clone();

        let recorded = ssh.generate(90).await.unwrap();
        ssh.distribute_to(&w1, &recorded, None).await.unwrap();
        let stray = ssh.generate(90).await.unwrap();
        ssh.distribute_to(&w1, &stray, Some(&recorded)).await.unwrap();

        ssh.restore(&w1, &recorded).await.unwrap();
        assert_eq!(
            ssh.node_fingerprint(&w1, Some(&recorded)).await.unwrap().as_deref(),
            Some(recorded.fingerprint.as_str())
        );
        assert!(!fleet.authorized_keys("w1").contains(stray.public.as_ref().unwrap()));
    }

    #[tokio::test]
    async fn test_current_material_and_identity() {
        let registry = test_registry(0, 0);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let ssh = kind(fleet, registry);
        let store = MemoryStore::new();

        assert!(ssh.current_material(&store).await.unwrap().is_none());
        assert!(managed_identity(&store).unwrap().is_none());

        let material = ssh.generate(90).await.unwrap();
        store.set_many(ssh.secret_entries(&material)).unwrap();

        let loaded = ssh.current_material(&store).await.unwrap().unwrap();
        assert_eq!(loaded.fingerprint, material.fingerprint);
        assert_eq!(
            managed_identity(&store).unwrap(),
            Some(Identity::Inline(material.value.clone()))
        );
    }

    #[tokio::test]
    async fn test_ssh_keygen() {
        if std::process::Command::new("ssh-keygen")
            .arg("-V")
            .stderr(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .is_err()
        {
            return;
        }

        let key = SshKeygen::default().generate("keel-managed@test").await.unwrap();
        assert!(key.public_key.starts_with("ssh-ed25519 "));
        assert!(key.public_key.ends_with("keel-managed@test"));
        assert!(key.private_key.expose().contains("PRIVATE KEY"));
    }
}
