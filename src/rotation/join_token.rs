//! Join token rotation
//!
//! The primary master takes the new token first and must accept connections
//! again before any other node is touched. Workers holding a token the
//! primary does not know would drop out, so distribution is strictly
//! sequential.

use super::kind::{Baseline, CredentialKind, DistributionOrder, NodeAccess};
use super::material::{fingerprint_of, CredentialClass, CredentialMaterial};
use super::token;
use crate::error::{KeelError, Result};
use crate::provision::parse_node_list;
use crate::registry::Node;
use crate::remote::command::SERVER_TOKEN_PATH;
use crate::remote::RemoteCommand;
use crate::secret::Secret;
use crate::store::{ConfigStore, StoreValue};
use async_trait::async_trait;

pub struct JoinTokenKind {
    access: NodeAccess,
}

impl JoinTokenKind {
    pub fn new(access: NodeAccess) -> Self {
        Self { access }
    }

    fn primary(&self) -> Result<Node> {
        Ok(self.access.registry().primary()?.clone())
    }

    async fn ready_count(&self) -> Result<usize> {
        let primary = self.primary()?;
        let output = self.access.run(&primary, &RemoteCommand::ClusterNodes).await?;
        Ok(parse_node_list(&output.stdout)
            .iter()
            .filter(|e| e.is_ready())
            .count())
    }

    async fn wait_api_ready(&self, node: &Node) -> Result<()> {
        let attempts = self.access.health().attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self.access.run(node, &RemoteCommand::ApiReady).await {
                Ok(_) => return Ok(()),
                Err(e) => last = e.to_string(),
            }
            if attempt < attempts {
                tokio::time::sleep(self.access.health().interval()).await;
            }
        }
        Err(KeelError::ProvisioningFailed {
            node: node.id.clone(),
            last_state: format!("API not answering after restart: {}", last),
        })
    }
}

#[async_trait]
impl CredentialKind for JoinTokenKind {
    fn class(&self) -> CredentialClass {
        CredentialClass::JoinToken
    }

    fn order(&self) -> DistributionOrder {
        DistributionOrder::Sequential
    }

    async fn generate(&self, interval_days: u32) -> Result<CredentialMaterial> {
        let value = token::generate();
        token::validate(value.expose())?;
        Ok(CredentialMaterial::token(value, interval_days))
    }

    async fn current_material(&self, store: &dyn ConfigStore) -> Result<Option<CredentialMaterial>> {
        let class = self.class();
        let interval = store
            .get_plain(&class.key("rotation_interval_days"))?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        if let Some(value) = store.get_secret(&class.key("token"))? {
            return Ok(Some(CredentialMaterial::token(value, interval)));
        }

        // Clusters bootstrapped before the store existed
        let primary = self.primary()?;
        let output = self.access.run(&primary, &RemoteCommand::ReadJoinToken).await?;
        let value = output.text();
        if value.is_empty() {
            return Ok(None);
        }
        Ok(Some(CredentialMaterial::token(Secret::new(value), interval)))
    }

    async fn baseline(&self) -> Result<Baseline> {
        Ok(Baseline {
            ready_nodes: Some(self.ready_count().await?),
        })
    }

    async fn distribute_to(
        &self,
        node: &Node,
        material: &CredentialMaterial,
        _previous: Option<&CredentialMaterial>,
    ) -> Result<()> {
        if node.is_master() {
            self.access
                .run(
                    node,
                    &RemoteCommand::WriteFile {
                        path: SERVER_TOKEN_PATH.to_string(),
                        contents: material.value.clone(),
                        mode: 0o600,
                    },
                )
                .await?;
        }
        self.access
            .run(
                node,
                &RemoteCommand::SetEnv {
                    path: node.service_env_file(),
                    key: "K3S_TOKEN".to_string(),
                    value: material.value.clone(),
                },
            )
            .await?;
        self.access
            .run(
                node,
                &RemoteCommand::RestartService {
                    service: node.runtime_service().to_string(),
                },
            )
            .await?;

        if node.is_primary() {
            self.wait_api_ready(node).await?;
            tracing::info!("[{}] primary accepts connections with the new token", node.id);
        }
        Ok(())
    }

    async fn verify(&self, nodes: &[Node], _material: &CredentialMaterial, baseline: &Baseline) -> Result<()> {
        let expected = baseline.ready_nodes.unwrap_or(nodes.len());
        let attempts = self.access.health().attempts.max(1);
        let mut seen = 0;

        for attempt in 1..=attempts {
            match self.ready_count().await {
                Ok(ready) if ready >= expected => return Ok(()),
                Ok(ready) => seen = ready,
                Err(e) => tracing::debug!("node list unavailable: {}", e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.access.health().interval()).await;
            }
        }

        Err(KeelError::ProvisioningFailed {
            node: self.primary()?.id,
            last_state: format!("{} of {} nodes ready after token change", seen, expected),
        })
    }

    /// The primary stopped accepting the old token when it restarted
    async fn revoke_old(&self, _node: &Node, _material: &CredentialMaterial) -> Result<()> {
        Ok(())
    }

    async fn rollback(
        &self,
        node: &Node,
        _material: &CredentialMaterial,
        previous: Option<&CredentialMaterial>,
    ) -> Result<()> {
        let previous = previous.ok_or_else(|| {
            KeelError::Internal(format!("no previous token to restore on {}", node.id))
        })?;
        self.distribute_to(node, previous, None).await
    }

    async fn node_fingerprint(&self, node: &Node, _current: Option<&CredentialMaterial>) -> Result<Option<String>> {
        let output = self
            .access
            .run(
                node,
                &RemoteCommand::ReadEnv {
                    path: node.service_env_file(),
                    key: "K3S_TOKEN".to_string(),
                },
            )
            .await?;
        let value = output.text();
        Ok((!value.is_empty()).then(|| fingerprint_of(value.as_bytes())))
    }

    fn secret_entries(&self, material: &CredentialMaterial) -> Vec<(String, StoreValue)> {
        vec![(self.class().key("token"), StoreValue::Secret(material.value.clone()))]
    }
}
