//! What differs between credential classes
//!
//! The [`Rotator`](super::Rotator) owns the state machine. A
//! [`CredentialKind`] supplies the payload: how material is generated, how
//! it reaches a node, how it is proven to work and how the old one goes away.

use super::material::{CredentialClass, CredentialMaterial};
use crate::config::{HealthConfig, TimeoutConfig};
use crate::error::Result;
use crate::registry::{Node, NodeRegistry};
use crate::remote::{execute_with_retry, ExecOutput, Identity, RemoteCommand, RemoteExecutor, RetryPolicy, Session};
use crate::store::{ConfigStore, StoreValue};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// How Distribute walks the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionOrder {
    /// Nodes are independent
    Parallel,
    /// One node at a time, in [`CredentialKind::targets`] order
    Sequential,
}

/// Cluster facts captured before Distribute, checked again by Verify
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Baseline {
    pub ready_nodes: Option<usize>,
}

#[async_trait]
pub trait CredentialKind: Send + Sync {
    fn class(&self) -> CredentialClass;

    fn order(&self) -> DistributionOrder;

    /// Nodes holding this credential, in distribution order
    fn targets(&self, registry: &NodeRegistry) -> Vec<Node> {
        let mut nodes: Vec<Node> = registry.masters().into_iter().cloned().collect();
        nodes.extend(registry.workers().cloned());
        nodes
    }

    async fn generate(&self, interval_days: u32) -> Result<CredentialMaterial>;

    /// Material recorded in the store, or discoverable from the fleet
    async fn current_material(&self, store: &dyn ConfigStore) -> Result<Option<CredentialMaterial>>;

    async fn baseline(&self) -> Result<Baseline> {
        Ok(Baseline::default())
    }

    /// Put `material` on one node without removing `previous`
    async fn distribute_to(
        &self,
        node: &Node,
        material: &CredentialMaterial,
        previous: Option<&CredentialMaterial>,
    ) -> Result<()>;

    /// Prove the new material works on `nodes`
    async fn verify(&self, nodes: &[Node], material: &CredentialMaterial, baseline: &Baseline) -> Result<()>;

    /// Retire old material on one node once the new one is recorded
    async fn revoke_old(&self, node: &Node, material: &CredentialMaterial) -> Result<()>;

    /// Undo `distribute_to` on a node
    async fn rollback(
        &self,
        node: &Node,
        material: &CredentialMaterial,
        previous: Option<&CredentialMaterial>,
    ) -> Result<()>;

    /// Fingerprint of the material a node currently holds. `current` is the
    /// recorded material, when there is one.
    async fn node_fingerprint(&self, node: &Node, current: Option<&CredentialMaterial>) -> Result<Option<String>>;

    /// Bring a node back to the recorded material when the tentative one is
    /// no longer known
    async fn restore(&self, node: &Node, recorded: &CredentialMaterial) -> Result<()> {
        self.distribute_to(node, recorded, None).await
    }

    /// Secret values written by RecordExternally
    fn secret_entries(&self, material: &CredentialMaterial) -> Vec<(String, StoreValue)>;
}

/// Remote access shared by the credential kinds
#[derive(Clone)]
pub struct NodeAccess {
    registry: Arc<NodeRegistry>,
    executor: Arc<dyn RemoteExecutor>,
    identity: Option<Identity>,
    timeouts: TimeoutConfig,
    health: HealthConfig,
    retry: RetryPolicy,
}

impl NodeAccess {
    pub fn new(registry: Arc<NodeRegistry>, executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            registry,
            executor,
            identity: None,
            timeouts: TimeoutConfig::default(),
            health: HealthConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Try `identity` before the configured credentials
    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn health(&self) -> &HealthConfig {
        &self.health
    }

    pub fn session(&self, node: &Node) -> Session {
        let session = Session::for_node(node, &self.registry.credentials(node));
        match &self.identity {
            Some(identity) => session.preferring(identity.clone()),
            None => session,
        }
    }

    /// Run with the access identity; idempotent commands retry transport errors
    pub async fn run(&self, node: &Node, command: &RemoteCommand) -> Result<ExecOutput> {
        self.run_session(&self.session(node), command).await
    }

    /// Run with `identity` only
    pub async fn run_as(&self, node: &Node, identity: Identity, command: &RemoteCommand) -> Result<ExecOutput> {
        let session = self.session(node).with_identity(identity);
        self.run_session(&session, command).await
    }

    /// Run with `identity`, falling back to the configured credentials on
    /// hosts that refuse it
    pub async fn run_preferring(
        &self,
        node: &Node,
        identity: Identity,
        command: &RemoteCommand,
    ) -> Result<ExecOutput> {
        let session = self.session(node).preferring(identity);
        self.run_session(&session, command).await
    }

    async fn run_session(&self, session: &Session, command: &RemoteCommand) -> Result<ExecOutput> {
        execute_with_retry(
            self.executor.as_ref(),
            session,
            command,
            self.timeout_for(command),
            &self.retry,
        )
        .await
    }

    fn timeout_for(&self, command: &RemoteCommand) -> Duration {
        match command {
            RemoteCommand::RestartService { .. } => Duration::from_secs(self.timeouts.node_config_secs),
            _ => Duration::from_secs(self.timeouts.probe_secs),
        }
    }
}
