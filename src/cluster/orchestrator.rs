//! Cluster provisioning scheduler
//!
//! Dispatches node provisioners in dependency order. A node starts once all
//! of its dependencies are ready; independent nodes run concurrently up to a
//! cap. A failed node blocks its dependents but not its siblings.

use super::graph::DependencyGraph;
use super::status::{ClusterReport, NodeOutcome, NodeStatus};
use crate::config::ClusterConfig;
use crate::error::{KeelError, Result};
use crate::provision::{
    InstallDecision, InstalledVersions, JoinInfo, NodeProvisioner, NodeReport, ProvisionSettings,
    ProvisioningStep,
};
use crate::registry::{Node, NodeRegistry};
use crate::remote::{retry_if, Identity, RemoteExecutor, RetryPolicy, Session};
use crate::secret::Secret;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type NodeRun = (String, u32, Result<NodeReport>);

/// Provisions a whole cluster
pub struct ClusterOrchestrator {
    cluster: String,
    registry: Arc<NodeRegistry>,
    graph: DependencyGraph,
    provisioner: NodeProvisioner,
    max_parallel: usize,
    node_retry: RetryPolicy,
    /// Join token recorded in the config store, reused on rebuilds
    join_token: Option<Secret>,
    /// Key used instead of the configured credentials
    identity: Option<Identity>,
    cancel: CancellationToken,
}

impl ClusterOrchestrator {
    pub fn new(
        config: &ClusterConfig,
        registry: NodeRegistry,
        executor: Arc<dyn RemoteExecutor>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let graph = DependencyGraph::from_registry(&registry)?;
        let concurrency = &config.concurrency;
        let provisioner = NodeProvisioner::new(
            executor,
            ProvisionSettings::from_config(config),
            InstalledVersions::new(),
            cancel.clone(),
        );

        Ok(Self {
            cluster: config.cluster_name().to_string(),
            registry: Arc::new(registry),
            graph,
            provisioner,
            max_parallel: concurrency.max_parallel_nodes.max(1),
            node_retry: RetryPolicy::new(
                concurrency.node_attempts,
                Duration::from_millis(concurrency.backoff_initial_ms),
                Duration::from_millis(concurrency.backoff_max_ms),
            ),
            join_token: None,
            identity: None,
            cancel,
        })
    }

    /// Reuse an existing join token instead of letting the primary mint one
    pub fn with_join_token(mut self, token: Option<Secret>) -> Self {
        self.join_token = token;
        self
    }

    /// Try `identity` first in every session, e.g. the managed key. Hosts
    /// that refuse it are reached with the configured credentials.
    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_node_retry(mut self, policy: RetryPolicy) -> Self {
        self.node_retry = policy;
        self
    }

    pub fn with_provision_settings(mut self, settings: ProvisionSettings) -> Self {
        self.provisioner = NodeProvisioner::new(
            self.provisioner.executor(),
            settings,
            self.provisioner.versions().clone(),
            self.cancel.clone(),
        );
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn installed_versions(&self) -> &InstalledVersions {
        self.provisioner.versions()
    }

    fn session(&self, node: &Node) -> Session {
        let session = Session::for_node(node, &self.registry.credentials(node));
        match &self.identity {
            Some(identity) => session.preferring(identity.clone()),
            None => session,
        }
    }

    fn initial_join(&self) -> Result<Option<JoinInfo>> {
        let endpoint = self.registry.master_endpoint()?;
        Ok(self.join_token.clone().map(|token| JoinInfo {
            server_url: endpoint,
            token,
        }))
    }

    /// Every node's steps in dispatch order, secrets redacted
    pub fn plan(&self) -> Result<Vec<ProvisioningStep>> {
        let placeholder = JoinInfo {
            server_url: self.registry.master_endpoint()?,
            token: Secret::new("<join-token>"),
        };

        let mut steps = Vec::new();
        for id in self.graph.order() {
            let node = self.registry.get(id)?;
            let join = if node.is_primary() { None } else { Some(&placeholder) };
            steps.extend(self.provisioner.plan(node, join, self.graph.dependencies(id)));
        }
        Ok(steps)
    }

    /// Provision every node, respecting dependencies
    pub async fn provision(&self) -> Result<ClusterReport> {
        let started = std::time::Instant::now();
        let workers = self.max_parallel.min(self.graph.len()).max(1);
        tracing::info!(
            "Provisioning cluster {} ({} nodes, {} at a time)",
            self.cluster,
            self.graph.len(),
            workers
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut join = self.initial_join()?;
        let mut status: HashMap<String, NodeStatus> = self
            .graph
            .order()
            .iter()
            .map(|id| (id.clone(), NodeStatus::Pending))
            .collect();
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut installs: HashMap<String, InstallDecision> = HashMap::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut tasks: JoinSet<NodeRun> = JoinSet::new();

        loop {
            if !self.cancel.is_cancelled() {
                for id in self.graph.order() {
                    let dispatchable = status.get(id) == Some(&NodeStatus::Pending)
                        && !running.contains(id)
                        && self
                            .graph
                            .dependencies(id)
                            .iter()
                            .all(|dep| status.get(dep) == Some(&NodeStatus::Ready));
                    if !dispatchable {
                        continue;
                    }

                    let node = self.registry.get(id)?.clone();
                    running.insert(id.clone());
                    tasks.spawn(run_node(
                        self.provisioner.clone(),
                        node.clone(),
                        self.session(&node),
                        join.clone(),
                        self.node_retry.clone(),
                        semaphore.clone(),
                    ));
                }
            }

            let Some(finished) = tasks.join_next().await else {
                break;
            };

            let (id, tries, result) = match finished {
                Ok(run) => run,
                Err(e) => {
                    tracing::error!("Provisioning task failed: {}", e);
                    continue;
                }
            };
            running.remove(&id);
            attempts.insert(id.clone(), tries);

            match result {
                Ok(report) => {
                    if let Some(info) = report.join.clone() {
                        join = Some(info);
                    }
                    installs.insert(id.clone(), report.install);
                    status.insert(id, NodeStatus::Ready);
                }
                Err(KeelError::Cancelled) => {
                    status.insert(id, NodeStatus::Pending);
                }
                Err(e) => {
                    tracing::error!("[{}] provisioning failed: {}", id, e);
                    for dependent in self.graph.dependents(&id) {
                        if status.get(&dependent) == Some(&NodeStatus::Pending) {
                            tracing::warn!("[{}] blocked by {}", dependent, id);
                            status.insert(dependent, NodeStatus::Blocked { by: id.clone() });
                        }
                    }
                    status.insert(id, NodeStatus::Failed { reason: e.to_string() });
                }
            }
        }

        // Tasks lost to a panic never reported back
        for id in running {
            status.insert(
                id,
                NodeStatus::Failed {
                    reason: "provisioning task aborted".to_string(),
                },
            );
        }

        let report = self.report(status, attempts, installs)?;
        tracing::info!(
            "Cluster {} provisioned in {:.1}s, ready: {}",
            self.cluster,
            started.elapsed().as_secs_f64(),
            report.cluster_ready()
        );
        Ok(report)
    }

    /// One readiness probe per node, without changing anything
    pub async fn probe(&self) -> Result<ClusterReport> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel.min(self.graph.len()).max(1)));
        let mut tasks = JoinSet::new();

        for node in self.registry.all() {
            let provisioner = self.provisioner.clone();
            let node = node.clone();
            let session = self.session(&node);
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let status = match provisioner.probe_ready(&node, &session).await {
                    Ok(true) => NodeStatus::Ready,
                    Ok(false) => NodeStatus::Failed {
                        reason: "not ready".to_string(),
                    },
                    Err(e) => NodeStatus::Failed { reason: e.to_string() },
                };
                (node.id, status)
            });
        }

        let mut status = HashMap::new();
        while let Some(finished) = tasks.join_next().await {
            match finished {
                Ok((id, s)) => {
                    status.insert(id, s);
                }
                Err(e) => tracing::error!("Probe task failed: {}", e),
            }
        }

        self.report(status, HashMap::new(), HashMap::new())
    }

    fn report(
        &self,
        mut status: HashMap<String, NodeStatus>,
        attempts: HashMap<String, u32>,
        mut installs: HashMap<String, InstallDecision>,
    ) -> Result<ClusterReport> {
        let nodes = self
            .registry
            .all()
            .iter()
            .map(|node| NodeOutcome {
                node: node.id.clone(),
                hostname: node.hostname.clone(),
                role: node.role.to_string(),
                status: status.remove(&node.id).unwrap_or(NodeStatus::Pending),
                install: installs.remove(&node.id),
                attempts: attempts.get(&node.id).copied().unwrap_or(0),
            })
            .collect();

        Ok(ClusterReport {
            cluster: self.cluster.clone(),
            master_endpoint: self.registry.master_endpoint()?,
            nodes,
        })
    }
}

/// Run one node's chain, re-running it while failures look recoverable
async fn run_node(
    provisioner: NodeProvisioner,
    node: Node,
    session: Session,
    join: Option<JoinInfo>,
    policy: RetryPolicy,
    semaphore: Arc<Semaphore>,
) -> NodeRun {
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => return (node.id.clone(), 0, Err(KeelError::Internal(e.to_string()))),
    };

    let label = format!("[{}] provisioning", node.id);
    let mut tries = 0u32;
    let result = retry_if(
        &policy,
        &label,
        |e| !matches!(e, KeelError::Cancelled | KeelError::InvalidConfig(_)),
        || {
            tries += 1;
            provisioner.provision(&node, &session, join.as_ref())
        },
    )
    .await;

    (node.id.clone(), tries, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthConfig, RuntimeConfig, TimeoutConfig};
    use crate::registry::registry::test_registry;
    use crate::remote::sim::{CallRecord, FaultKind, SimulatedFleet};

    fn fast_settings() -> ProvisionSettings {
        ProvisionSettings {
            runtime: RuntimeConfig::default(),
            health: HealthConfig {
                attempts: 2,
                interval_secs: 0,
            },
            timeouts: TimeoutConfig::default(),
            command_retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)),
        }
    }

    fn orchestrator(registry: NodeRegistry, fleet: Arc<SimulatedFleet>) -> ClusterOrchestrator {
        ClusterOrchestrator::new(&ClusterConfig::default(), registry, fleet, CancellationToken::new())
            .unwrap()
            .with_provision_settings(fast_settings())
            .with_node_retry(RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)))
    }

    fn window(calls: &[CallRecord], ids: &[&str]) -> (u64, u64) {
        let mine: Vec<&CallRecord> = calls.iter().filter(|c| ids.contains(&c.node.as_str())).collect();
        let first_start = mine.iter().map(|c| c.start).min().unwrap();
        let last_end = mine.iter().map(|c| c.end).max().unwrap();
        (first_start, last_end)
    }

    #[tokio::test]
    async fn test_dependents_wait_for_primary() {
        for (secondaries, workers) in [(0, 1), (1, 2), (2, 3), (3, 5)] {
            let registry = test_registry(secondaries, workers);
            let fleet = Arc::new(SimulatedFleet::new(&registry));
            fleet.set_latency("m1", Duration::from_millis(2));
            let orch = orchestrator(registry.clone(), fleet.clone());

            let report = orch.provision().await.unwrap();
            assert!(report.cluster_ready());

            let calls = fleet.calls();
            let (_, primary_end) = window(&calls, &["m1"]);
            let others: Vec<&str> = registry
                .all()
                .iter()
                .filter(|n| !n.is_primary())
                .map(|n| n.id.as_str())
                .collect();
            let (others_start, _) = window(&calls, &others);
            assert!(others_start > primary_end);

            let masters: Vec<&str> = registry.masters().iter().map(|n| n.id.as_str()).collect();
            let worker_ids: Vec<&str> = registry.workers().map(|n| n.id.as_str()).collect();
            let (_, masters_end) = window(&calls, &masters);
            let (workers_start, _) = window(&calls, &worker_ids);
            assert!(workers_start > masters_end);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_plus_one_plus_two_scenario() {
        let registry = test_registry(1, 2);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        // 13 remote calls on a fresh primary
        fleet.set_latency("m1", Duration::from_secs(7));
        let orch = orchestrator(registry.clone(), fleet.clone());

        let started = tokio::time::Instant::now();
        let report = orch.provision().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(90));
        assert!(report.cluster_ready());
        for id in ["m1", "m2", "w1", "w2"] {
            assert_eq!(report.node(id).unwrap().status, NodeStatus::Ready);
            assert_eq!(report.node(id).unwrap().install, Some(InstallDecision::Install));
        }

        let calls = fleet.calls();
        let (_, primary_end) = window(&calls, &["m1"]);
        let (others_start, _) = window(&calls, &["m2", "w1", "w2"]);
        assert!(others_start > primary_end);

        let token = fleet.env_token("m1").unwrap();
        for id in ["m2", "w1", "w2"] {
            assert_eq!(fleet.env_token(id).unwrap(), token);
        }
    }

    #[tokio::test]
    async fn test_failed_worker_only_affects_itself() {
        let registry = test_registry(1, 3);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        fleet.set_reachable("w2", false);
        let orch = orchestrator(registry, fleet.clone());

        let report = orch.provision().await.unwrap();

        assert!(!report.cluster_ready());
        for id in ["m1", "m2", "w1", "w3"] {
            assert!(report.node(id).unwrap().status.is_ready(), "{} not ready", id);
        }
        let failed = report.node("w2").unwrap();
        assert!(matches!(&failed.status, NodeStatus::Failed { reason } if reason.contains("No route")));
        assert_eq!(failed.attempts, 2);
    }

    #[tokio::test]
    async fn test_failed_secondary_blocks_workers_not_siblings() {
        let registry = test_registry(2, 2);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        fleet.inject("m2", "install-runtime", 10, FaultKind::Exit(1));
        let orch = orchestrator(registry, fleet.clone());

        let report = orch.provision().await.unwrap();

        assert!(report.node("m1").unwrap().status.is_ready());
        assert!(report.node("m3").unwrap().status.is_ready());
        assert!(matches!(report.node("m2").unwrap().status, NodeStatus::Failed { .. }));
        for id in ["w1", "w2"] {
            assert_eq!(
                report.node(id).unwrap().status,
                NodeStatus::Blocked { by: "m2".to_string() }
            );
            assert!(fleet.calls_for(id).is_empty());
        }
    }

    #[tokio::test]
    async fn test_transient_failure_recovered_by_node_retry() {
        let registry = test_registry(0, 1);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        // install is never retried at the command level
        fleet.inject("w1", "install-runtime", 1, FaultKind::Connection);
        let orch = orchestrator(registry, fleet.clone());

        let report = orch.provision().await.unwrap();

        assert!(report.cluster_ready());
        assert_eq!(report.node("w1").unwrap().attempts, 2);
        assert_eq!(fleet.host("w1").install_count, 1);
    }

    #[tokio::test]
    async fn test_managed_key_with_configured_fallback() {
        use crate::rotation::ssh::KeyGenerator;
        use crate::remote::sim::{SimKeyGenerator, AUTHORIZED_KEYS};

        let registry = test_registry(0, 2);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let managed = SimKeyGenerator::default().generate("keel-managed@test").await.unwrap();
        // w2 joined the file after the operator key was retired elsewhere
        for id in ["m1", "w1"] {
            fleet.update_host(id, |host| {
                host.files
                    .insert(AUTHORIZED_KEYS.to_string(), format!("{}\n", managed.public_key));
            });
        }

        let orch = orchestrator(registry, fleet.clone())
            .with_identity(Some(Identity::Inline(managed.private_key.clone())));
        let report = orch.provision().await.unwrap();

        assert!(report.cluster_ready());
        assert!(fleet.calls_for("m1").iter().all(|c| c.ok));
        assert!(fleet.calls_for("w2").iter().any(|c| !c.ok));
        assert_eq!(fleet.host("w2").install_count, 1);
    }

    #[tokio::test]
    async fn test_existing_token_is_reused() {
        let registry = test_registry(0, 1);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let token = crate::rotation::token::generate();
        let orch = orchestrator(registry, fleet.clone()).with_join_token(Some(token.clone()));

        let report = orch.provision().await.unwrap();

        assert!(report.cluster_ready());
        assert_eq!(fleet.env_token("m1").unwrap(), token.expose());
        assert_eq!(fleet.env_token("w1").unwrap(), token.expose());
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_nodes_pending() {
        let registry = test_registry(0, 2);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let orch = ClusterOrchestrator::new(&ClusterConfig::default(), registry, fleet.clone(), cancel)
            .unwrap()
            .with_provision_settings(fast_settings());

        let report = orch.provision().await.unwrap();

        assert!(report.nodes.iter().all(|n| n.status == NodeStatus::Pending));
        assert!(fleet.calls().is_empty());
    }

    #[tokio::test]
    async fn test_probe_aggregates_readiness() {
        let registry = test_registry(1, 2);
        let token = crate::rotation::token::generate();
        let fleet = Arc::new(SimulatedFleet::provisioned(&registry, token.expose()));
        let orch = orchestrator(registry, fleet.clone());

        assert!(orch.probe().await.unwrap().cluster_ready());

        fleet.update_host("w1", |h| {
            h.services.insert("k3s-agent".to_string(), false);
        });
        let report = orch.probe().await.unwrap();
        assert!(!report.cluster_ready());
        assert!(matches!(report.node("w1").unwrap().status, NodeStatus::Failed { .. }));
        assert!(report.node("w2").unwrap().status.is_ready());
        assert_eq!(report.outputs().master_endpoint, "https://10.0.0.10:6443");
    }

    #[test]
    fn test_plan_is_topological() {
        let registry = test_registry(1, 1);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let orch = orchestrator(registry, fleet);

        let names: Vec<String> = orch.plan().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names.len(), 12);
        assert_eq!(names[0], "m1/system-prep");
        assert_eq!(names[3], "m1/health-check");
        assert_eq!(names[4], "m2/system-prep");
        assert_eq!(names[8], "w1/system-prep");
    }
}
