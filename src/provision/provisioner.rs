//! Per-node provisioning
//!
//! Drives one node through `SystemPrep -> RuntimeInstall -> NodeConfig ->
//! HealthCheck`. Every step is safe to re-run on a provisioned node. The
//! provisioner never re-runs a failed chain; that is the cluster
//! orchestrator's decision.

use super::flags::{self, JoinInfo};
use super::step::{NodeState, ProvisioningStep, StepKind};
use super::version::{parse_version, InstallDecision, InstalledVersion, InstalledVersions};
use crate::config::{ClusterConfig, HealthConfig, RuntimeConfig, TimeoutConfig};
use crate::error::{KeelError, Result};
use crate::registry::Node;
use crate::remote::{
    execute_with_retry, ExecOutput, OsFamily, RemoteCommand, RemoteExecutor, RetryPolicy, Session,
};
use crate::secret::Secret;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Settings shared by every node provisioner of a run
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub runtime: RuntimeConfig,
    pub health: HealthConfig,
    pub timeouts: TimeoutConfig,
    /// Retry policy for idempotent commands hitting transport errors
    pub command_retry: RetryPolicy,
}

impl ProvisionSettings {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            runtime: config.runtime.clone(),
            health: config.health.clone(),
            timeouts: config.timeouts.clone(),
            command_retry: RetryPolicy::default(),
        }
    }
}

/// Result of a successful provisioning run
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node: String,
    pub state: NodeState,
    pub os_family: OsFamily,
    pub install: InstallDecision,
    /// Join info published by the primary master
    #[serde(skip)]
    pub join: Option<JoinInfo>,
    pub elapsed_secs: f64,
}

/// One node list entry from the cluster API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeListEntry {
    pub hostname: String,
    pub status: String,
}

impl NodeListEntry {
    pub fn is_ready(&self) -> bool {
        self.status == "Ready"
    }
}

/// Parse `kubectl get nodes --no-headers` output
pub fn parse_node_list(output: &str) -> Vec<NodeListEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let hostname = fields.next()?;
            let status = fields.next()?;
            Some(NodeListEntry {
                hostname: hostname.to_string(),
                status: status.to_string(),
            })
        })
        .collect()
}

/// Provisions nodes through a [`RemoteExecutor`]
#[derive(Clone)]
pub struct NodeProvisioner {
    executor: Arc<dyn RemoteExecutor>,
    settings: Arc<ProvisionSettings>,
    versions: InstalledVersions,
    cancel: CancellationToken,
}

impl NodeProvisioner {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        settings: ProvisionSettings,
        versions: InstalledVersions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            settings: Arc::new(settings),
            versions,
            cancel,
        }
    }

    pub fn executor(&self) -> Arc<dyn RemoteExecutor> {
        self.executor.clone()
    }

    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    pub fn versions(&self) -> &InstalledVersions {
        &self.versions
    }

    /// Steps this node would run, with probe-dependent commands shown for an
    /// unknown OS family
    pub fn plan(&self, node: &Node, join: Option<&JoinInfo>, depends_on: &[String]) -> Vec<ProvisioningStep> {
        let family = OsFamily::Unknown;
        let service = node.runtime_service().to_string();
        let timeouts = &self.settings.timeouts;

        StepKind::CHAIN
            .iter()
            .map(|&kind| {
                let commands = match kind {
                    StepKind::SystemPrep => self.system_prep_commands(node, family),
                    StepKind::RuntimeInstall => vec![
                        RemoteCommand::ServiceStatus {
                            service: service.clone(),
                        },
                        RemoteCommand::RuntimeVersion,
                        RemoteCommand::InstallRuntime(flags::install_spec(
                            node,
                            &self.settings.runtime,
                            join,
                        )),
                    ],
                    StepKind::NodeConfig => self.node_config_commands(node, family),
                    StepKind::HealthCheck => vec![if node.is_primary() {
                        RemoteCommand::ClusterNodes
                    } else {
                        RemoteCommand::ServiceStatus {
                            service: service.clone(),
                        }
                    }],
                };

                let depends = match kind.previous() {
                    Some(prev) => vec![ProvisioningStep::step_name(&node.id, prev)],
                    None => depends_on
                        .iter()
                        .map(|dep| ProvisioningStep::step_name(dep, StepKind::HealthCheck))
                        .collect(),
                };

                ProvisioningStep {
                    name: ProvisioningStep::step_name(&node.id, kind),
                    node: node.id.clone(),
                    kind,
                    commands,
                    depends_on: depends,
                    timeout: kind.timeout(timeouts),
                }
            })
            .collect()
    }

    /// Run the full chain on one node
    ///
    /// `join` is required for every node but the primary, unless the runtime
    /// is already present there.
    pub async fn provision(&self, node: &Node, session: &Session, join: Option<&JoinInfo>) -> Result<NodeReport> {
        let started = Instant::now();
        tracing::info!("[{}] provisioning {} ({})", node.id, node.hostname, node.role);

        self.enter(node, StepKind::SystemPrep)?;
        let family = self.system_prep(node, session).await?;

        self.enter(node, StepKind::RuntimeInstall)?;
        let (install, join_out) = self.runtime_install(node, session, join).await?;

        self.enter(node, StepKind::NodeConfig)?;
        self.node_config(node, session, family).await?;

        self.enter(node, StepKind::HealthCheck)?;
        self.health_check(node, session).await?;

        tracing::info!(
            "[{}] ready after {:.1}s ({})",
            node.id,
            started.elapsed().as_secs_f64(),
            install
        );

        Ok(NodeReport {
            node: node.id.clone(),
            state: NodeState::Ready,
            os_family: family,
            install,
            join: join_out,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    /// Poll a node once; `Ok(true)` when it reports ready
    pub async fn probe_ready(&self, node: &Node, session: &Session) -> Result<bool> {
        let (ready, _) = self.observe_health(node, session).await?;
        Ok(ready)
    }

    fn enter(&self, node: &Node, kind: StepKind) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::warn!("[{}] cancelled before {}", node.id, kind);
            return Err(KeelError::Cancelled);
        }
        tracing::debug!("[{}] -> {}", node.id, NodeState::entering(kind));
        Ok(())
    }

    async fn run(&self, session: &Session, command: &RemoteCommand, kind: StepKind) -> Result<ExecOutput> {
        execute_with_retry(
            self.executor.as_ref(),
            session,
            command,
            kind.timeout(&self.settings.timeouts),
            &self.settings.command_retry,
        )
        .await
    }

    fn system_prep_commands(&self, node: &Node, family: OsFamily) -> Vec<RemoteCommand> {
        vec![
            RemoteCommand::UpdatePackages { family },
            RemoteCommand::OpenFirewallPorts {
                family,
                rules: flags::required_ports(node),
            },
            RemoteCommand::ApplySysctl {
                params: flags::sysctl_params(),
            },
            RemoteCommand::CreateDirectories {
                paths: flags::runtime_dirs(),
            },
        ]
    }

    fn node_config_commands(&self, node: &Node, family: OsFamily) -> Vec<RemoteCommand> {
        let mut commands = Vec::new();
        if node.has_gpu() {
            commands.push(RemoteCommand::ConfigureGpuRuntime {
                family,
                service: node.runtime_service().to_string(),
            });
        }
        commands.push(RemoteCommand::ConfigureLogRotation);
        commands
    }

    async fn system_prep(&self, node: &Node, session: &Session) -> Result<OsFamily> {
        let output = self
            .run(session, &RemoteCommand::DetectOs, StepKind::HealthCheck)
            .await?;
        let family = OsFamily::from_os_release(&output.stdout);
        tracing::debug!("[{}] os family {}", node.id, family);

        for command in self.system_prep_commands(node, family) {
            self.run(session, &command, StepKind::SystemPrep).await?;
        }
        Ok(family)
    }

    async fn observe_runtime(&self, node: &Node, session: &Session) -> Result<InstalledVersion> {
        let status = self
            .run(
                session,
                &RemoteCommand::ServiceStatus {
                    service: node.runtime_service().to_string(),
                },
                StepKind::HealthCheck,
            )
            .await?;
        let version = self
            .run(session, &RemoteCommand::RuntimeVersion, StepKind::HealthCheck)
            .await?;

        let observed = InstalledVersion {
            version: parse_version(&version.stdout),
            active: status.text() == "active",
            observed_at: Utc::now(),
        };
        self.versions.record(&node.id, observed.clone())?;
        Ok(observed)
    }

    async fn runtime_install(
        &self,
        node: &Node,
        session: &Session,
        join: Option<&JoinInfo>,
    ) -> Result<(InstallDecision, Option<JoinInfo>)> {
        let runtime = &self.settings.runtime;
        let observed = self.observe_runtime(node, session).await?;
        let decision = InstallDecision::decide(&observed, runtime.version.as_deref(), runtime.upgrade_on_drift);

        match &decision {
            InstallDecision::VersionDrift { installed, desired } => tracing::warn!(
                "[{}] runtime version {} differs from pinned {}; leaving it in place",
                node.id,
                installed.as_deref().unwrap_or("unknown"),
                desired
            ),
            InstallDecision::AlreadyPresent { .. } => {
                tracing::info!("[{}] runtime already active, skipping install", node.id)
            }
            _ => {}
        }

        if decision.runs_installer() {
            if !node.is_primary() && join.is_none() {
                return Err(KeelError::InvalidConfig(format!(
                    "{} cannot join without the primary master's endpoint and token",
                    node.id
                )));
            }

            let spec = flags::install_spec(node, runtime, join);
            let command = RemoteCommand::InstallRuntime(spec);
            tracing::info!("[{}] {}", node.id, command.describe());
            self.run(session, &command, StepKind::RuntimeInstall).await?;
            self.observe_runtime(node, session).await?;
        }

        let join_out = if node.is_primary() {
            let output = self
                .run(session, &RemoteCommand::ReadJoinToken, StepKind::HealthCheck)
                .await?;
            Some(JoinInfo {
                server_url: node.api_endpoint(runtime.api_port),
                token: Secret::new(output.text()),
            })
        } else {
            None
        };

        Ok((decision, join_out))
    }

    async fn node_config(&self, node: &Node, session: &Session, family: OsFamily) -> Result<()> {
        if !node.has_gpu() {
            tracing::debug!("[{}] no GPU profile, skipping GPU runtime", node.id);
        }
        for command in self.node_config_commands(node, family) {
            self.run(session, &command, StepKind::NodeConfig).await?;
        }
        Ok(())
    }

    /// Returns readiness and a description of what was observed. The primary
    /// must list itself as Ready; every other node only needs its local
    /// service active.
    async fn observe_health(&self, node: &Node, session: &Session) -> Result<(bool, String)> {
        if node.is_primary() {
            let output = self
                .run(session, &RemoteCommand::ClusterNodes, StepKind::HealthCheck)
                .await?;
            let entry = parse_node_list(&output.stdout)
                .into_iter()
                .find(|e| e.hostname == node.hostname);
            Ok(match entry {
                Some(entry) => (entry.is_ready(), entry.status),
                None => (false, "absent from node list".to_string()),
            })
        } else {
            let output = self
                .run(
                    session,
                    &RemoteCommand::ServiceStatus {
                        service: node.runtime_service().to_string(),
                    },
                    StepKind::HealthCheck,
                )
                .await?;
            let status = output.text().to_string();
            Ok((status == "active", status))
        }
    }

    async fn health_check(&self, node: &Node, session: &Session) -> Result<()> {
        let attempts = self.settings.health.attempts.max(1);
        let interval = self.settings.health.interval();
        let mut last_state = "not probed".to_string();

        for attempt in 1..=attempts {
            match self.observe_health(node, session).await {
                Ok((true, _)) => return Ok(()),
                Ok((false, state)) => last_state = state,
                Err(e) => last_state = e.to_string(),
            }
            tracing::debug!("[{}] health {}/{}: {}", node.id, attempt, attempts, last_state);

            if attempt < attempts {
                self.pause(interval).await?;
            }
        }

        tracing::error!("[{}] not ready after {} probes: {}", node.id, attempts, last_state);
        Err(KeelError::ProvisioningFailed {
            node: node.id.clone(),
            last_state,
        })
    }

    async fn pause(&self, interval: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(KeelError::Cancelled),
            _ = tokio::time::sleep(interval) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::registry::test_registry;
    use crate::registry::{GpuProfile, GpuVendor, NodeRegistry};
    use crate::remote::sim::{FaultKind, SimHost, SimulatedFleet, SIM_VERSION};
    use crate::rotation::token;

    fn settings() -> ProvisionSettings {
        ProvisionSettings {
            runtime: RuntimeConfig::default(),
            health: HealthConfig {
                attempts: 3,
                interval_secs: 0,
            },
            timeouts: TimeoutConfig::default(),
            command_retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        }
    }

    fn provisioner(fleet: Arc<SimulatedFleet>, settings: ProvisionSettings) -> NodeProvisioner {
        NodeProvisioner::new(fleet, settings, InstalledVersions::new(), CancellationToken::new())
    }

    fn session(registry: &NodeRegistry, id: &str) -> Session {
        let node = registry.get(id).unwrap();
        Session::for_node(node, &registry.credentials(node))
    }

    #[tokio::test]
    async fn test_fresh_primary_publishes_join_info() {
        let registry = test_registry(0, 0);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let p = provisioner(fleet.clone(), settings());
        let primary = registry.primary().unwrap();

        let report = p.provision(primary, &session(&registry, "m1"), None).await.unwrap();

        assert_eq!(report.state, NodeState::Ready);
        assert_eq!(report.install, InstallDecision::Install);
        assert_eq!(report.os_family, OsFamily::Debian);
        let join = report.join.unwrap();
        assert_eq!(join.server_url, "https://10.0.0.10:6443");
        assert!(token::validate(join.token.expose()).is_ok());
        assert_eq!(p.versions().get("m1").unwrap().unwrap().version.as_deref(), Some(SIM_VERSION));
    }

    #[tokio::test]
    async fn test_second_run_changes_nothing() {
        let mut nodes = test_registry(0, 2).all().to_vec();
        nodes[2] = nodes[2].clone().with_gpu(GpuProfile {
            vendor: GpuVendor::Nvidia,
            model: None,
            count: 1,
        });
        let registry = NodeRegistry::from_parts(nodes, Default::default(), 6443);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let p = provisioner(fleet.clone(), settings());

        let first = p
            .provision(registry.primary().unwrap(), &session(&registry, "m1"), None)
            .await
            .unwrap();
        let join = first.join.clone().unwrap();
        for id in ["w1", "w2"] {
            p.provision(registry.get(id).unwrap(), &session(&registry, id), Some(&join))
                .await
                .unwrap();
        }

        let before: Vec<SimHost> = ["m1", "w1", "w2"].iter().map(|id| fleet.host(id)).collect();
        assert!(before[2].gpu_runtime);

        let again = p
            .provision(registry.primary().unwrap(), &session(&registry, "m1"), None)
            .await
            .unwrap();
        assert_eq!(again.state, NodeState::Ready);
        assert!(matches!(again.install, InstallDecision::AlreadyPresent { .. }));
        assert_eq!(again.join.unwrap().token, join.token);
        for id in ["w1", "w2"] {
            let report = p
                .provision(registry.get(id).unwrap(), &session(&registry, id), Some(&join))
                .await
                .unwrap();
            assert_eq!(report.state, NodeState::Ready);
        }

        for (id, host) in ["m1", "w1", "w2"].iter().zip(&before) {
            let after = fleet.host(id);
            assert_eq!(after.observable(), host.observable(), "{} changed", id);
            assert_eq!(after.restarts, host.restarts, "{} restarted", id);
            assert_eq!(after.install_count, 1);
        }
    }

    #[tokio::test]
    async fn test_gpu_step_only_runs_with_gpu_profile() {
        let mut nodes = test_registry(0, 2).all().to_vec();
        nodes[2] = nodes[2].clone().with_gpu(GpuProfile {
            vendor: GpuVendor::Nvidia,
            model: Some("A100".to_string()),
            count: 2,
        });
        let registry = NodeRegistry::from_parts(nodes, Default::default(), 6443);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let p = provisioner(fleet.clone(), settings());

        let join = p
            .provision(registry.primary().unwrap(), &session(&registry, "m1"), None)
            .await
            .unwrap()
            .join
            .unwrap();
        for id in ["w1", "w2"] {
            p.provision(registry.get(id).unwrap(), &session(&registry, id), Some(&join))
                .await
                .unwrap();
        }

        let gpu_calls = |id: &str| {
            fleet
                .calls_for(id)
                .iter()
                .filter(|c| c.command == "configure-gpu-runtime")
                .count()
        };
        assert_eq!(gpu_calls("w1"), 0);
        assert_eq!(gpu_calls("w2"), 1);
        assert!(fleet.host("w2").gpu_runtime);
    }

    #[tokio::test]
    async fn test_health_budget_names_last_state() {
        let registry = test_registry(0, 0);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        fleet.inject("m1", "cluster-nodes", 100, FaultKind::Exit(1));
        let p = provisioner(fleet.clone(), settings());

        let err = p
            .provision(registry.primary().unwrap(), &session(&registry, "m1"), None)
            .await
            .unwrap_err();

        match err {
            KeelError::ProvisioningFailed { node, last_state } => {
                assert_eq!(node, "m1");
                assert!(last_state.contains("injected failure"));
            }
            other => panic!("unexpected error: {}", other),
        }
        let probes = fleet
            .calls_for("m1")
            .iter()
            .filter(|c| c.command == "cluster-nodes")
            .count();
        assert_eq!(probes, 3);

        fleet.clear_faults();
        let report = p
            .provision(registry.primary().unwrap(), &session(&registry, "m1"), None)
            .await
            .unwrap();
        assert_eq!(report.state, NodeState::Ready);
        assert_eq!(fleet.host("m1").install_count, 1);
    }

    #[tokio::test]
    async fn test_secondary_master_ready_when_service_active() {
        let registry = test_registry(1, 0);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let p = provisioner(fleet.clone(), settings());

        let join = p
            .provision(registry.primary().unwrap(), &session(&registry, "m1"), None)
            .await
            .unwrap()
            .join
            .unwrap();
        // the node list is never consulted for a secondary
        fleet.inject("m2", "cluster-nodes", 100, FaultKind::Exit(1));

        let report = p
            .provision(registry.get("m2").unwrap(), &session(&registry, "m2"), Some(&join))
            .await
            .unwrap();
        assert_eq!(report.state, NodeState::Ready);

        let calls = fleet.calls_for("m2");
        assert!(calls.iter().all(|c| c.ok));
        assert!(!calls.iter().any(|c| c.command == "cluster-nodes"));
        assert_eq!(calls.last().unwrap().command, "service-status");

        let steps = p.plan(registry.get("m2").unwrap(), Some(&join), &["m1".to_string()]);
        assert!(matches!(steps[3].commands[0], RemoteCommand::ServiceStatus { .. }));
    }

    #[tokio::test]
    async fn test_worker_without_join_info_is_rejected() {
        let registry = test_registry(0, 1);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let p = provisioner(fleet.clone(), settings());

        let err = p
            .provision(registry.get("w1").unwrap(), &session(&registry, "w1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::InvalidConfig(_)));
        assert_eq!(fleet.host("w1").install_count, 0);
    }

    #[tokio::test]
    async fn test_version_drift_reported_or_upgraded() {
        let registry = test_registry(0, 0);
        let token = token::generate();
        let fleet = Arc::new(SimulatedFleet::provisioned(&registry, token.expose()));

        let mut pinned = settings();
        pinned.runtime.version = Some("v1.31.1+k3s1".to_string());
        let report = provisioner(fleet.clone(), pinned.clone())
            .provision(registry.primary().unwrap(), &session(&registry, "m1"), None)
            .await
            .unwrap();
        assert!(matches!(report.install, InstallDecision::VersionDrift { .. }));
        assert_eq!(fleet.host("m1").install_count, 1);

        pinned.runtime.upgrade_on_drift = true;
        let report = provisioner(fleet.clone(), pinned)
            .provision(registry.primary().unwrap(), &session(&registry, "m1"), None)
            .await
            .unwrap();
        assert!(matches!(report.install, InstallDecision::Upgrade { .. }));
        assert_eq!(fleet.host("m1").install_count, 2);
        assert_eq!(fleet.host("m1").runtime_version.as_deref(), Some("v1.31.1+k3s1"));
        assert_eq!(report.join.unwrap().token.expose(), token.expose());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let registry = test_registry(0, 0);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let p = NodeProvisioner::new(fleet.clone(), settings(), InstalledVersions::new(), cancel);

        let err = p
            .provision(registry.primary().unwrap(), &session(&registry, "m1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Cancelled));
        assert!(fleet.calls().is_empty());
    }

    #[test]
    fn test_plan_links_chain_and_dependencies() {
        let registry = test_registry(1, 1);
        let fleet = Arc::new(SimulatedFleet::new(&registry));
        let p = provisioner(fleet, settings());

        let steps = p.plan(registry.get("w1").unwrap(), None, &["m1".to_string(), "m2".to_string()]);
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].name, "w1/system-prep");
        assert_eq!(steps[0].depends_on, vec!["m1/health-check", "m2/health-check"]);
        assert_eq!(steps[1].depends_on, vec!["w1/system-prep"]);
        assert!(matches!(steps[3].commands[0], RemoteCommand::ServiceStatus { .. }));
    }

    #[test]
    fn test_parse_node_list() {
        let entries = parse_node_list(
            "master-1   Ready      control-plane,etcd,master   5m   v1.30.4+k3s1\n\
             worker-1   NotReady   <none>                      2m   v1.30.4+k3s1\n",
        );
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_ready());
        assert!(!entries[1].is_ready());
    }
}
