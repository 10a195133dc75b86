//! Keel - node provisioning and credential rotation for k3s
//!
//! This is the main CLI entry point for Keel.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use keel::cluster::{ClusterOrchestrator, ClusterReport};
use keel::config::{ClusterConfig, ConfigParser};
use keel::migration::{Component, MigrationOrchestrator, MigrationPhase};
use keel::registry::NodeRegistry;
use keel::remote::{RemoteExecutor, SshExecutor};
use keel::rotation::{
    build_rotator, managed_identity, CredentialClass, ReconcileOutcome, RotationOutcome, RotationStatus, Trigger,
};
use keel::store::{ConfigStore, FileStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Keel - k3s node provisioning and credential rotation
#[derive(Parser)]
#[command(name = "keel")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Provision k3s nodes and rotate cluster credentials", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Cluster file (defaults to keel.yaml in the working directory)
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nodes in the cluster file
    Nodes,
    /// Show the provisioning steps without running them
    Plan {
        /// Only this node
        #[arg(long)]
        node: Option<String>,
    },
    /// Provision the cluster
    Provision {
        /// Limit the run to these nodes (the primary is always included)
        #[arg(long)]
        node: Vec<String>,
    },
    /// Probe every node once
    Status {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Print cluster outputs as JSON
    Outputs {
        /// Write to a file instead of stdout
        #[arg(long)]
        write: Option<PathBuf>,
    },
    /// Rotate a credential (ssh or token)
    Rotate {
        /// Credential class
        class: CredentialClass,
        /// Operator request: rotate when due, or any time auto-rotation is off
        #[arg(long, conflicts_with = "force")]
        manual: bool,
        /// Rotate regardless of the policy
        #[arg(long)]
        force: bool,
    },
    /// Finish an interrupted rotation or restore drifted nodes
    Reconcile {
        /// Credential class
        class: CredentialClass,
    },
    /// Show rotation policy and state for every credential class
    #[command(name = "rotation-status")]
    RotationStatus {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Report rollout phase readiness
    Migration {
        /// Phase to evaluate (defaults to the recorded phase)
        #[arg(long)]
        phase: Option<MigrationPhase>,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the cluster file
    Validate,
}

/// Everything a command needs to reach the fleet
struct Cluster {
    config: ClusterConfig,
    registry: NodeRegistry,
    store: Arc<dyn ConfigStore>,
    executor: Arc<dyn RemoteExecutor>,
    cancel: CancellationToken,
}

impl Cluster {
    fn load(file: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = match file {
            Some(path) => path,
            None => {
                let cwd = std::env::current_dir().context("Failed to read working directory")?;
                match ConfigParser::find_cluster_file(&cwd) {
                    Some(path) => path,
                    None => bail!("No cluster file found in {}", cwd.display()),
                }
            }
        };

        let config = ConfigParser::parse_file(&path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        for warning in ConfigParser::validate(&config)? {
            tracing::warn!("{}", warning);
        }
        let registry = NodeRegistry::from_config(&config)?;

        let store_path = config.store.path.clone().unwrap_or_else(FileStore::default_path);
        tracing::debug!("Config store at {}", store_path.display());

        let mut executor = SshExecutor::new(Duration::from_secs(config.ssh.connect_timeout_secs));
        for option in &config.ssh.options {
            executor = executor.option(option);
        }

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping after the current step");
                on_signal.cancel();
            }
        });

        Ok(Self {
            config,
            registry,
            store: Arc::new(FileStore::new(store_path)),
            executor: Arc::new(executor),
            cancel,
        })
    }

    fn orchestrator(&self, registry: NodeRegistry) -> anyhow::Result<ClusterOrchestrator> {
        let join_token = self.store.get_secret(&CredentialClass::JoinToken.key("token"))?;
        let identity = managed_identity(self.store.as_ref())?;
        Ok(
            ClusterOrchestrator::new(&self.config, registry, self.executor.clone(), self.cancel.clone())?
                .with_join_token(join_token)
                .with_identity(identity),
        )
    }

    async fn probe(&self) -> anyhow::Result<ClusterReport> {
        Ok(self.orchestrator(self.registry.clone())?.probe().await?)
    }

    fn rotation_status(&self, class: CredentialClass) -> anyhow::Result<RotationStatus> {
        let rotator = build_rotator(
            class,
            &self.config,
            Arc::new(self.registry.clone()),
            self.executor.clone(),
            self.store.clone(),
            self.cancel.clone(),
        )?;
        Ok(rotator.status()?)
    }

    /// Operator-chosen phase: flag, then store, then cluster file
    fn migration_phase(&self, flag: Option<MigrationPhase>) -> anyhow::Result<MigrationPhase> {
        if let Some(phase) = flag {
            return Ok(phase);
        }
        match self.store.get_plain("migration.phase")? {
            Some(recorded) => Ok(recorded.parse()?),
            None => Ok(self.config.migration.phase),
        }
    }
}

fn print_report(report: &ClusterReport) {
    println!("Cluster {} ({})", report.cluster, report.master_endpoint);
    println!(
        "{:<12} {:<20} {:<8} {:<10} {:<8}",
        "NODE", "HOSTNAME", "ROLE", "INSTALL", "STATUS"
    );
    for n in &report.nodes {
        println!(
            "{:<12} {:<20} {:<8} {:<10} {}",
            n.node,
            n.hostname,
            n.role,
            n.install.as_ref().map(|i| i.to_string()).unwrap_or_else(|| "-".to_string()),
            n.status
        );
    }
    println!("Ready: {}", report.cluster_ready());
}

fn print_rotation_status(status: &RotationStatus) {
    println!("{}:", status.class);
    println!(
        "  fingerprint:   {}",
        status.fingerprint.as_deref().unwrap_or("(never rotated)")
    );
    if let Some(last) = status.last_rotation {
        println!("  last rotation: {}", last.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(next) = status.next_rotation {
        println!(
            "  next rotation: {} ({} days)",
            next.format("%Y-%m-%d %H:%M:%S UTC"),
            status.days_until_due
        );
    }
    println!(
        "  interval:      {} days, auto-rotation {}",
        status.interval_days,
        if status.auto_rotation { "on" } else { "off" }
    );
    if let Some(phase) = status.journal_phase {
        println!("  unfinished rotation ({}), run `keel reconcile {}`", phase, status.class);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cluster = Cluster::load(cli.file)?;

    match cli.command {
        Commands::Nodes => {
            println!(
                "{:<12} {:<20} {:<16} {:<8} {:<10} {:<4}",
                "ID", "HOSTNAME", "ADDRESS", "ROLE", "TIER", "GPU"
            );
            for n in cluster.registry.all() {
                println!(
                    "{:<12} {:<20} {:<16} {:<8} {:<10} {:<4}",
                    n.id,
                    n.hostname,
                    n.address,
                    n.role,
                    n.control_plane_tier,
                    n.gpu.as_ref().map(|g| g.count).unwrap_or(0)
                );
            }
        }

        Commands::Plan { node } => {
            let orchestrator = cluster.orchestrator(cluster.registry.clone())?;
            for step in orchestrator.plan()? {
                if node.as_ref().is_some_and(|id| id != &step.node) {
                    continue;
                }
                let after = if step.depends_on.is_empty() {
                    String::new()
                } else {
                    format!(" after {}", step.depends_on.join(", "))
                };
                println!("{} (timeout {}s){}", step.name, step.timeout.as_secs(), after);
                for command in &step.commands {
                    println!("    {}", command.describe());
                }
            }
        }

        Commands::Provision { node } => {
            let registry = cluster.registry.select(&node)?;
            let report = cluster.orchestrator(registry)?.provision().await?;
            print_report(&report);
            if !report.cluster_ready() {
                let failed: Vec<&str> = report.failed().map(|n| n.node.as_str()).collect();
                bail!("Cluster is not ready, failed nodes: {}", failed.join(", "));
            }
        }

        Commands::Status { json } => {
            let report = cluster.probe().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }

        Commands::Outputs { write } => {
            let outputs = cluster.probe().await?.outputs();
            let content = serde_json::to_string_pretty(&outputs)?;
            match write {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Outputs written to {}", path.display());
                }
                None => println!("{}", content),
            }
        }

        Commands::Rotate { class, manual, force } => {
            let trigger = if force {
                Trigger::Forced
            } else if manual {
                Trigger::Manual
            } else {
                Trigger::Scheduled
            };
            let rotator = build_rotator(
                class,
                &cluster.config,
                Arc::new(cluster.registry.clone()),
                cluster.executor.clone(),
                cluster.store.clone(),
                cluster.cancel.clone(),
            )?;

            match rotator.rotate(trigger).await? {
                RotationOutcome::Skipped {
                    next_rotation,
                    remaining_days,
                } => {
                    let next = next_rotation
                        .map(|n| n.format("%Y-%m-%d").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{} rotation not due ({} days left, next {})", class, remaining_days, next);
                }
                RotationOutcome::Rotated {
                    rotation_id,
                    fingerprint,
                    revoke_failures,
                    ..
                } => {
                    println!("{} rotated ({})", class, rotation_id);
                    println!("New fingerprint: {}", fingerprint);
                    if !revoke_failures.is_empty() {
                        println!(
                            "Old material still present on: {}",
                            revoke_failures.join(", ")
                        );
                    }
                }
            }
        }

        Commands::Reconcile { class } => {
            let rotator = build_rotator(
                class,
                &cluster.config,
                Arc::new(cluster.registry.clone()),
                cluster.executor.clone(),
                cluster.store.clone(),
                cluster.cancel.clone(),
            )?;

            match rotator.reconcile().await? {
                ReconcileOutcome::Consistent => println!("{}: every node holds the recorded material", class),
                ReconcileOutcome::RolledForward { outcome } => {
                    println!("{}: interrupted rotation completed", class);
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
                ReconcileOutcome::Restored { nodes } => {
                    println!("{}: restored recorded material on {}", class, nodes.join(", "));
                }
            }
        }

        Commands::RotationStatus { json } => {
            let statuses = [CredentialClass::SshKey, CredentialClass::JoinToken]
                .into_iter()
                .map(|class| cluster.rotation_status(class))
                .collect::<anyhow::Result<Vec<_>>>()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                for status in &statuses {
                    print_rotation_status(status);
                }
            }
        }

        Commands::Migration { phase, json } => {
            let orchestrator = MigrationOrchestrator::new(cluster.migration_phase(phase)?);

            let ready = match cluster.probe().await {
                Ok(report) => report.cluster_ready(),
                Err(e) => {
                    tracing::warn!("Cluster probe failed: {}", e);
                    false
                }
            };
            let mut health = HashMap::new();
            health.insert(Component::ClusterProvisioning, ready);
            health.insert(Component::HealthVerification, ready);
            health.insert(
                Component::SshKeyRotation,
                cluster.rotation_status(CredentialClass::SshKey)?.is_healthy(),
            );
            health.insert(
                Component::TokenRotation,
                cluster.rotation_status(CredentialClass::JoinToken)?.is_healthy(),
            );

            let status = orchestrator.status(&health);
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Phase: {}", status.phase);
                for (title, items) in [
                    ("Completed", &status.completed),
                    ("Active", &status.active),
                    ("Next steps", &status.next_steps),
                ] {
                    println!("{}:", title);
                    for item in items {
                        println!("  - {}", item);
                    }
                }
                println!("Components:");
                for c in &status.components {
                    let state = match (c.enabled, c.healthy) {
                        (false, _) => "disabled",
                        (true, Some(true)) => "healthy",
                        (true, _) => "unhealthy",
                    };
                    println!("  {:<22} {}", c.component.to_string(), state);
                }
                println!("Legacy procedure can be retired: {}", status.script_retirement_ready);
            }
        }

        Commands::Validate => {
            println!(
                "Cluster file is valid: {} ({} nodes)",
                cluster.config.cluster_name(),
                cluster.registry.len()
            );
        }
    }

    Ok(())
}
