//! Cluster file configuration types

use crate::migration::MigrationPhase;
use crate::registry::Node;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level cluster file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name
    #[serde(default)]
    pub name: Option<String>,
    /// Default SSH access for every node
    #[serde(default)]
    pub ssh: SshConfig,
    /// Cluster runtime installation
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Health check polling
    #[serde(default)]
    pub health: HealthConfig,
    /// Per-step wall-clock budgets
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Scheduler limits and retry policy
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Credential rotation defaults
    #[serde(default)]
    pub rotation: RotationConfig,
    /// External config store
    #[serde(default)]
    pub store: StoreConfig,
    /// Optional best-effort secret mirror
    #[serde(default)]
    pub mirror: Option<MirrorConfig>,
    /// Rollout state
    #[serde(default)]
    pub migration: MigrationConfig,
    /// Nodes
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl ClusterConfig {
    /// Cluster name, falling back to "default"
    pub fn cluster_name(&self) -> &str {
        self.name.as_deref().unwrap_or("default")
    }
}

/// SSH access defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote user
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Remote port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Private key used for every session unless a node overrides it
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Extra `-o` options passed to ssh
    #[serde(default)]
    pub options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            identity_file: None,
            connect_timeout_secs: default_connect_timeout(),
            options: Vec::new(),
        }
    }
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

/// Runtime installation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Pinned runtime version (e.g. "v1.30.4+k3s1"); unpinned installs follow the channel
    #[serde(default)]
    pub version: Option<String>,
    /// Release channel used when no version is pinned
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Install script URL
    #[serde(default = "default_install_url")]
    pub install_url: String,
    /// Extra flags for server (master) installs
    #[serde(default)]
    pub extra_server_args: Vec<String>,
    /// Extra flags for agent (worker) installs
    #[serde(default)]
    pub extra_agent_args: Vec<String>,
    /// Reinstall when an active runtime reports a different version than pinned
    #[serde(default)]
    pub upgrade_on_drift: bool,
    /// Control-plane API port
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            version: None,
            channel: default_channel(),
            install_url: default_install_url(),
            extra_server_args: Vec::new(),
            extra_agent_args: Vec::new(),
            upgrade_on_drift: false,
            api_port: default_api_port(),
        }
    }
}

fn default_channel() -> String {
    "stable".to_string()
}

fn default_install_url() -> String {
    "https://get.k3s.io".to_string()
}

fn default_api_port() -> u16 {
    6443
}

/// Health check polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Number of probes before giving up
    #[serde(default = "default_health_attempts")]
    pub attempts: u32,
    /// Seconds between probes
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            attempts: default_health_attempts(),
            interval_secs: default_health_interval(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_health_attempts() -> u32 {
    30
}

fn default_health_interval() -> u64 {
    10
}

/// Wall-clock budgets for remote calls, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_system_prep_timeout")]
    pub system_prep_secs: u64,
    #[serde(default = "default_runtime_install_timeout")]
    pub runtime_install_secs: u64,
    #[serde(default = "default_node_config_timeout")]
    pub node_config_secs: u64,
    /// Budget for a single probe (health, status, file read)
    #[serde(default = "default_probe_timeout")]
    pub probe_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            system_prep_secs: default_system_prep_timeout(),
            runtime_install_secs: default_runtime_install_timeout(),
            node_config_secs: default_node_config_timeout(),
            probe_secs: default_probe_timeout(),
        }
    }
}

fn default_system_prep_timeout() -> u64 {
    600
}

fn default_runtime_install_timeout() -> u64 {
    900
}

fn default_node_config_timeout() -> u64 {
    600
}

fn default_probe_timeout() -> u64 {
    30
}

/// Scheduler limits and node-level retry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Upper bound on nodes provisioned at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel_nodes: usize,
    /// Attempts at a node's full step chain before it is reported failed
    #[serde(default = "default_node_attempts")]
    pub node_attempts: u32,
    /// First backoff interval between node attempts, in milliseconds
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,
    /// Backoff ceiling, in milliseconds
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: default_max_parallel(),
            node_attempts: default_node_attempts(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

fn default_max_parallel() -> usize {
    16
}

fn default_node_attempts() -> u32 {
    2
}

fn default_backoff_initial() -> u64 {
    5_000
}

fn default_backoff_max() -> u64 {
    60_000
}

/// Credential rotation defaults. Values recorded in the config store win.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_ssh_interval")]
    pub ssh_interval_days: u32,
    #[serde(default = "default_token_interval")]
    pub token_interval_days: u32,
    #[serde(default = "default_true")]
    pub auto_rotation: bool,
    /// Number of authorized-keys entries kept after revocation
    #[serde(default = "default_keys_window")]
    pub authorized_keys_window: usize,
    /// authorized_keys path on every node
    #[serde(default = "default_authorized_keys_path")]
    pub authorized_keys_path: String,
    /// Where the local rotation journal lives; defaults to the data dir
    #[serde(default)]
    pub journal_dir: Option<PathBuf>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            ssh_interval_days: default_ssh_interval(),
            token_interval_days: default_token_interval(),
            auto_rotation: true,
            authorized_keys_window: default_keys_window(),
            authorized_keys_path: default_authorized_keys_path(),
            journal_dir: None,
        }
    }
}

fn default_ssh_interval() -> u32 {
    90
}

fn default_token_interval() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

fn default_keys_window() -> usize {
    3
}

fn default_authorized_keys_path() -> String {
    "/root/.ssh/authorized_keys".to_string()
}

/// External config store location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// YAML store file; defaults to `<data dir>/keel/store.yaml`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Best-effort mirror of rotation metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Endpoint receiving a JSON POST per rotation
    pub url: String,
    /// Item name the receiver files the metadata under
    #[serde(default = "default_mirror_item")]
    pub item: String,
    /// Request timeout in seconds
    #[serde(default = "default_mirror_timeout")]
    pub timeout_secs: u64,
}

fn default_mirror_item() -> String {
    "keel-cluster-credentials".to_string()
}

fn default_mirror_timeout() -> u64 {
    10
}

/// Rollout state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Current phase, chosen by an operator
    #[serde(default)]
    pub phase: MigrationPhase,
}
