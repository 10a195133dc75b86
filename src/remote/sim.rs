//! In-memory fleet for tests
//!
//! Interprets [`RemoteCommand`] variants against simulated hosts: files,
//! authorized keys, runtime services, cluster membership. Every call is
//! stamped with a monotonic sequence number so tests can check ordering.

use super::command::{RemoteCommand, SERVER_TOKEN_PATH};
use super::executor::{ExecOutput, Identity, RemoteExecutor, Session};
use crate::error::{KeelError, Result};
use crate::registry::NodeRegistry;
use crate::rotation::ssh::{GeneratedKey, KeyGenerator};
use crate::rotation::token;
use crate::secret::Secret;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) const OPERATOR_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOPERATORKEY operator@laptop";
pub(crate) const AUTHORIZED_KEYS: &str = "/root/.ssh/authorized_keys";
pub(crate) const SIM_VERSION: &str = "v1.30.4+k3s1";

/// How an injected fault fails a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultKind {
    Connection,
    Timeout,
    Exit(i32),
}

#[derive(Debug, Clone)]
struct Fault {
    node: String,
    command: &'static str,
    remaining: u32,
    kind: FaultKind,
}

/// One executed call
#[derive(Debug, Clone)]
pub(crate) struct CallRecord {
    pub node: String,
    pub command: &'static str,
    pub start: u64,
    pub end: u64,
    pub ok: bool,
}

/// One simulated host
#[derive(Debug, Clone, Default)]
pub(crate) struct SimHost {
    pub hostname: String,
    pub os_release: String,
    pub reachable: bool,
    pub files: HashMap<String, String>,
    pub services: HashMap<String, bool>,
    pub runtime_version: Option<String>,
    pub firewall: BTreeSet<String>,
    pub directories: BTreeSet<String>,
    pub gpu_runtime: bool,
    /// Token the running runtime was started with
    pub running_token: Option<String>,
    pub install_count: u32,
    pub restarts: u32,
}

impl SimHost {
    fn lines(&self, path: &str) -> Vec<String> {
        self.files
            .get(path)
            .map(|c| c.lines().map(|l| l.to_string()).collect())
            .unwrap_or_default()
    }

    fn set_lines(&mut self, path: &str, lines: &[String]) {
        let mut contents = lines.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        self.files.insert(path.to_string(), contents);
    }

    fn env(&self, path: &str, key: &str) -> Option<String> {
        let prefix = format!("{}=", key);
        self.lines(path)
            .iter()
            .rev()
            .find_map(|l| l.strip_prefix(&prefix).map(|v| v.to_string()))
    }

    fn set_env(&mut self, path: &str, key: &str, value: &str) {
        let prefix = format!("{}=", key);
        let mut lines = self.lines(path);
        let assignment = format!("{}{}", prefix, value);
        match lines.iter_mut().find(|l| l.starts_with(&prefix)) {
            Some(line) => *line = assignment,
            None => lines.push(assignment),
        }
        self.set_lines(path, &lines);
    }

    fn start(&mut self, service: &str) {
        let env_file = format!("/etc/systemd/system/{}.service.env", service);
        let token = self.env(&env_file, "K3S_TOKEN");
        if service == "k3s" {
            if let Some(token) = &token {
                self.files
                    .insert(SERVER_TOKEN_PATH.to_string(), format!("{}\n", token));
            }
        }
        self.running_token = token;
        self.services.insert(service.to_string(), true);
    }

    /// Everything a provisioning run may change, without counters
    pub fn observable(&self) -> String {
        let mut files: Vec<_> = self.files.iter().collect();
        files.sort();
        let mut services: Vec<_> = self.services.iter().collect();
        services.sort();
        format!(
            "{:?}|{:?}|{:?}|{:?}|{:?}|{}|{:?}",
            files,
            services,
            self.runtime_version,
            self.firewall,
            self.directories,
            self.gpu_runtime,
            self.running_token
        )
    }
}

/// Simulated fleet implementing [`RemoteExecutor`]
pub(crate) struct SimulatedFleet {
    hosts: Mutex<HashMap<String, SimHost>>,
    primary: String,
    order: Vec<String>,
    faults: Mutex<Vec<Fault>>,
    latency: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<CallRecord>>,
    clock: AtomicU64,
}

impl SimulatedFleet {
    /// Fresh hosts that only trust the operator key
    pub fn new(registry: &NodeRegistry) -> Self {
        let mut hosts = HashMap::new();
        let mut primary = String::new();
        let mut order = Vec::new();

        for node in registry.all() {
            if node.is_primary() {
                primary = node.id.clone();
            }
            order.push(node.id.clone());
            let mut host = SimHost {
                hostname: node.hostname.clone(),
                os_release: "ID=ubuntu\nID_LIKE=debian\n".to_string(),
                reachable: true,
                ..Default::default()
            };
            host.set_lines(AUTHORIZED_KEYS, &[OPERATOR_KEY.to_string()]);
            hosts.insert(node.id.clone(), host);
        }

        Self {
            hosts: Mutex::new(hosts),
            primary,
            order,
            faults: Mutex::new(Vec::new()),
            latency: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            clock: AtomicU64::new(0),
        }
    }

    /// Hosts with the runtime installed and joined with `token`
    pub fn provisioned(registry: &NodeRegistry, token: &str) -> Self {
        let fleet = Self::new(registry);
        {
            let mut hosts = fleet.hosts.lock().unwrap();
            for node in registry.all() {
                let host = hosts.get_mut(&node.id).unwrap();
                let service = node.runtime_service();
                let env_file = node.service_env_file();
                host.set_env(&env_file, "K3S_TOKEN", token);
                host.runtime_version = Some(SIM_VERSION.to_string());
                host.install_count = 1;
                host.start(service);
            }
        }
        fleet
    }

    pub fn set_latency(&self, node: &str, latency: Duration) {
        self.latency.lock().unwrap().insert(node.to_string(), latency);
    }

    pub fn set_reachable(&self, node: &str, reachable: bool) {
        self.hosts.lock().unwrap().get_mut(node).unwrap().reachable = reachable;
    }

    /// Fail the next `times` calls of `command` on `node`
    pub fn inject(&self, node: &str, command: &'static str, times: u32, kind: FaultKind) {
        self.faults.lock().unwrap().push(Fault {
            node: node.to_string(),
            command,
            remaining: times,
            kind,
        });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn host(&self, node: &str) -> SimHost {
        self.hosts.lock().unwrap().get(node).cloned().unwrap()
    }

    pub fn update_host(&self, node: &str, f: impl FnOnce(&mut SimHost)) {
        f(self.hosts.lock().unwrap().get_mut(node).unwrap());
    }

    pub fn authorized_keys(&self, node: &str) -> Vec<String> {
        self.host(node).lines(AUTHORIZED_KEYS)
    }

    pub fn env_token(&self, node: &str) -> Option<String> {
        let host = self.host(node);
        let service = if host.services.contains_key("k3s") { "k3s" } else { "k3s-agent" };
        host.env(&format!("/etc/systemd/system/{}.service.env", service), "K3S_TOKEN")
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, node: &str) -> Vec<CallRecord> {
        self.calls().into_iter().filter(|c| c.node == node).collect()
    }

    fn take_fault(&self, node: &str, command: &'static str) -> Option<FaultKind> {
        let mut faults = self.faults.lock().unwrap();
        let fault = faults
            .iter_mut()
            .find(|f| f.node == node && f.command == command && f.remaining > 0)?;
        fault.remaining -= 1;
        Some(fault.kind)
    }

    fn authenticate(host: &SimHost, identity: &Identity) -> bool {
        let public = match identity {
            Identity::Agent | Identity::File(_) => OPERATOR_KEY.to_string(),
            Identity::Inline(private) => match private.expose().strip_prefix("FAKE-PRIVATE ") {
                Some(public) => public.trim().to_string(),
                None => return false,
            },
        };
        let wanted: Vec<&str> = public.split_whitespace().take(2).collect();
        host.lines(AUTHORIZED_KEYS)
            .iter()
            .any(|line| line.split_whitespace().take(2).collect::<Vec<_>>() == wanted)
    }

    fn run(&self, session: &Session, command: &RemoteCommand) -> Result<String> {
        let node = session.node_id.as_str();
        let mut hosts = self.hosts.lock().unwrap();

        let exit = |code: i32, stderr: &str| KeelError::Command {
            node: node.to_string(),
            command: command.describe(),
            exit_code: code,
            stderr: stderr.to_string(),
        };

        {
            let host = hosts
                .get(node)
                .ok_or_else(|| KeelError::NodeNotFound(node.to_string()))?;
            if !host.reachable {
                return Err(KeelError::Connection {
                    node: node.to_string(),
                    message: "No route to host".to_string(),
                });
            }
            if !Self::authenticate(host, &session.identity) {
                return Err(KeelError::AuthenticationFailed {
                    node: node.to_string(),
                    message: "Permission denied (publickey)".to_string(),
                });
            }
        }

        if let RemoteCommand::ClusterNodes = command {
            let host = &hosts[node];
            if host.services.get("k3s") != Some(&true) {
                return Err(exit(1, "The connection to the server was refused"));
            }
            let cluster_token = hosts[&self.primary].running_token.clone();
            let mut out = String::new();
            for id in &self.order {
                let h = &hosts[id];
                let Some(version) = &h.runtime_version else { continue };
                let active = h.services.values().any(|a| *a);
                let is_server = h.services.contains_key("k3s");
                let ready = active && (id == &self.primary || h.running_token == cluster_token);
                out.push_str(&format!(
                    "{}   {}   {}   5m   {}\n",
                    h.hostname,
                    if ready { "Ready" } else { "NotReady" },
                    if is_server { "control-plane,etcd,master" } else { "<none>" },
                    version
                ));
            }
            return Ok(out);
        }

        let host = hosts
            .get_mut(node)
            .ok_or_else(|| KeelError::NodeNotFound(node.to_string()))?;

        let stdout = match command {
            RemoteCommand::DetectOs => host.os_release.clone(),
            RemoteCommand::UpdatePackages { .. } => String::new(),
            RemoteCommand::OpenFirewallPorts { rules, .. } => {
                for rule in rules {
                    host.firewall
                        .insert(format!("{}-{}/{}", rule.start, rule.end, rule.protocol));
                }
                String::new()
            }
            RemoteCommand::ApplySysctl { params } => {
                let lines: Vec<String> = params.iter().map(|(k, v)| format!("{} = {}", k, v)).collect();
                host.set_lines(super::command::SYSCTL_PATH, &lines);
                String::new()
            }
            RemoteCommand::CreateDirectories { paths } => {
                host.directories.extend(paths.iter().cloned());
                String::new()
            }
            RemoteCommand::ServiceStatus { service } => match host.services.get(service) {
                Some(true) => "active\n".to_string(),
                _ => "inactive\n".to_string(),
            },
            RemoteCommand::RuntimeVersion => host
                .runtime_version
                .as_ref()
                .map(|v| format!("k3s version {} (b0c3f2d1)\n", v))
                .unwrap_or_default(),
            RemoteCommand::InstallRuntime(spec) => {
                host.install_count += 1;
                host.runtime_version = Some(spec.version.clone().unwrap_or_else(|| SIM_VERSION.to_string()));
                let service = if spec.exec.first().map(String::as_str) == Some("server") {
                    "k3s"
                } else {
                    "k3s-agent"
                };
                let env_file = format!("/etc/systemd/system/{}.service.env", service);
                let token = spec
                    .token
                    .as_ref()
                    .map(|t| t.expose().to_string())
                    .or_else(|| host.env(&env_file, "K3S_TOKEN"))
                    .unwrap_or_else(|| token::generate().expose().to_string());
                host.set_env(&env_file, "K3S_TOKEN", &token);
                if let Some(url) = &spec.server_url {
                    host.set_env(&env_file, "K3S_URL", url);
                }
                host.start(service);
                String::new()
            }
            RemoteCommand::ReadJoinToken => host
                .files
                .get(SERVER_TOKEN_PATH)
                .cloned()
                .ok_or_else(|| exit(1, "No such file or directory"))?,
            RemoteCommand::ConfigureGpuRuntime { service, .. } => {
                if !host.gpu_runtime {
                    host.gpu_runtime = true;
                    host.restarts += 1;
                    host.start(service);
                }
                String::new()
            }
            RemoteCommand::ConfigureLogRotation => {
                host.files.insert(
                    super::command::LOGROTATE_PATH.to_string(),
                    "/var/log/k3s*.log { weekly }\n".to_string(),
                );
                String::new()
            }
            RemoteCommand::ClusterNodes => String::new(),
            RemoteCommand::ApiReady => {
                if host.services.get("k3s") == Some(&true) {
                    "ok".to_string()
                } else {
                    return Err(exit(1, "The connection to the server was refused"));
                }
            }
            RemoteCommand::ReadFile { path } => host.files.get(path).cloned().unwrap_or_default(),
            RemoteCommand::BackupFile { path } => {
                if let Some(contents) = host.files.get(path).cloned() {
                    host.files.insert(format!("{}.keel.bak", path), contents);
                }
                String::new()
            }
            RemoteCommand::AppendLine { path, line } => {
                let mut lines = host.lines(path);
                if !lines.contains(line) {
                    lines.push(line.clone());
                }
                host.set_lines(path, &lines);
                String::new()
            }
            RemoteCommand::RemoveLine { path, line } => {
                let lines: Vec<String> = host.lines(path).into_iter().filter(|l| l != line).collect();
                host.set_lines(path, &lines);
                String::new()
            }
            RemoteCommand::TrimToLast { path, keep } => {
                let lines: Vec<String> = host
                    .lines(path)
                    .into_iter()
                    .filter(|l| !l.trim().is_empty())
                    .collect();
                let start = lines.len().saturating_sub(*keep);
                host.set_lines(path, &lines[start..]);
                String::new()
            }
            RemoteCommand::WriteFile { path, contents, .. } => {
                host.files
                    .insert(path.clone(), format!("{}\n", contents.expose()));
                String::new()
            }
            RemoteCommand::SetEnv { path, key, value } => {
                host.set_env(path, key, value.expose());
                String::new()
            }
            RemoteCommand::ReadEnv { path, key } => host.env(path, key).unwrap_or_default(),
            RemoteCommand::RestartService { service } => {
                if !host.services.contains_key(service) {
                    return Err(exit(5, "Unit not found"));
                }
                host.restarts += 1;
                host.start(service);
                String::new()
            }
            RemoteCommand::Probe => "keel-ok\n".to_string(),
        };

        Ok(stdout)
    }
}

#[async_trait]
impl RemoteExecutor for SimulatedFleet {
    async fn execute(
        &self,
        session: &Session,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let start = self.clock.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency.lock().unwrap().get(&session.node_id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let result = match self.take_fault(&session.node_id, command.name()) {
            Some(FaultKind::Connection) => Err(KeelError::Connection {
                node: session.node_id.clone(),
                message: "Connection reset by peer".to_string(),
            }),
            Some(FaultKind::Timeout) => Err(KeelError::Timeout {
                node: session.node_id.clone(),
                command: command.describe(),
                after: timeout,
            }),
            Some(FaultKind::Exit(code)) => Err(KeelError::Command {
                node: session.node_id.clone(),
                command: command.describe(),
                exit_code: code,
                stderr: "injected failure".to_string(),
            }),
            None => self.run(session, command),
        };

        let end = self.clock.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(CallRecord {
            node: session.node_id.clone(),
            command: command.name(),
            start,
            end,
            ok: result.is_ok(),
        });

        result.map(|stdout| ExecOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

/// Deterministic key pairs the simulated hosts understand
#[derive(Default)]
pub(crate) struct SimKeyGenerator {
    counter: AtomicU64,
}

#[async_trait]
impl KeyGenerator for SimKeyGenerator {
    async fn generate(&self, comment: &str) -> Result<GeneratedKey> {
        use base64::Engine;

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let blob = base64::engine::general_purpose::STANDARD
            .encode(format!("sim-ed25519-key-{:04}", n).as_bytes());
        let public = format!("ssh-ed25519 {} {}", blob, comment);
        Ok(GeneratedKey {
            private_key: Secret::new(format!("FAKE-PRIVATE {}", public)),
            public_key: public,
        })
    }
}
