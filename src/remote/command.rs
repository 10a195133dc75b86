//! Typed remote commands
//!
//! Every piece of remote work is a [`RemoteCommand`] variant with typed
//! parameters. `render` turns it into a shell script that is safe to run
//! again on a host where it already ran, except where `is_idempotent`
//! says otherwise.

use crate::secret::Secret;
use serde::{Deserialize, Serialize};

/// Server token file on masters
pub const SERVER_TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/token";

/// Runtime log rotation policy
pub const LOGROTATE_PATH: &str = "/etc/logrotate.d/k3s";

/// Kernel parameters managed by Keel
pub const SYSCTL_PATH: &str = "/etc/sysctl.d/90-keel.conf";

/// Comment tag appended to every authorized key Keel manages
pub const MANAGED_KEY_TAG: &str = "keel-managed";

/// Operating system family, from /etc/os-release
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Debian,
    RedHat,
    #[default]
    Unknown,
}

impl OsFamily {
    /// Classify `ID=`/`ID_LIKE=` lines
    pub fn from_os_release(output: &str) -> Self {
        let mut ids = Vec::new();
        for line in output.lines() {
            if let Some(value) = line
                .strip_prefix("ID=")
                .or_else(|| line.strip_prefix("ID_LIKE="))
            {
                ids.extend(
                    value
                        .trim_matches('"')
                        .split_whitespace()
                        .map(|s| s.to_lowercase()),
                );
            }
        }

        if ids.iter().any(|id| id == "debian" || id == "ubuntu") {
            OsFamily::Debian
        } else if ids
            .iter()
            .any(|id| matches!(id.as_str(), "rhel" | "fedora" | "centos" | "rocky" | "almalinux"))
        {
            OsFamily::RedHat
        } else {
            OsFamily::Unknown
        }
    }
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsFamily::Debian => write!(f, "debian"),
            OsFamily::RedHat => write!(f, "redhat"),
            OsFamily::Unknown => write!(f, "unknown"),
        }
    }
}

/// Transport protocol of a firewall rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// An inbound port or port range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub start: u16,
    pub end: u16,
    pub protocol: Protocol,
}

impl FirewallRule {
    pub fn port(port: u16, protocol: Protocol) -> Self {
        Self {
            start: port,
            end: port,
            protocol,
        }
    }

    pub fn range(start: u16, end: u16, protocol: Protocol) -> Self {
        Self {
            start,
            end,
            protocol,
        }
    }

    fn span(&self, sep: char) -> String {
        if self.start == self.end {
            self.start.to_string()
        } else {
            format!("{}{}{}", self.start, sep, self.end)
        }
    }
}

/// Parameters of a runtime install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSpec {
    /// Install script URL
    pub install_url: String,
    /// Pinned version, if any
    pub version: Option<String>,
    /// Channel used when no version is pinned
    pub channel: String,
    /// `server ...` or `agent ...` arguments
    pub exec: Vec<String>,
    /// Join URL for agents
    pub server_url: Option<String>,
    /// Join token
    pub token: Option<Secret>,
}

/// A unit of remote work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Print the os-release identifiers
    DetectOs,
    /// Refresh package metadata and install base tooling
    UpdatePackages { family: OsFamily },
    /// Open inbound ports
    OpenFirewallPorts {
        family: OsFamily,
        rules: Vec<FirewallRule>,
    },
    /// Write kernel parameters and apply them
    ApplySysctl { params: Vec<(String, String)> },
    /// Create directories
    CreateDirectories { paths: Vec<String> },
    /// Print `active`, `inactive`, ... for a unit
    ServiceStatus { service: String },
    /// Print the installed runtime version line
    RuntimeVersion,
    /// Run the runtime install script
    InstallRuntime(InstallSpec),
    /// Print the server token of a master
    ReadJoinToken,
    /// Wire the GPU container runtime and restart the runtime unit
    ConfigureGpuRuntime { family: OsFamily, service: String },
    /// Install the runtime log rotation policy
    ConfigureLogRotation,
    /// List cluster nodes through the local API
    ClusterNodes,
    /// Ask the local API server whether it is ready
    ApiReady,
    /// Print a file, empty if missing
    ReadFile { path: String },
    /// Copy a file next to itself
    BackupFile { path: String },
    /// Append a line unless already present
    AppendLine { path: String, line: String },
    /// Remove every occurrence of a line
    RemoveLine { path: String, line: String },
    /// Keep the last `keep` non-empty lines
    TrimToLast { path: String, keep: usize },
    /// Replace a file's contents
    WriteFile {
        path: String,
        contents: Secret,
        mode: u32,
    },
    /// Set `KEY=value` in an environment file
    SetEnv {
        path: String,
        key: String,
        value: Secret,
    },
    /// Print the value of `KEY` from an environment file
    ReadEnv { path: String, key: String },
    /// Restart a unit
    RestartService { service: String },
    /// No-op used to prove a session can be opened
    Probe,
}

impl RemoteCommand {
    /// Short kind name, stable for logs and test matchers
    pub fn name(&self) -> &'static str {
        match self {
            RemoteCommand::DetectOs => "detect-os",
            RemoteCommand::UpdatePackages { .. } => "update-packages",
            RemoteCommand::OpenFirewallPorts { .. } => "open-firewall-ports",
            RemoteCommand::ApplySysctl { .. } => "apply-sysctl",
            RemoteCommand::CreateDirectories { .. } => "create-directories",
            RemoteCommand::ServiceStatus { .. } => "service-status",
            RemoteCommand::RuntimeVersion => "runtime-version",
            RemoteCommand::InstallRuntime(_) => "install-runtime",
            RemoteCommand::ReadJoinToken => "read-join-token",
            RemoteCommand::ConfigureGpuRuntime { .. } => "configure-gpu-runtime",
            RemoteCommand::ConfigureLogRotation => "configure-log-rotation",
            RemoteCommand::ClusterNodes => "cluster-nodes",
            RemoteCommand::ApiReady => "api-ready",
            RemoteCommand::ReadFile { .. } => "read-file",
            RemoteCommand::BackupFile { .. } => "backup-file",
            RemoteCommand::AppendLine { .. } => "append-line",
            RemoteCommand::RemoveLine { .. } => "remove-line",
            RemoteCommand::TrimToLast { .. } => "trim-to-last",
            RemoteCommand::WriteFile { .. } => "write-file",
            RemoteCommand::SetEnv { .. } => "set-env",
            RemoteCommand::ReadEnv { .. } => "read-env",
            RemoteCommand::RestartService { .. } => "restart-service",
            RemoteCommand::Probe => "probe",
        }
    }

    /// Whether running the command twice leaves the host as running it once
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, RemoteCommand::InstallRuntime(_))
    }

    /// One-line description with secrets left out
    pub fn describe(&self) -> String {
        match self {
            RemoteCommand::UpdatePackages { family } => format!("update-packages ({})", family),
            RemoteCommand::OpenFirewallPorts { rules, .. } => {
                let ports: Vec<String> = rules
                    .iter()
                    .map(|r| format!("{}/{}", r.span('-'), r.protocol))
                    .collect();
                format!("open-firewall-ports {}", ports.join(","))
            }
            RemoteCommand::ServiceStatus { service } => format!("service-status {}", service),
            RemoteCommand::InstallRuntime(spec) => format!(
                "install-runtime {} ({})",
                spec.exec.join(" "),
                spec.version.as_deref().unwrap_or(&spec.channel)
            ),
            RemoteCommand::ConfigureGpuRuntime { service, .. } => {
                format!("configure-gpu-runtime {}", service)
            }
            RemoteCommand::ReadFile { path } => format!("read-file {}", path),
            RemoteCommand::BackupFile { path } => format!("backup-file {}", path),
            RemoteCommand::AppendLine { path, .. } => format!("append-line {}", path),
            RemoteCommand::RemoveLine { path, .. } => format!("remove-line {}", path),
            RemoteCommand::TrimToLast { path, keep } => format!("trim-to-last {} {}", path, keep),
            RemoteCommand::WriteFile { path, .. } => format!("write-file {}", path),
            RemoteCommand::SetEnv { path, key, .. } => format!("set-env {} {}", path, key),
            RemoteCommand::ReadEnv { path, key } => format!("read-env {} {}", path, key),
            RemoteCommand::RestartService { service } => format!("restart-service {}", service),
            other => other.name().to_string(),
        }
    }

    /// Render the shell script executed on the host
    pub fn render(&self) -> String {
        match self {
            RemoteCommand::DetectOs => {
                ". /etc/os-release && echo \"ID=$ID\" && echo \"ID_LIKE=${ID_LIKE:-}\"".to_string()
            }
            RemoteCommand::UpdatePackages { family } => match family {
                OsFamily::Debian => "export DEBIAN_FRONTEND=noninteractive; \
                     apt-get update -y && apt-get install -y curl ca-certificates iptables"
                    .to_string(),
                OsFamily::RedHat => {
                    "dnf -y makecache && dnf -y install curl ca-certificates iptables".to_string()
                }
                OsFamily::Unknown => "command -v curl >/dev/null".to_string(),
            },
            RemoteCommand::OpenFirewallPorts { family, rules } => {
                render_firewall(*family, rules)
            }
            RemoteCommand::ApplySysctl { params } => {
                let lines: Vec<String> = params
                    .iter()
                    .map(|(k, v)| shell_quote(&format!("{} = {}", k, v)))
                    .collect();
                format!(
                    "modprobe br_netfilter 2>/dev/null || true; \
                     echo br_netfilter > /etc/modules-load.d/keel.conf; \
                     printf '%s\\n' {} > {} && sysctl --system >/dev/null",
                    lines.join(" "),
                    SYSCTL_PATH
                )
            }
            RemoteCommand::CreateDirectories { paths } => {
                let quoted: Vec<String> = paths.iter().map(|p| shell_quote(p)).collect();
                format!("mkdir -p {}", quoted.join(" "))
            }
            RemoteCommand::ServiceStatus { service } => {
                format!("systemctl is-active {} 2>/dev/null || true", shell_quote(service))
            }
            RemoteCommand::RuntimeVersion => {
                "(k3s --version 2>/dev/null | head -n1) || true".to_string()
            }
            RemoteCommand::InstallRuntime(spec) => render_install(spec),
            RemoteCommand::ReadJoinToken => format!("cat {}", SERVER_TOKEN_PATH),
            RemoteCommand::ConfigureGpuRuntime { family, service } => {
                let install = match family {
                    OsFamily::RedHat => "dnf -y install nvidia-container-toolkit",
                    _ => "apt-get install -y nvidia-container-toolkit",
                };
                // restart only when the toolkit was just installed
                format!(
                    "command -v nvidia-container-runtime >/dev/null || {{ {} && systemctl restart {}; }}",
                    install,
                    shell_quote(service)
                )
            }
            RemoteCommand::ConfigureLogRotation => format!(
                "printf '%s\\n' '/var/log/k3s*.log {{' '  weekly' '  rotate 4' '  compress' \
                 '  missingok' '  notifempty' '  copytruncate' '}}' > {}",
                LOGROTATE_PATH
            ),
            RemoteCommand::ClusterNodes => "k3s kubectl get nodes --no-headers".to_string(),
            RemoteCommand::ApiReady => "k3s kubectl get --raw=/readyz".to_string(),
            RemoteCommand::ReadFile { path } => {
                format!("cat {} 2>/dev/null || true", shell_quote(path))
            }
            RemoteCommand::BackupFile { path } => {
                let p = shell_quote(path);
                format!(
                    "if [ -f {p} ]; then cp -p {p} {b}; fi",
                    p = p,
                    b = shell_quote(&format!("{}.keel.bak", path))
                )
            }
            RemoteCommand::AppendLine { path, line } => {
                let p = shell_quote(path);
                let l = shell_quote(line);
                format!(
                    "mkdir -p \"$(dirname {p})\" && touch {p} && chmod 600 {p} && \
                     (grep -qxF {l} {p} || printf '%s\\n' {l} >> {p})",
                    p = p,
                    l = l
                )
            }
            RemoteCommand::RemoveLine { path, line } => {
                let p = shell_quote(path);
                let tmp = shell_quote(&format!("{}.keel.tmp", path));
                format!(
                    "if [ -f {p} ]; then (grep -vxF {l} {p} || true) > {t} && cat {t} > {p} && rm -f {t}; fi",
                    p = p,
                    l = shell_quote(line),
                    t = tmp
                )
            }
            RemoteCommand::TrimToLast { path, keep } => {
                let p = shell_quote(path);
                let tmp = shell_quote(&format!("{}.keel.tmp", path));
                format!(
                    "if [ -f {p} ]; then (grep -v '^[[:space:]]*$' {p} || true) | tail -n {k} > {t} \
                     && cat {t} > {p} && rm -f {t}; fi",
                    p = p,
                    k = keep,
                    t = tmp
                )
            }
            RemoteCommand::WriteFile {
                path,
                contents,
                mode,
            } => {
                let p = shell_quote(path);
                format!(
                    "umask 077 && mkdir -p \"$(dirname {p})\" && printf '%s\\n' {c} > {p} && chmod {m:o} {p}",
                    p = p,
                    c = shell_quote(contents.expose()),
                    m = mode
                )
            }
            RemoteCommand::SetEnv { path, key, value } => {
                // builtins only, so the value never shows up in a process argv
                let p = shell_quote(path);
                format!(
                    "umask 077 && touch {p} && chmod 600 {p} && \
                     {{ grep -v {prefix} {p} || true; printf '%s\\n' {a}; }} > {t} && cat {t} > {p} && rm -f {t}",
                    p = p,
                    prefix = shell_quote(&format!("^{}=", key)),
                    a = shell_quote(&format!("{}={}", key, value.expose())),
                    t = shell_quote(&format!("{}.keel.tmp", path))
                )
            }
            RemoteCommand::ReadEnv { path, key } => format!(
                "(grep {} {} 2>/dev/null | tail -n1 | cut -d= -f2-) || true",
                shell_quote(&format!("^{}=", key)),
                shell_quote(path)
            ),
            RemoteCommand::RestartService { service } => {
                format!("systemctl restart {}", shell_quote(service))
            }
            RemoteCommand::Probe => "echo keel-ok".to_string(),
        }
    }
}

fn render_firewall(family: OsFamily, rules: &[FirewallRule]) -> String {
    match family {
        OsFamily::Debian => {
            let allows: Vec<String> = rules
                .iter()
                .map(|r| format!("ufw allow {}/{} >/dev/null", r.span(':'), r.protocol))
                .collect();
            format!(
                "if command -v ufw >/dev/null && ufw status | grep -q 'Status: active'; then {}; fi",
                allows.join("; ")
            )
        }
        OsFamily::RedHat => {
            let adds: Vec<String> = rules
                .iter()
                .map(|r| {
                    format!(
                        "firewall-cmd --permanent --add-port={}/{} >/dev/null",
                        r.span('-'),
                        r.protocol
                    )
                })
                .collect();
            format!(
                "if systemctl is-active --quiet firewalld; then {}; firewall-cmd --reload >/dev/null; fi",
                adds.join("; ")
            )
        }
        OsFamily::Unknown => {
            let rules: Vec<String> = rules
                .iter()
                .map(|r| {
                    let spec = format!("INPUT -p {} --dport {} -j ACCEPT", r.protocol, r.span(':'));
                    format!("iptables -C {s} 2>/dev/null || iptables -A {s}", s = spec)
                })
                .collect();
            rules.join("; ")
        }
    }
}

fn render_install(spec: &InstallSpec) -> String {
    let mut env = Vec::new();
    match &spec.version {
        Some(version) => env.push(format!("INSTALL_K3S_VERSION={}", shell_quote(version))),
        None => env.push(format!("INSTALL_K3S_CHANNEL={}", shell_quote(&spec.channel))),
    }
    if let Some(url) = &spec.server_url {
        env.push(format!("K3S_URL={}", shell_quote(url)));
    }
    if let Some(token) = &spec.token {
        env.push(format!("K3S_TOKEN={}", shell_quote(token.expose())));
    }
    env.push(format!("INSTALL_K3S_EXEC={}", shell_quote(&spec.exec.join(" "))));

    format!(
        "curl -sfL {} | {} sh -s -",
        shell_quote(&spec.install_url),
        env.join(" ")
    )
}

/// Quote a string for POSIX sh
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
