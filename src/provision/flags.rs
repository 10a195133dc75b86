//! Role-specific host requirements and install flags

use crate::config::RuntimeConfig;
use crate::registry::Node;
use crate::remote::{FirewallRule, InstallSpec, Protocol};
use crate::secret::Secret;

/// Directories the runtime expects to exist
pub const RUNTIME_DIRS: [&str; 3] = ["/etc/rancher/k3s", "/var/lib/rancher/k3s", "/var/log/k3s"];

/// What a dependent node needs from the primary master to join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinInfo {
    /// `https://<primary>:<port>`
    pub server_url: String,
    pub token: Secret,
}

/// Inbound ports a node needs
pub fn required_ports(node: &Node) -> Vec<FirewallRule> {
    let mut rules = Vec::new();
    if node.is_master() {
        rules.push(FirewallRule::port(6443, Protocol::Tcp));
        rules.push(FirewallRule::range(2379, 2380, Protocol::Tcp));
    }
    rules.push(FirewallRule::port(10250, Protocol::Tcp));
    rules.push(FirewallRule::port(8472, Protocol::Udp));
    rules.push(FirewallRule::range(30000, 32767, Protocol::Tcp));
    rules
}

/// Kernel parameters for pod networking
pub fn sysctl_params() -> Vec<(String, String)> {
    [
        ("net.ipv4.ip_forward", "1"),
        ("net.bridge.bridge-nf-call-iptables", "1"),
        ("net.bridge.bridge-nf-call-ip6tables", "1"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn runtime_dirs() -> Vec<String> {
    RUNTIME_DIRS.iter().map(|d| d.to_string()).collect()
}

/// `INSTALL_K3S_EXEC` arguments for a node
///
/// The primary initializes the cluster; every other node points at the
/// primary's API endpoint. Labels are passed sorted so the flag list is
/// stable across runs.
pub fn install_exec(node: &Node, runtime: &RuntimeConfig, join: Option<&JoinInfo>) -> Vec<String> {
    let mut args = Vec::new();

    if node.is_master() {
        args.push("server".to_string());
        if node.is_primary() {
            args.push("--cluster-init".to_string());
        } else if let Some(join) = join {
            args.push("--server".to_string());
            args.push(join.server_url.clone());
        }
        args.push("--tls-san".to_string());
        args.push(node.address.clone());
        args.push("--write-kubeconfig-mode".to_string());
        args.push("0644".to_string());
    } else {
        args.push("agent".to_string());
        if let Some(join) = join {
            args.push("--server".to_string());
            args.push(join.server_url.clone());
        }
    }

    args.push("--node-name".to_string());
    args.push(node.hostname.clone());

    for (key, value) in &node.labels {
        args.push("--node-label".to_string());
        args.push(format!("{}={}", key, value));
    }

    if node.has_gpu() {
        args.push("--node-label".to_string());
        args.push("nvidia.com/gpu.present=true".to_string());
    }

    let extra = if node.is_master() {
        &runtime.extra_server_args
    } else {
        &runtime.extra_agent_args
    };
    args.extend(extra.iter().cloned());

    args
}

/// Full install parameters for a node
pub fn install_spec(node: &Node, runtime: &RuntimeConfig, join: Option<&JoinInfo>) -> InstallSpec {
    InstallSpec {
        install_url: runtime.install_url.clone(),
        version: runtime.version.clone(),
        channel: runtime.channel.clone(),
        exec: install_exec(node, runtime, join),
        server_url: if node.is_primary() {
            None
        } else {
            join.map(|j| j.server_url.clone())
        },
        token: join.map(|j| j.token.clone()),
    }
}
