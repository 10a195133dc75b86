//! Remote command execution
//!
//! [`RemoteExecutor`] is the only way the orchestrator touches a host. It
//! never retries: callers know which commands are safe to repeat.

use super::command::RemoteCommand;
use crate::error::{KeelError, Result};
use crate::registry::{Node, NodeCredentials};
use crate::secret::Secret;
use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Output of a successful remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    /// Trimmed stdout
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }
}

/// Private key a session authenticates with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Whatever the local ssh agent offers
    Agent,
    /// Key file on the orchestrating host
    File(PathBuf),
    /// Key material held in memory, e.g. a freshly generated key
    Inline(Secret),
}

/// Where and as whom a command runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub node_id: String,
    pub hostname: String,
    pub address: String,
    pub user: String,
    pub port: u16,
    pub identity: Identity,
    /// Tried once when `identity` is refused
    pub fallback: Option<Identity>,
}

impl Session {
    /// Session using the node's configured credentials
    pub fn for_node(node: &Node, credentials: &NodeCredentials) -> Self {
        let identity = match &credentials.identity_file {
            Some(path) => Identity::File(path.clone()),
            None => Identity::Agent,
        };

        Self {
            node_id: node.id.clone(),
            hostname: node.hostname.clone(),
            address: node.address.clone(),
            user: credentials.user.clone(),
            port: credentials.port,
            identity,
            fallback: None,
        }
    }

    /// Same target, only `identity`
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self.fallback = None;
        self
    }

    /// Try `identity` first and keep the configured key as the fallback,
    /// for hosts that do not trust `identity` yet
    pub fn preferring(mut self, identity: Identity) -> Self {
        let configured = std::mem::replace(&mut self.identity, identity);
        if self.fallback.is_none() {
            self.fallback = Some(configured);
        }
        if self.fallback.as_ref() == Some(&self.identity) {
            self.fallback = None;
        }
        self
    }

    /// The session to retry with once `identity` is refused
    pub fn fallback_session(&self) -> Option<Session> {
        self.fallback.clone().map(|identity| Session {
            identity,
            fallback: None,
            ..self.clone()
        })
    }
}

/// Runs commands on remote hosts
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` within `timeout`. A nonzero exit is an error.
    async fn execute(
        &self,
        session: &Session,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<ExecOutput>;
}

/// Executor backed by the system `ssh` client
#[derive(Debug, Clone)]
pub struct SshExecutor {
    /// ssh binary
    program: String,
    /// Connect timeout passed to ssh
    connect_timeout: Duration,
    /// Extra `-o` options
    options: Vec<String>,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl SshExecutor {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            program: "ssh".to_string(),
            connect_timeout,
            options: Vec::new(),
        }
    }

    /// Add an `-o` option
    pub fn option(mut self, option: &str) -> Self {
        self.options.push(option.to_string());
        self
    }

    /// Remote shell that reads the script from stdin
    fn remote_shell(session: &Session) -> &'static str {
        if session.user == "root" {
            "sh -s"
        } else {
            "sudo -n sh -s"
        }
    }

    /// Script fed to the remote shell. The group is parsed whole before it
    /// runs, so commands inside it cannot read the rest of the script.
    fn remote_script(command: &RemoteCommand) -> String {
        format!("{{\n{}\n}} </dev/null\n", command.render())
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        session: &Session,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        debug!("[{}] {}", session.node_id, command.describe());

        let mut cmd = Command::new(&self.program);
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-p")
            .arg(session.port.to_string());

        for option in &self.options {
            cmd.arg("-o").arg(option);
        }

        // Held until the command finishes; dropping it removes the key file.
        let mut _inline_key = None;
        match &session.identity {
            Identity::Agent => {}
            Identity::File(path) => {
                cmd.arg("-i").arg(path).arg("-o").arg("IdentitiesOnly=yes");
            }
            Identity::Inline(key) => {
                let mut file = tempfile::NamedTempFile::new()?;
                file.write_all(key.expose().as_bytes())?;
                if !key.expose().ends_with('\n') {
                    file.write_all(b"\n")?;
                }
                file.flush()?;
                cmd.arg("-i")
                    .arg(file.path())
                    .arg("-o")
                    .arg("IdentitiesOnly=yes")
                    .arg("-o")
                    .arg("IdentityAgent=none");
                _inline_key = Some(file);
            }
        }

        // Secrets travel in the script on stdin, never in argv.
        cmd.arg(format!("{}@{}", session.user, session.address))
            .arg(Self::remote_shell(session))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| KeelError::Connection {
            node: session.node_id.clone(),
            message: format!("failed to spawn {}: {}", self.program, e),
        })?;
        let stdin = child.stdin.take();
        let script = Self::remote_script(command);
        let node_id = session.node_id.clone();

        let run = async move {
            if let Some(mut stdin) = stdin {
                // ssh may exit before reading, e.g. on a refused key
                if let Err(e) = stdin.write_all(script.as_bytes()).await {
                    debug!("[{}] script not fully sent: {}", node_id, e);
                }
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(KeelError::Connection {
                    node: session.node_id.clone(),
                    message: format!("{} failed: {}", self.program, e),
                })
            }
            Err(_) => {
                return Err(KeelError::Timeout {
                    node: session.node_id.clone(),
                    command: command.describe(),
                    after: timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        match exit_code {
            0 => Ok(ExecOutput {
                stdout,
                stderr,
                exit_code,
            }),
            255 if stderr.contains("Permission denied") => Err(KeelError::AuthenticationFailed {
                node: session.node_id.clone(),
                message: stderr.trim().to_string(),
            }),
            // ssh reserves 255 for its own failures
            255 => Err(KeelError::Connection {
                node: session.node_id.clone(),
                message: stderr.trim().to_string(),
            }),
            code => Err(KeelError::Command {
                node: session.node_id.clone(),
                command: command.describe(),
                exit_code: code,
                stderr: stderr.trim().to_string(),
            }),
        }
    }
}
