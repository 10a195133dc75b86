//! Error types for Keel

use std::time::Duration;
use thiserror::Error;

/// Result type for Keel operations
pub type Result<T> = std::result::Result<T, KeelError>;

/// Keel error types
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Connection to {node} failed: {message}")]
    Connection { node: String, message: String },

    #[error("{node} refused the key: {message}")]
    AuthenticationFailed { node: String, message: String },

    #[error("Command '{command}' on {node} timed out after {after:?}")]
    Timeout {
        node: String,
        command: String,
        after: Duration,
    },

    #[error("Command '{command}' on {node} exited with status {exit_code}: {stderr}")]
    Command {
        node: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Provisioning of {node} failed, last observed state: {last_state}")]
    ProvisioningFailed { node: String, last_state: String },

    #[error("{class} rotation aborted during {phase}: {reason}; previous credential is still valid")]
    RotationAborted {
        class: String,
        phase: String,
        reason: String,
    },

    #[error("{class} rotation is incomplete: updated {updated:?}, pending {pending:?}")]
    PartialRotationState {
        class: String,
        updated: Vec<String>,
        pending: Vec<String>,
    },

    #[error("{class} rotation succeeded but was not recorded: {reason}")]
    BookkeepingIncomplete { class: String, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cluster file parse error: {0}")]
    ConfigParse(String),

    #[error("Invalid join token: {0}")]
    InvalidToken(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Config store error: {0}")]
    Store(String),

    #[error("Secret mirror error: {0}")]
    Mirror(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeelError {
    /// Whether the failure came from the transport rather than the command
    /// itself. Only idempotent work may be retried on these.
    pub fn is_transient(&self) -> bool {
        matches!(self, KeelError::Connection { .. } | KeelError::Timeout { .. })
    }

    /// The node a failure is attributed to, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            KeelError::Connection { node, .. }
            | KeelError::AuthenticationFailed { node, .. }
            | KeelError::Timeout { node, .. }
            | KeelError::Command { node, .. }
            | KeelError::ProvisioningFailed { node, .. } => Some(node),
            KeelError::NodeNotFound(node) => Some(node),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for KeelError {
    fn from(e: serde_yaml::Error) -> Self {
        KeelError::Yaml(e.to_string())
    }
}
