//! Remote execution layer
//!
//! Typed commands, the executor seam, and retry helpers.

pub mod command;
pub mod executor;
pub mod retry;

#[cfg(test)]
pub(crate) mod sim;

pub use command::{FirewallRule, InstallSpec, OsFamily, Protocol, RemoteCommand};
pub use executor::{ExecOutput, Identity, RemoteExecutor, Session, SshExecutor};
pub use retry::{execute_with_retry, retry_if, RetryPolicy};
