//! Retrying remote work with exponential backoff

use super::command::RemoteCommand;
use super::executor::{ExecOutput, RemoteExecutor, Session};
use crate::error::{KeelError, Result};
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How often and how patiently to retry
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Run exactly once
    pub fn once() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    pub fn new(attempts: u32, initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_interval,
            max_interval,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            multiplier: 2.0,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

/// Retry `op` while `should_retry` accepts the error and attempts remain
pub async fn retry_if<T, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&KeelError) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0u32;

    backoff::future::retry_notify(
        policy.backoff(),
        || {
            attempt += 1;
            let current = attempt;
            let fut = op();
            let retryable = &should_retry;
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if current < attempts && retryable(&e) => {
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        },
        |err: KeelError, wait: Duration| {
            warn!("{} failed ({}), retrying in {:?}", label, err, wait);
        },
    )
    .await
}

/// Run a command, retrying transport failures only when the command is
/// idempotent
pub async fn execute_with_retry(
    executor: &dyn RemoteExecutor,
    session: &Session,
    command: &RemoteCommand,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<ExecOutput> {
    let policy = if command.is_idempotent() {
        policy.clone()
    } else {
        RetryPolicy::once()
    };
    let label = format!("[{}] {}", session.node_id, command.describe());

    let result = retry_if(&policy, &label, KeelError::is_transient, || {
        executor.execute(session, command, timeout)
    })
    .await;

    // nothing ran when the key was refused
    match (result, session.fallback_session()) {
        (Err(KeelError::AuthenticationFailed { message, .. }), Some(fallback)) => {
            tracing::debug!("{} refused the preferred key ({}), using the configured one", session.node_id, message);
            retry_if(&policy, &label, KeelError::is_transient, || {
                executor.execute(&fallback, command, timeout)
            })
            .await
        }
        (result, _) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    fn unreachable() -> KeelError {
        KeelError::Connection {
            node: "w1".to_string(),
            message: "connection refused".to_string(),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_if(&fast(3), "probe", KeelError::is_transient, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(unreachable())
            } else {
                Ok("up")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "up");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_after_attempt_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_if(&fast(2), "probe", KeelError::is_transient, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(unreachable())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refused_key_falls_back_to_configured_identity() {
        use crate::registry::registry::test_registry;
        use crate::remote::sim::SimulatedFleet;
        use crate::remote::{Identity, RemoteCommand};
        use crate::secret::Secret;

        let registry = test_registry(0, 1);
        let fleet = SimulatedFleet::new(&registry);
        let node = registry.get("w1").unwrap();
        let untrusted = Identity::Inline(Secret::new("FAKE-PRIVATE ssh-ed25519 AAAAuntrusted keel-managed@test"));
        let configured = Session::for_node(node, &registry.credentials(node));

        let strict = configured.clone().with_identity(untrusted.clone());
        let err = execute_with_retry(&fleet, &strict, &RemoteCommand::Probe, Duration::from_secs(1), &fast(3))
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::AuthenticationFailed { .. }));
        // refusals are not retried
        assert_eq!(fleet.calls().len(), 1);

        let preferring = configured.preferring(untrusted);
        let output =
            execute_with_retry(&fleet, &preferring, &RemoteCommand::Probe, Duration::from_secs(1), &fast(3))
                .await
                .unwrap();
        assert_eq!(output.text(), "keel-ok");
        let oks: Vec<bool> = fleet.calls().iter().map(|c| c.ok).collect();
        assert_eq!(oks, vec![false, false, true]);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_if(&fast(5), "install", KeelError::is_transient, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(KeelError::Command {
                node: "w1".to_string(),
                command: "install-runtime".to_string(),
                exit_code: 1,
                stderr: "bad flag".to_string(),
            })
        })
        .await;

        assert!(matches!(result, Err(KeelError::Command { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
