//! The pluggable shell-execution primitive (spec.md §1: `Execute(command)
//! -> {success, failure, timeout}`).

use std::time::Duration;

use async_trait::async_trait;
use queuectl_core::job::ExecutionOutcome;
use tokio::process::Command;
use tracing::{debug, warn};

/// The 300-second hard timeout spec.md §4.3 mandates for every attempt.
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs a job's `command` and classifies the result.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, command: &str) -> ExecutionOutcome;
}

/// Runs commands through `sh -c`, exactly as the source's
/// `subprocess.run(command, shell=True)` did.
///
/// stdout/stderr are captured for logging only (spec.md §1 Non-goals:
/// the system does not preserve a job's output).
pub struct ShellExecutor;

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, command: &str) -> ExecutionOutcome {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);

        let spawned = tokio::time::timeout(EXECUTION_TIMEOUT, cmd.output()).await;

        match spawned {
            Ok(Ok(output)) => {
                debug!(
                    stdout = %String::from_utf8_lossy(&output.stdout),
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "command output"
                );
                if output.status.success() {
                    ExecutionOutcome::Success
                } else {
                    ExecutionOutcome::Failure {
                        exit_code: output.status.code(),
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("failed to launch command '{command}': {e}");
                ExecutionOutcome::ExecutorError {
                    message: e.to_string(),
                }
            }
            Err(_) => {
                warn!("command '{command}' exceeded the {}s timeout", EXECUTION_TIMEOUT.as_secs());
                ExecutionOutcome::Timeout
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_exit_code_zero() {
        let outcome = ShellExecutor.execute("true").await;
        assert_eq!(outcome, ExecutionOutcome::Success);
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure() {
        let outcome = ShellExecutor.execute("false").await;
        assert!(matches!(outcome, ExecutionOutcome::Failure { .. }));
    }

    #[tokio::test]
    async fn exit_code_is_preserved_on_failure() {
        let outcome = ShellExecutor.execute("exit 7").await;
        assert_eq!(outcome, ExecutionOutcome::Failure { exit_code: Some(7) });
    }
}
