//! Health probe contract.
//!
//! A probe is a command invoked in the task's execution context. Exit code
//! 0 is healthy, anything else is a failure, and so is a probe that does not
//! finish within the definition's timeout.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use shoal_state::{Endpoint, TaskId};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The probe command exited with 0.
    Healthy,
    /// The probe command exited non-zero (or was killed by a signal).
    Unhealthy { exit_code: Option<i32> },
    /// The probe did not finish within its timeout.
    TimedOut,
    /// The probe could not be executed at all.
    Failed,
}

impl ProbeResult {
    pub fn is_success(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Everything needed to probe one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub task_id: TaskId,
    pub endpoint: Option<Endpoint>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

/// Executes a probe command for a task.
///
/// Implementations do not need to enforce the timeout themselves;
/// [`run_probe`] bounds every call.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult;
}

/// Run a probe, turning an overrun of `target.timeout` into `TimedOut`.
pub async fn run_probe(probe: &dyn HealthProbe, target: &ProbeTarget) -> ProbeResult {
    match tokio::time::timeout(target.timeout, probe.probe(target)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(task_id = %target.task_id, timeout_ms = target.timeout.as_millis() as u64, "health probe timed out");
            ProbeResult::TimedOut
        }
    }
}

/// Runs the probe command as a local child process.
///
/// The task's environment is passed through, plus `TASK_ID`, and
/// `TASK_HOST`/`TASK_PORT` once the task has an endpoint. The child is
/// killed if the probe is dropped on timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandProbe;

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
        let Some((program, args)) = target.command.split_first() else {
            return ProbeResult::Failed;
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .envs(&target.env)
            .env("TASK_ID", &target.task_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(endpoint) = &target.endpoint {
            cmd.env("TASK_HOST", &endpoint.host)
                .env("TASK_PORT", endpoint.port.to_string());
        }

        match cmd.status().await {
            Ok(status) if status.success() => ProbeResult::Healthy,
            Ok(status) => {
                debug!(task_id = %target.task_id, code = ?status.code(), "health probe exited non-zero");
                ProbeResult::Unhealthy {
                    exit_code: status.code(),
                }
            }
            Err(e) => {
                debug!(task_id = %target.task_id, error = %e, "health probe could not run");
                ProbeResult::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(command: &[&str], timeout: Duration) -> ProbeTarget {
        ProbeTarget {
            task_id: "web-00001".to_string(),
            endpoint: Some(Endpoint::new("127.0.0.1", 18080)),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::from([("MODE".to_string(), "ok".to_string())]),
            timeout,
        }
    }

    struct Stalling;

    #[async_trait]
    impl HealthProbe for Stalling {
        async fn probe(&self, _target: &ProbeTarget) -> ProbeResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ProbeResult::Healthy
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_probe_times_out() {
        let result = run_probe(&Stalling, &target(&["x"], Duration::from_secs(5))).await;
        assert_eq!(result, ProbeResult::TimedOut);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_exit_zero_is_healthy() {
        let t = target(&["sh", "-c", "test \"$MODE\" = ok && test \"$TASK_PORT\" = 18080"], Duration::from_secs(5));
        assert_eq!(run_probe(&CommandProbe, &t).await, ProbeResult::Healthy);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_exit_nonzero_is_unhealthy() {
        let t = target(&["sh", "-c", "exit 3"], Duration::from_secs(5));
        assert_eq!(
            run_probe(&CommandProbe, &t).await,
            ProbeResult::Unhealthy { exit_code: Some(3) }
        );
    }

    #[tokio::test]
    async fn missing_binary_fails() {
        let t = target(&["/definitely/not/a/probe"], Duration::from_secs(5));
        assert_eq!(run_probe(&CommandProbe, &t).await, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn empty_command_fails() {
        let t = target(&[], Duration::from_secs(5));
        assert_eq!(CommandProbe.probe(&t).await, ProbeResult::Failed);
    }
}
