//! Supervised execution of one external agent process.
//!
//! The invoker owns the full lifecycle of a single invocation: spawn the
//! agent command in a worktree, feed the rendered prompt over stdin, capture
//! stdout/stderr, and classify the outcome. Timeouts and cancellation share
//! the same kill path; both leave no orphaned child behind.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::errors::{AgentError, ConfigurationError};
use crate::models::AgentKind;

/// Proof that the agent command answered an availability probe. Obtained
/// once per feature run and threaded through as a value.
#[derive(Debug, Clone)]
pub struct AgentAvailability {
    pub command: String,
    pub version: Option<String>,
}

/// Runs external agent processes with a bounded lifetime.
pub struct AgentInvoker {
    agent_cmd: String,
    agent_args: Vec<String>,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
}

impl AgentInvoker {
    pub fn new(config: &RunConfig, cancel: watch::Receiver<bool>) -> Self {
        Self {
            agent_cmd: config.agent_cmd.clone(),
            agent_args: config.agent_args.clone(),
            timeout: config.agent_timeout,
            cancel,
        }
    }

    /// Probe the agent binary before any feature work begins. A missing or
    /// broken binary is a configuration error for the whole run.
    pub async fn check_availability(&self) -> Result<AgentAvailability, ConfigurationError> {
        let output = Command::new(&self.agent_cmd)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| ConfigurationError::AgentUnavailable {
                command: self.agent_cmd.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ConfigurationError::AgentUnavailable {
                command: self.agent_cmd.clone(),
                reason: format!("probe exited with {}", output.status),
            });
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(command = %self.agent_cmd, version = %version, "Agent availability confirmed");

        Ok(AgentAvailability {
            command: self.agent_cmd.clone(),
            version: (!version.is_empty()).then_some(version),
        })
    }

    /// Run one agent invocation to completion.
    ///
    /// Success requires exit status 0 *and* at least one byte of output;
    /// a silent zero-exit is classified as `NoOutput`, not success.
    pub async fn run(
        &self,
        kind: AgentKind,
        prompt: &str,
        working_dir: &Path,
    ) -> Result<String, AgentError> {
        if !working_dir.is_dir() {
            return Err(AgentError::InvalidWorkingDir {
                path: working_dir.to_path_buf(),
            });
        }
        if *self.cancel.borrow() {
            return Err(AgentError::Cancelled);
        }

        debug!(
            kind = %kind,
            dir = %working_dir.display(),
            prompt_chars = prompt.len(),
            "Spawning agent process"
        );

        let mut child = Command::new(&self.agent_cmd)
            .args(&self.agent_args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Unavailable {
                command: self.agent_cmd.clone(),
                source: e,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| AgentError::ProcessFailed {
                    code: -1,
                    stderr: format!("failed to write prompt to stdin: {}", e),
                })?;
            stdin.shutdown().await.ok();
        }

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(ref mut pipe) = stdout {
                pipe.read_to_string(&mut buf).await.ok();
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(ref mut pipe) = stderr {
                pipe.read_to_string(&mut buf).await.ok();
            }
            buf
        });

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut cancel = self.cancel.clone();
        // A dropped sender means nobody can cancel anymore, not cancellation.
        let mut cancel_open = true;

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| AgentError::ProcessFailed {
                        code: -1,
                        stderr: format!("failed to wait on agent process: {}", e),
                    })?;
                }
                _ = &mut deadline => {
                    warn!(kind = %kind, timeout_secs = self.timeout.as_secs(), "Agent timed out, killing");
                    child.kill().await.ok();
                    stdout_task.abort();
                    stderr_task.abort();
                    return Err(AgentError::TimedOut { seconds: self.timeout.as_secs() });
                }
                changed = cancel.changed(), if cancel_open => {
                    match changed {
                        Err(_) => cancel_open = false,
                        Ok(()) => {
                            if *cancel.borrow() {
                                warn!(kind = %kind, "Agent invocation cancelled, killing");
                                child.kill().await.ok();
                                stdout_task.abort();
                                stderr_task.abort();
                                return Err(AgentError::Cancelled);
                            }
                        }
                    }
                }
            }
        };

        let output = stdout_task.await.unwrap_or_default();
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(AgentError::ProcessFailed {
                code: status.code().unwrap_or(-1),
                stderr: stderr_text.trim().to_string(),
            });
        }
        if output.is_empty() {
            return Err(AgentError::NoOutput);
        }

        debug!(kind = %kind, output_chars = output.len(), "Agent completed");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn invoker_for(cmd: &str, timeout: Duration) -> (AgentInvoker, watch::Sender<bool>) {
        let config = RunConfig::default()
            .with_agent_cmd(cmd)
            .with_agent_args(vec![])
            .with_agent_timeout(timeout);
        let (tx, rx) = watch::channel(false);
        (AgentInvoker::new(&config, rx), tx)
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn run_captures_stdout_of_successful_agent() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", "#!/bin/sh\ncat > /dev/null\necho solved\n");
        let (invoker, _cancel) = invoker_for(&script, Duration::from_secs(10));

        let out = invoker
            .run(AgentKind::Solver, "do the thing", dir.path())
            .await
            .unwrap();
        assert_eq!(out.trim(), "solved");
    }

    #[tokio::test]
    async fn zero_output_with_exit_zero_is_no_output() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", "#!/bin/sh\ncat > /dev/null\n");
        let (invoker, _cancel) = invoker_for(&script, Duration::from_secs(10));

        let err = invoker
            .run(AgentKind::Solver, "prompt", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NoOutput));
    }

    #[tokio::test]
    async fn nonzero_exit_is_process_failed_with_stderr() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "agent.sh",
            "#!/bin/sh\ncat > /dev/null\necho broken >&2\nexit 3\n",
        );
        let (invoker, _cancel) = invoker_for(&script, Duration::from_secs(10));

        let err = invoker
            .run(AgentKind::Reviewer, "prompt", dir.path())
            .await
            .unwrap_err();
        match err {
            AgentError::ProcessFailed { code, stderr } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("Expected ProcessFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_agent_is_killed_on_timeout() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", "#!/bin/sh\ncat > /dev/null\nsleep 30\n");
        let (invoker, _cancel) = invoker_for(&script, Duration::from_millis(200));

        let start = std::time::Instant::now();
        let err = invoker
            .run(AgentKind::Solver, "prompt", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_kills_the_agent() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", "#!/bin/sh\ncat > /dev/null\nsleep 30\n");
        let config = RunConfig::default()
            .with_agent_cmd(&script)
            .with_agent_args(vec![])
            .with_agent_timeout(Duration::from_secs(60));
        let (tx, rx) = watch::channel(false);
        let invoker = AgentInvoker::new(&config, rx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(true).ok();
        });

        let err = invoker
            .run(AgentKind::Solver, "prompt", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let dir = tempdir().unwrap();
        let (invoker, _cancel) = invoker_for("definitely-not-a-real-agent-binary", Duration::from_secs(5));

        let err = invoker
            .run(AgentKind::Solver, "prompt", dir.path())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn missing_working_dir_is_rejected_before_spawn() {
        let (invoker, _cancel) = invoker_for("true", Duration::from_secs(5));
        let err = invoker
            .run(AgentKind::Solver, "prompt", Path::new("/nonexistent/worktree"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidWorkingDir { .. }));
    }

    #[tokio::test]
    async fn availability_probe_fails_for_missing_binary() {
        let (invoker, _cancel) = invoker_for("definitely-not-a-real-agent-binary", Duration::from_secs(5));
        assert!(invoker.check_availability().await.is_err());
    }

    #[tokio::test]
    async fn availability_probe_reports_version() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", "#!/bin/sh\necho 1.2.3\n");
        let (invoker, _cancel) = invoker_for(&script, Duration::from_secs(5));

        let availability = invoker.check_availability().await.unwrap();
        assert_eq!(availability.version.as_deref(), Some("1.2.3"));
    }
}
