//! Local subprocess backend.
//!
//! Spawns the configured command with piped stdio, each child in its own
//! process group, and tears it down with an escalating stop sequence.

use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::logs::LogBuffer;
use crate::bridge::errors::BridgeError;

// ─── Driver ──────────────────────────────────────────────────────────────────

/// Launches services as child processes of the gateway.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessDriver;

impl LocalProcessDriver {
    /// Spawn `command` with `args` and the resolved environment.
    ///
    /// stderr is drained into `logs` for the lifetime of the child.
    pub fn start(
        &self,
        service: &str,
        command: &str,
        args: &[String],
        env: &[(String, String)],
        logs: &LogBuffer,
    ) -> Result<ProcessBackend, BridgeError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // Own process group: a signal aimed at the gateway's group does not
        // reach the child, and the child's subprocesses can be signalled together.
        #[cfg(unix)]
        cmd.process_group(0);

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(|e| BridgeError::LaunchFailed {
            name: service.to_string(),
            reason: format!("failed to spawn '{command}': {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| BridgeError::LaunchFailed {
            name: service.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::LaunchFailed {
            name: service.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr_task = child.stderr.take().map(|stderr| logs.capture(service, stderr));

        let pid = child.id();
        tracing::info!(service, command, pid, "spawned backend process");

        Ok(ProcessBackend {
            service: service.to_string(),
            child,
            pid,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr_task,
        })
    }
}

// ─── Backend Handle ──────────────────────────────────────────────────────────

/// A spawned child. Dropping it kills the child.
pub struct ProcessBackend {
    service: String,
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
}

impl ProcessBackend {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hand the stdio pipes to the transport. Yields them once.
    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        Some((self.stdin.take()?, self.stdout.take()?))
    }

    /// Stop the child and reap it.
    ///
    /// The caller closes stdin first. Then: wait `grace` → SIGTERM to the
    /// process group → wait `grace` → SIGKILL → wait. Returns the exit code
    /// when the child reported one.
    pub async fn terminate(mut self, grace: Duration) -> Option<i32> {
        let service = self.service.clone();
        drop(self.stdin.take());

        if let Some(code) = self.wait_for(grace, "input close").await {
            return self.finish(code).await;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = self.pid {
                tracing::info!(service = %service, pid, "sending SIGTERM to process group");
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    tracing::warn!(service = %service, pid, error = ?e, "killpg SIGTERM failed");
                }
                if let Some(code) = self.wait_for(grace, "SIGTERM").await {
                    return self.finish(code).await;
                }
            }
        }

        tracing::warn!(service = %service, pid = self.pid, "sending SIGKILL");
        if let Err(e) = self.child.kill().await {
            tracing::error!(service = %service, error = %e, "SIGKILL failed");
        }
        let code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::error!(service = %service, error = %e, "failed to reap backend");
                None
            }
        };
        self.finish(code).await
    }

    /// Wait up to `grace` for exit. `Some(code)` if the child is gone.
    async fn wait_for(&mut self, grace: Duration, after: &str) -> Option<Option<i32>> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(
                    service = %self.service,
                    code = status.code(),
                    "backend exited after {after}"
                );
                Some(status.code())
            }
            Ok(Err(e)) => {
                tracing::error!(service = %self.service, error = %e, "wait failed after {after}");
                None
            }
            Err(_) => {
                tracing::info!(service = %self.service, "backend still running after {after}");
                None
            }
        }
    }

    async fn finish(mut self, code: Option<i32>) -> Option<i32> {
        drop(self.stdout.take());
        if let Some(task) = self.stderr_task.take() {
            // The pipe closes with the child; bound the wait in case a
            // grandchild inherited it.
            let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
        }
        code
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_missing_binary_is_launch_failed() {
        let err = LocalProcessDriver
            .start("ghost", "/nonexistent/mcp-server", &[], &[], &LogBuffer::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::bridge::errors::ErrorKind::LaunchFailed);
    }

    #[tokio::test]
    async fn test_child_exits_when_input_closes() {
        let mut backend = LocalProcessDriver
            .start("cat", "cat", &[], &[], &LogBuffer::default())
            .unwrap();
        let (stdin, _stdout) = backend.take_stdio().unwrap();
        drop(stdin);

        let code = backend.terminate(Duration::from_secs(5)).await;
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn test_stubborn_child_is_signalled() {
        let backend = LocalProcessDriver
            .start("sleeper", "sleep", &["30".to_string()], &[], &LogBuffer::default())
            .unwrap();

        let started = Instant::now();
        backend.terminate(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stderr_and_env_reach_log_buffer() {
        let logs = LogBuffer::default();
        let backend = LocalProcessDriver
            .start(
                "talker",
                "sh",
                &["-c".to_string(), "echo \"hello $GREETING\" >&2".to_string()],
                &[("GREETING".to_string(), "world".to_string())],
                &logs,
            )
            .unwrap();

        backend.terminate(Duration::from_secs(5)).await;
        assert_eq!(logs.text(), "hello world\n");
    }
}
