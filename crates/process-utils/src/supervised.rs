//! Supervised child processes.
//!
//! A [`SupervisedChild`] owns a spawned process together with the tasks that
//! drain its stdout and stderr. Waiting is always bounded: when the deadline
//! passes the process is killed and whatever output was produced so far is
//! returned. Dropping the handle before the child has exited kills it.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// How long to wait for the output pipes to close after the child exited.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Text captured from a child's standard streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Best diagnostic text: stderr when non-empty, stdout otherwise.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Terminal state of a supervised child.
#[derive(Debug)]
pub enum ChildOutcome {
    /// The process exited on its own.
    Completed {
        status: ExitStatus,
        output: CapturedOutput,
    },
    /// The deadline passed; the process was killed.
    TimedOut { output: CapturedOutput },
    /// The process could not be started.
    SpawnFailed(io::Error),
    /// Waiting on the process failed; it was killed.
    WaitFailed(io::Error),
}

impl ChildOutcome {
    /// Whether the process ran to completion with a zero exit status.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { status, .. } if status.success())
    }
}

/// An owned, running child process.
pub struct SupervisedChild {
    child: Child,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
    exited: bool,
}

impl SupervisedChild {
    /// Spawn `command` with stdin closed and both output streams captured.
    pub fn spawn(command: &mut Command) -> io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().map(|pipe| tokio::spawn(drain(pipe)));
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(drain(pipe)));

        Ok(Self {
            child,
            stdout,
            stderr,
            exited: false,
        })
    }

    /// Wait for the child to exit, killing it once `timeout` elapses.
    pub async fn wait_timeout(mut self, timeout: Duration) -> ChildOutcome {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exited = true;
                let output = self.collect_output().await;
                ChildOutcome::Completed { status, output }
            }
            Ok(Err(e)) => {
                self.terminate().await;
                ChildOutcome::WaitFailed(e)
            }
            Err(_) => {
                self.terminate().await;
                let output = self.collect_output().await;
                ChildOutcome::TimedOut { output }
            }
        }
    }

    async fn terminate(&mut self) {
        // kill() also reaps the child, so no zombie is left behind.
        let _ = self.child.kill().await;
        self.exited = true;
    }

    async fn collect_output(&mut self) -> CapturedOutput {
        CapturedOutput {
            stdout: join_drain(self.stdout.take()).await,
            stderr: join_drain(self.stderr.take()).await,
        }
    }
}

impl Drop for SupervisedChild {
    fn drop(&mut self) {
        if !self.exited {
            let _ = self.child.start_kill();
        }
        for handle in [self.stdout.take(), self.stderr.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// Spawn `command` and wait for it with a hard `timeout`.
pub async fn run_supervised(command: &mut Command, timeout: Duration) -> ChildOutcome {
    match SupervisedChild::spawn(command) {
        Ok(child) => child.wait_timeout(timeout).await,
        Err(e) => ChildOutcome::SpawnFailed(e),
    }
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn join_drain(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // A grandchild may still hold the pipe open.
            handle.abort();
            String::new()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tokio_command;

    fn sh(script: &str) -> Command {
        let mut cmd = tokio_command("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_completed_captures_both_streams() {
        let outcome = run_supervised(
            &mut sh("echo out; echo err 1>&2"),
            Duration::from_secs(5),
        )
        .await;

        match outcome {
            ChildOutcome::Completed { status, output } => {
                assert!(status.success());
                assert_eq!(output.stdout.trim(), "out");
                assert_eq!(output.stderr.trim(), "err");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let outcome = run_supervised(&mut sh("echo boom 1>&2; exit 3"), Duration::from_secs(5)).await;

        assert!(!outcome.is_success());
        match outcome {
            ChildOutcome::Completed { status, output } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(output.diagnostic(), "boom");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let outcome = run_supervised(
            &mut sh("echo started; exec sleep 30"),
            Duration::from_millis(300),
        )
        .await;

        match outcome {
            ChildOutcome::TimedOut { output } => assert_eq!(output.stdout.trim(), "started"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut cmd = tokio_command("/definitely/not/a/real/binary");
        let outcome = run_supervised(&mut cmd, Duration::from_secs(1)).await;
        assert!(matches!(outcome, ChildOutcome::SpawnFailed(_)));
    }

    #[test]
    fn test_diagnostic_falls_back_to_stdout() {
        let output = CapturedOutput {
            stdout: " only stdout \n".to_string(),
            stderr: "  ".to_string(),
        };
        assert_eq!(output.diagnostic(), "only stdout");
    }
}
