use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::CommandError;
use crate::process::{kill_process_group, own_process_group};

/// Outcome of a finished shell command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
    pub error_output: Option<String>,
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandResult {
    /// Combined stdout and stderr, stderr last.
    pub fn combined_output(&self) -> String {
        match &self.error_output {
            Some(err) if !self.output.is_empty() => format!("{}\n{}", self.output, err),
            Some(err) => err.clone(),
            None => self.output.clone(),
        }
    }
}

/// Run `program args...` in `dir`, killing it on timeout or cancellation.
///
/// A non-zero exit is reported in the result, not as an error. On timeout or
/// cancellation the whole process group is killed and reaped before this
/// returns.
pub async fn run_command(
    program: &str,
    args: &[&str],
    dir: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandResult, CommandError> {
    let command_line = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    own_process_group(&mut command);

    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        command: command_line.clone(),
        source,
    })?;
    let pgid = child.id();
    debug!(command = %command_line, pid = pgid, "Running command");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let started = Instant::now();

    let halted = tokio::select! {
        (status, output, error_output) = async {
            tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr))
        } => {
            let status = status.map_err(|source| CommandError::Spawn {
                command: command_line.clone(),
                source,
            })?;
            return Ok(CommandResult {
                success: status.success(),
                output,
                error_output: (!error_output.is_empty()).then_some(error_output),
                exit_code: status.code().unwrap_or(-1),
                duration: started.elapsed(),
            });
        }
        _ = tokio::time::sleep(timeout) => CommandError::TimedOut {
            command: command_line,
            after: timeout,
        },
        _ = cancel.cancelled() => CommandError::Cancelled { command: command_line },
    };

    kill_process_group(&mut child, pgid);
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap killed command");
    }
    Err(halted)
}

async fn read_pipe(pipe: Option<impl AsyncRead + Unpin>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).trim().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::test_support::{exits_soon, process_alive, read_pid};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let result = run_command(
            "sh",
            &["-c", "echo out; echo err >&2; exit 4"],
            dir.path(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 4);
        assert_eq!(result.output, "out");
        assert_eq!(result.error_output.as_deref(), Some("err"));
        assert_eq!(result.combined_output(), "out\nerr");
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempdir().unwrap();
        let err = run_command(
            "sh",
            &["-c", "sleep 10"],
            dir.path(),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_command("sh", &["-c", "sleep 10"], dir.path(), Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_kills_descendants() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let cancel = CancellationToken::new();

        let run = {
            let cancel = cancel.clone();
            let dir = dir.path().to_path_buf();
            tokio::spawn(async move {
                run_command("sh", &["-c", &script], &dir, Duration::from_secs(60), &cancel).await
            })
        };
        let pid = read_pid(&pid_file).await;
        assert!(process_alive(pid));

        cancel.cancel();
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));

        assert!(exits_soon(pid).await, "sleep {} outlived the cancelled command", pid);
    }

    #[tokio::test]
    async fn test_timeout_kills_descendants_holding_the_pipes() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        // The shell exits at once; its child keeps stdout open.
        let script = format!("sleep 30 & echo $! > {}", pid_file.display());
        let err = run_command(
            "sh",
            &["-c", &script],
            dir.path(),
            Duration::from_millis(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());

        let pid = read_pid(&pid_file).await;
        assert!(exits_soon(pid).await, "sleep {} outlived the timed out command", pid);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = tempdir().unwrap();
        let err = run_command(
            "no-such-program-91af",
            &[],
            dir.path(),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
