//! Streaming process engine.
//!
//! [`EventStream`] runs one external executable and yields its stdout as a
//! lazy, finite sequence of decoded [`StreamEvent`]s:
//!
//! - the child is spawned on the first call to [`EventStream::next`]
//! - undecodable lines are dropped and logged at `debug`
//! - the sequence ends with `None` on clean exit, or with exactly one
//!   [`ProcessError`] (`NonZeroExit`, `TimedOut`, `Interrupted`, `Terminated`)
//! - by the time `next` returns `None` or an error, the child has been reaped
//!
//! A supervisor task owns the child. It stops the child when the deadline
//! passes, when [`ProcessControl`] asks it to, or when the consumer drops the
//! stream, and always waits for the exit status before finishing.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ProcessError;
use crate::stream::{StreamEvent, decode_line, truncate_str};

/// Capacity of the channel between the supervisor and the consumer.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long a child gets to exit after a graceful interrupt before it is killed.
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for the stderr pipe after the child has exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum stderr bytes kept for error reports.
const MAX_STDERR_BYTES: usize = 16 * 1024;

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<Vec<u8>>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: None,
            stdin: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(payload.into());
        self
    }
}

/// Cooperative stop handle for a running process.
///
/// `terminate` is a hard kill; `interrupt` sends SIGINT and allows
/// [`INTERRUPT_GRACE`] before killing. Both are idempotent and harmless after
/// the process has exited. Terminating a control also interrupts it.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    terminate: CancellationToken,
    interrupt: CancellationToken,
}

impl Default for ProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl {
    pub fn new() -> Self {
        let terminate = CancellationToken::new();
        let interrupt = terminate.child_token();
        Self {
            terminate,
            interrupt,
        }
    }

    /// A control that fires whenever this one does, and can also be fired on
    /// its own without affecting the parent.
    pub fn child(&self) -> Self {
        Self {
            terminate: self.terminate.child_token(),
            interrupt: self.interrupt.child_token(),
        }
    }

    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_interrupted() || self.is_terminated()
    }

    /// Completes once either signal has fired.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.interrupt.cancelled() => {}
            _ = self.terminate.cancelled() => {}
        }
    }

    /// Token for waits that are not processes (backoff sleeps, shell
    /// commands). On a root control it fires on either signal.
    pub fn token(&self) -> CancellationToken {
        self.interrupt.clone()
    }
}

type EventItem = Result<StreamEvent, ProcessError>;

enum StreamState {
    Pending(ProcessSpec, ProcessControl),
    Running {
        rx: mpsc::Receiver<EventItem>,
        supervisor: JoinHandle<()>,
    },
    Finished,
}

/// Lazy, non-restartable stream of decoded events from one process run.
pub struct EventStream {
    state: StreamState,
}

impl EventStream {
    pub fn new(spec: ProcessSpec, control: ProcessControl) -> Self {
        Self {
            state: StreamState::Pending(spec, control),
        }
    }

    /// Next decoded event. `None` after a clean exit; an error ends the
    /// stream. Either way the child has been reaped before this returns.
    pub async fn next(&mut self) -> Option<EventItem> {
        if matches!(self.state, StreamState::Pending(..)) {
            let StreamState::Pending(spec, control) =
                std::mem::replace(&mut self.state, StreamState::Finished)
            else {
                return None;
            };
            match start(spec, control) {
                Ok((rx, supervisor)) => self.state = StreamState::Running { rx, supervisor },
                Err(err) => return Some(Err(err)),
            }
        }

        let StreamState::Running { rx, .. } = &mut self.state else {
            return None;
        };
        match rx.recv().await {
            Some(Ok(event)) => Some(Ok(event)),
            Some(Err(err)) => {
                self.finish().await;
                Some(Err(err))
            }
            None => {
                self.finish().await;
                None
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, StreamState::Finished)
    }

    async fn finish(&mut self) {
        if let StreamState::Running { supervisor, .. } =
            std::mem::replace(&mut self.state, StreamState::Finished)
            && let Err(e) = supervisor.await
        {
            warn!(error = %e, "Process supervisor task failed");
        }
    }
}

fn start(
    spec: ProcessSpec,
    control: ProcessControl,
) -> Result<(mpsc::Receiver<EventItem>, JoinHandle<()>), ProcessError> {
    if control.is_terminated() {
        return Err(ProcessError::Terminated);
    }
    if control.is_interrupted() {
        return Err(ProcessError::Interrupted);
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    own_process_group(&mut cmd);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProcessError::ExecutableNotFound {
                program: spec.program.clone(),
            }
        } else {
            ProcessError::SpawnFailed(e)
        }
    })?;
    debug!(pid = child.id(), program = %spec.program, "Spawned process");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProcessError::Io(std::io::Error::other("stdout was not captured")))?;
    let stderr = child.stderr.take().map(|s| tokio::spawn(collect_stderr(s)));

    if let (Some(payload), Some(mut stdin)) = (spec.stdin, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "Failed to write stdin payload");
            }
            let _ = stdin.shutdown().await;
        });
    }

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let supervisor = tokio::spawn(supervise(child, stdout, stderr, tx, control, spec.timeout));
    Ok((rx, supervisor))
}

enum Halt {
    TimedOut(Duration),
    Interrupted,
    Terminated,
    Abandoned,
}

async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    tx: mpsc::Sender<EventItem>,
    control: ProcessControl,
    timeout: Option<Duration>,
) {
    let pid = child.id();
    let mut lines = BufReader::new(stdout).lines();
    let deadline = tokio::time::sleep_until(match timeout {
        Some(t) => Instant::now() + t,
        None => far_future(),
    });
    tokio::pin!(deadline);

    let mut halt: Option<Halt> = None;
    let mut stdout_done = false;
    let mut killed = false;
    let mut interrupt_sent = false;

    let status = loop {
        tokio::select! {
            biased;

            _ = control.terminate.cancelled(), if !killed => {
                debug!(pid, "Terminating process");
                halt = Some(Halt::Terminated);
                kill(&mut child, pid, &mut killed);
            }
            _ = control.interrupt.cancelled(), if !interrupt_sent && !killed => {
                interrupt_sent = true;
                halt.get_or_insert(Halt::Interrupted);
                if send_interrupt(&child) {
                    debug!(pid, "Sent SIGINT to process");
                    deadline.as_mut().reset(Instant::now() + INTERRUPT_GRACE);
                } else {
                    kill(&mut child, pid, &mut killed);
                }
            }
            () = &mut deadline, if !killed => {
                if !interrupt_sent {
                    let after = timeout.unwrap_or_default();
                    warn!(pid, timeout_secs = after.as_secs(), "Process timed out");
                    halt = Some(Halt::TimedOut(after));
                }
                kill(&mut child, pid, &mut killed);
            }
            _ = tx.closed(), if !killed => {
                debug!(pid, "Event consumer went away, stopping process");
                halt.get_or_insert(Halt::Abandoned);
                kill(&mut child, pid, &mut killed);
            }
            line = lines.next_line(), if !stdout_done => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_line(&line) {
                        Ok(event) => {
                            tokio::select! {
                                biased;
                                _ = control.terminate.cancelled(), if !killed => {
                                    halt = Some(Halt::Terminated);
                                    kill(&mut child, pid, &mut killed);
                                }
                                sent = tx.send(Ok(event)) => {
                                    if sent.is_err() && !killed {
                                        halt.get_or_insert(Halt::Abandoned);
                                        kill(&mut child, pid, &mut killed);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            debug!(pid, error = %e, line = %truncate_str(&line, 200), "Dropping undecodable line");
                        }
                    }
                }
                Ok(None) => stdout_done = true,
                Err(e) => {
                    warn!(pid, error = %e, "Failed reading process stdout");
                    stdout_done = true;
                }
            },
            status = child.wait(), if stdout_done || killed => break status,
        }
    };

    let stderr = match stderr {
        Some(task) => match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await {
            Ok(Ok(text)) => text,
            _ => String::new(),
        },
        None => String::new(),
    };
    debug!(pid, status = ?status.as_ref().ok(), "Process exited");

    let outcome = match halt {
        Some(Halt::Abandoned) => return,
        Some(Halt::Terminated) => Err(ProcessError::Terminated),
        Some(Halt::TimedOut(after)) => Err(ProcessError::TimedOut { after }),
        Some(Halt::Interrupted) => Err(ProcessError::Interrupted),
        None => match status {
            Ok(status) => classify_exit(status, stderr),
            Err(e) => Err(ProcessError::Io(e)),
        },
    };
    if let Err(err) = outcome {
        let _ = tx.send(Err(err)).await;
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

fn kill(child: &mut Child, pgid: Option<u32>, killed: &mut bool) {
    kill_process_group(child, pgid);
    *killed = true;
}

/// Start the child as the leader of a new process group, so that signals
/// reach everything it spawns.
pub(crate) fn own_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(not(unix))]
    let _ = cmd;
}

/// SIGKILL the process group led by `pgid`, then the child itself.
///
/// `pgid` is the child's pid taken at spawn time, so descendants are still
/// reached after the leader has exited. Callers still have to wait on the
/// child.
pub(crate) fn kill_process_group(child: &mut Child, pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        signal_group(pgid, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pgid;
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill failed, process already exited");
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    // SAFETY: `pid` leads a process group we created. Its id stays reserved
    // while the leader is unreaped or any member is alive.
    unsafe { libc::killpg(pid as libc::pid_t, signal) == 0 }
}

#[cfg(unix)]
fn send_interrupt(child: &Child) -> bool {
    child.id().is_some_and(|pid| signal_group(pid, libc::SIGINT))
}

#[cfg(not(unix))]
fn send_interrupt(_child: &Child) -> bool {
    false
}

fn classify_exit(status: ExitStatus, stderr: String) -> Result<(), ProcessError> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(ProcessError::NonZeroExit { code, stderr });
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(libc::SIGINT) {
            return Err(ProcessError::Interrupted);
        }
    }
    Err(ProcessError::Terminated)
}

async fn collect_stderr(stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    let mut limited = stderr.take(MAX_STDERR_BYTES as u64);
    let _ = limited.read_to_end(&mut buf).await;
    // Keep draining so the child never blocks on a full pipe.
    let mut rest = limited.into_inner();
    let _ = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await;
    String::from_utf8_lossy(&buf).trim().to_string()
}
