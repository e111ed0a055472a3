//! Typed error hierarchy for the conductor orchestrator.
//!
//! One enum per subsystem:
//! - `ProcessError`: streaming subprocess failures
//! - `AgentError`: a whole agent turn, including retries
//! - `ConfigError`: fail-fast configuration problems (never retried)
//! - `CommandError`: git / build / test collaborator failures
//! - `ControlError`: rejected control signals
//!
//! Application glue and the CLI use `anyhow` on top of these.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from a single streaming subprocess run.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Executable not found: {program}")]
    ExecutableNotFound { program: String },

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Process exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Process timed out after {}s", after.as_secs())]
    TimedOut { after: Duration },

    #[error("Process was interrupted")]
    Interrupted,

    #[error("Process was terminated")]
    Terminated,

    #[error("I/O error while streaming process output: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Timeouts, interruptions, and exit code 1 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessError::TimedOut { .. }
                | ProcessError::Interrupted
                | ProcessError::NonZeroExit { code: 1, .. }
        )
    }
}

/// Errors from one agent turn.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The caller interrupted or terminated the turn. Never retried.
    #[error("Agent turn halted: {0}")]
    Halted(#[source] ProcessError),

    #[error("Failed to build agent payload: {0}")]
    Payload(String),

    #[error("Agent failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<AgentError>,
    },
}

impl AgentError {
    /// True for failures that no retry or task-level handling can fix.
    pub fn is_configuration(&self) -> bool {
        match self {
            AgentError::Process(ProcessError::ExecutableNotFound { .. }) => true,
            AgentError::RetriesExhausted { last, .. } => last.is_configuration(),
            _ => false,
        }
    }
}

/// Configuration problems. These fail fast and are never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Project directory does not exist: {}", path.display())]
    MissingProjectPath { path: PathBuf },

    #[error("Feature description is empty")]
    EmptyFeatureDescription,

    #[error("Agent executable not found: {command}")]
    AgentNotFound { command: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors from git, build, and test commands.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("`{command}` timed out after {}s", after.as_secs())]
    TimedOut { command: String, after: Duration },

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` was cancelled")]
    Cancelled { command: String },

    #[error("No build system detected in {}", dir.display())]
    NoBuildSystem { dir: PathBuf },
}

impl CommandError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::TimedOut { .. })
    }
}

/// Reasons a control signal was rejected by the orchestrator.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("A workflow is already running")]
    AlreadyRunning,

    #[error("No workflow is running")]
    NotRunning,

    #[error("Workflow is blocked waiting for user input")]
    Blocked,

    #[error("Workflow is not paused")]
    NotPaused,

    #[error("Workflow is not waiting for an answer")]
    NotWaitingForAnswer,

    #[error("No task failure is pending")]
    NoPendingTaskFailure,

    #[error("No command confirmation is pending")]
    NoPendingConfirmation,

    #[error("Signal cannot be handled while a step is in flight")]
    Busy,

    #[error("Orchestrator has shut down")]
    Closed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
