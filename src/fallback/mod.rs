//! Fallback and autonomy policy.
//!
//! Two independent concerns live here:
//! - command failures (git, build, test) feed a consecutive-failure counter
//!   that demotes the session to manual command execution
//! - task failures are resolved by the configured [`FailureHandling`]
//!   strategy into a [`TaskFailureDecision`]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::retry::RetryConfig;

/// What to do when a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureHandling {
    /// Block and let the user decide.
    PauseForUser,
    /// Retry up to the cap, then skip the task.
    #[default]
    RetryThenSkip,
    /// Retry up to the cap, then fail the run.
    RetryThenStop,
}

impl fmt::Display for FailureHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureHandling::PauseForUser => "pause_for_user",
            FailureHandling::RetryThenSkip => "retry_then_skip",
            FailureHandling::RetryThenStop => "retry_then_stop",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for FailureHandling {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pause_for_user" | "pauseforuser" | "pause" => Ok(FailureHandling::PauseForUser),
            "retry_then_skip" | "retrythenskip" | "skip" => Ok(FailureHandling::RetryThenSkip),
            "retry_then_stop" | "retrythenstop" | "stop" => Ok(FailureHandling::RetryThenStop),
            _ => anyhow::bail!(
                "Invalid failure handling: '{}'. Use pause_for_user, retry_then_skip, or retry_then_stop",
                s
            ),
        }
    }
}

/// Autonomy settings for a workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct AutonomousConfig {
    pub auto_answer_enabled: bool,
    pub auto_failure_handling: FailureHandling,
    pub max_task_retries: u32,
    pub run_build_after_commit: bool,
    pub run_tests_after_commit: bool,
    pub consecutive_failures_before_fallback: u32,
    pub fallback_on_command_failure: bool,
    pub max_build_fix_attempts: u32,
    pub max_test_fix_attempts: u32,
}

impl Default for AutonomousConfig {
    fn default() -> Self {
        Self {
            auto_answer_enabled: false,
            auto_failure_handling: FailureHandling::default(),
            max_task_retries: 2,
            run_build_after_commit: true,
            run_tests_after_commit: true,
            consecutive_failures_before_fallback: 3,
            fallback_on_command_failure: true,
            max_build_fix_attempts: 3,
            max_test_fix_attempts: 3,
        }
    }
}

/// Why the session left autonomous command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    Timeout,
    CommandFailure(String),
    ConsecutiveFailures(u32),
    UserToggled,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Timeout => write!(f, "command timed out"),
            FallbackReason::CommandFailure(detail) => write!(f, "command failed: {}", detail),
            FallbackReason::ConsecutiveFailures(n) => {
                write!(f, "{} consecutive command failures", n)
            }
            FallbackReason::UserToggled => write!(f, "manual mode enabled by user"),
        }
    }
}

/// A single failed git/build/test command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFailure {
    Timeout,
    Failed(String),
}

/// Fallback flags carried in the execution context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FallbackState {
    pub consecutive_command_failures: u32,
    pub in_fallback_mode: bool,
    pub reason: Option<FallbackReason>,
    pub manual_override: bool,
}

impl FallbackState {
    /// Commands need user confirmation before they run.
    pub fn requires_manual(&self) -> bool {
        self.in_fallback_mode || self.manual_override
    }

    /// Count a command failure. Returns true when this failure put the
    /// session into fallback mode.
    pub fn record_command_failure(
        &mut self,
        config: &AutonomousConfig,
        failure: CommandFailure,
    ) -> bool {
        self.consecutive_command_failures += 1;
        let threshold = config.consecutive_failures_before_fallback.max(1);
        if !config.fallback_on_command_failure
            || self.in_fallback_mode
            || self.consecutive_command_failures < threshold
        {
            return false;
        }

        let reason = if threshold == 1 {
            match failure {
                CommandFailure::Timeout => FallbackReason::Timeout,
                CommandFailure::Failed(detail) => FallbackReason::CommandFailure(detail),
            }
        } else {
            FallbackReason::ConsecutiveFailures(self.consecutive_command_failures)
        };
        self.enter(reason);
        true
    }

    /// A success resets the counter but never leaves fallback mode.
    pub fn record_command_success(&mut self) {
        self.consecutive_command_failures = 0;
    }

    pub fn enter(&mut self, reason: FallbackReason) {
        warn!(reason = %reason, "Entering manual fallback mode");
        self.in_fallback_mode = true;
        self.reason = Some(reason);
    }

    /// Manual-mode override from the user. Disabling it is the explicit reset
    /// that returns the session to autonomous command execution.
    pub fn set_manual_mode(&mut self, enabled: bool) {
        if enabled {
            self.manual_override = true;
            if !self.in_fallback_mode {
                self.enter(FallbackReason::UserToggled);
            }
        } else {
            info!("Returning to autonomous command execution");
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        *self = FallbackState::default();
    }
}

/// Outcome of the task-failure strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailureDecision {
    Retry { attempt: u32, delay: Duration },
    Skip,
    Stop,
    AskUser,
}

/// Decide how to handle a task failure given how many retries the task has
/// already used.
pub fn decide_task_failure(
    config: &AutonomousConfig,
    retry: &RetryConfig,
    retries_used: u32,
) -> TaskFailureDecision {
    if config.auto_failure_handling == FailureHandling::PauseForUser {
        return TaskFailureDecision::AskUser;
    }
    if retries_used < config.max_task_retries {
        let attempt = retries_used + 1;
        return TaskFailureDecision::Retry {
            attempt,
            delay: retry.delay(attempt),
        };
    }
    match config.auto_failure_handling {
        FailureHandling::RetryThenStop => TaskFailureDecision::Stop,
        _ => TaskFailureDecision::Skip,
    }
}

/// A task failure waiting for the user's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTaskFailure {
    pub task_id: String,
    pub task_title: String,
    pub error: String,
}

/// The user's answer to a [`PendingTaskFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFailureChoice {
    Retry,
    Skip,
    Stop,
}

impl fmt::Display for TaskFailureChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskFailureChoice::Retry => "retry",
            TaskFailureChoice::Skip => "skip",
            TaskFailureChoice::Stop => "stop",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TaskFailureChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "retry" | "r" => Ok(TaskFailureChoice::Retry),
            "skip" | "s" => Ok(TaskFailureChoice::Skip),
            "stop" | "abort" => Ok(TaskFailureChoice::Stop),
            _ => anyhow::bail!("Invalid choice: '{}'. Use retry, skip, or stop", s),
        }
    }
}
