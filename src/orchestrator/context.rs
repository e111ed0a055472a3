//! The observable execution record.
//!
//! Only the engine mutates an [`ExecutionContext`]; everyone else sees cloned
//! snapshots through a `watch` channel. `version` increases with every
//! published change.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::build::{CommandKind, CommandResult};
use crate::compaction::{ContextBudget, ContinuationSummary, HandoffThreshold};
use crate::fallback::{FallbackState, PendingTaskFailure};
use crate::phase::ExecutionPhase;
use crate::plan::{Plan, Task};
use crate::stream::Question;

pub const MAX_LOG_ENTRIES: usize = 500;
pub const MAX_ERRORS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Phase,
    Tool,
    Agent,
    Command,
    Warning,
    Error,
    Separator,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: ExecutionPhase,
    pub kind: LogKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionError {
    pub timestamp: DateTime<Utc>,
    pub phase: ExecutionPhase,
    pub message: String,
    pub recoverable: bool,
}

/// An `AskUserQuestion` waiting for an answer.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingQuestion {
    pub tool_use_id: String,
    pub questions: Vec<Question>,
    /// The phase that resumes once answered.
    pub raised_in: ExecutionPhase,
}

/// A commit, build or test step held back for manual confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfirmation {
    pub step: ConfirmationStep,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStep {
    Commit,
    Build,
    Test,
}

impl From<CommandKind> for ConfirmationStep {
    fn from(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Build => ConfirmationStep::Build,
            CommandKind::Test => ConfirmationStep::Test,
        }
    }
}

impl fmt::Display for ConfirmationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmationStep::Commit => write!(f, "commit"),
            ConfirmationStep::Build => write!(f, "build"),
            ConfirmationStep::Test => write!(f, "test"),
        }
    }
}

/// What the workflow is blocked on. At most one at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum Blocker {
    Question(PendingQuestion),
    TaskFailure(PendingTaskFailure),
    Confirmation(PendingConfirmation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
    /// Answered by auto-answer rather than the user.
    pub auto: bool,
    /// Already included in a prompt.
    pub delivered: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub version: u64,
    pub feature_description: String,
    pub phase: ExecutionPhase,
    /// Phase to return to from `paused` or `waitingForUser`.
    pub resume_phase: Option<ExecutionPhase>,
    pub current_task_index: usize,
    pub session_id: Option<String>,
    pub plan: Option<Plan>,
    pub budget: ContextBudget,
    log: VecDeque<LogEntry>,
    errors: VecDeque<ExecutionError>,
    pub retry_attempt: u32,
    pub task_failure_count: u32,
    pub fallback: FallbackState,
    pub build_attempts: u32,
    pub test_attempts: u32,
    pub last_build_result: Option<CommandResult>,
    pub last_test_result: Option<CommandResult>,
    blocker: Option<Blocker>,
    pub continuation: Option<ContinuationSummary>,
    pub attached_images: Vec<PathBuf>,
    pub qa_history: Vec<QaPair>,
    /// Commit message produced by the agent, pending the actual commit.
    pub commit_message: Option<String>,
    /// User's answer to the last confirmation, consumed by the next step.
    pub command_decision: Option<bool>,
    pub review_notes: Option<String>,
    pub test_plan: Option<String>,
    /// HEAD when the current task started.
    pub task_base_commit: Option<String>,
    /// Phase to return to after a context handoff.
    pub handoff_return: Option<ExecutionPhase>,
    pub auto_answers_in_phase: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn new(window_tokens: u64, threshold: HandoffThreshold) -> Self {
        Self {
            version: 0,
            feature_description: String::new(),
            phase: ExecutionPhase::Idle,
            resume_phase: None,
            current_task_index: 0,
            session_id: None,
            plan: None,
            budget: ContextBudget::new(window_tokens, threshold),
            log: VecDeque::new(),
            errors: VecDeque::new(),
            retry_attempt: 0,
            task_failure_count: 0,
            fallback: FallbackState::default(),
            build_attempts: 0,
            test_attempts: 0,
            last_build_result: None,
            last_test_result: None,
            blocker: None,
            continuation: None,
            attached_images: Vec::new(),
            qa_history: Vec::new(),
            commit_message: None,
            command_decision: None,
            review_notes: None,
            test_plan: None,
            task_base_commit: None,
            handoff_return: None,
            auto_answers_in_phase: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Back to `idle` with nothing carried over except the version counter.
    pub fn reset(&mut self) {
        let version = self.version;
        *self = Self::new(self.budget.window_tokens(), self.budget.threshold());
        self.version = version;
    }

    /// Clear per-run state for a new feature. Log, errors, lifetime token
    /// totals and the fallback state are kept.
    pub fn reset_for_new_feature(&mut self, feature_description: impl Into<String>) {
        let mut fresh = Self::new(self.budget.window_tokens(), self.budget.threshold());
        fresh.version = self.version;
        fresh.log = std::mem::take(&mut self.log);
        fresh.errors = std::mem::take(&mut self.errors);
        fresh.budget = self.budget.clone();
        fresh.budget.start_new_session();
        fresh.fallback = self.fallback.clone();
        fresh.feature_description = feature_description.into();
        *self = fresh;
        self.log(LogKind::Separator, "──────── new feature ────────");
    }

    pub fn log(&mut self, kind: LogKind, message: impl Into<String>) {
        if self.log.len() == MAX_LOG_ENTRIES {
            self.log.pop_front();
        }
        self.log.push_back(LogEntry {
            timestamp: Utc::now(),
            phase: self.phase,
            kind,
            message: message.into(),
        });
    }

    pub fn log_entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.log.iter()
    }

    pub fn record_error(&mut self, message: impl Into<String>, recoverable: bool) {
        let message = message.into();
        self.log(LogKind::Error, message.clone());
        if self.errors.len() == MAX_ERRORS {
            self.errors.pop_front();
        }
        self.errors.push_back(ExecutionError {
            timestamp: Utc::now(),
            phase: self.phase,
            message,
            recoverable,
        });
    }

    pub fn errors(&self) -> impl Iterator<Item = &ExecutionError> {
        self.errors.iter()
    }

    pub fn last_error(&self) -> Option<&ExecutionError> {
        self.errors.back()
    }

    pub fn blocker(&self) -> Option<&Blocker> {
        self.blocker.as_ref()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocker.is_some()
    }

    pub(crate) fn set_blocker(&mut self, blocker: Blocker) {
        self.blocker = Some(blocker);
    }

    pub(crate) fn take_blocker(&mut self) -> Option<Blocker> {
        self.blocker.take()
    }

    pub fn pending_question(&self) -> Option<&PendingQuestion> {
        match &self.blocker {
            Some(Blocker::Question(q)) => Some(q),
            _ => None,
        }
    }

    pub fn pending_task_failure(&self) -> Option<&PendingTaskFailure> {
        match &self.blocker {
            Some(Blocker::TaskFailure(f)) => Some(f),
            _ => None,
        }
    }

    pub fn pending_confirmation(&self) -> Option<&PendingConfirmation> {
        match &self.blocker {
            Some(Blocker::Confirmation(c)) => Some(c),
            _ => None,
        }
    }

    /// True while the engine should keep stepping.
    pub fn is_runnable(&self) -> bool {
        self.phase.is_active() && self.blocker.is_none()
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.plan.as_ref()?.task(self.current_task_index)
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        self.plan.as_mut()?.task_mut(self.current_task_index)
    }

    /// Undelivered answers, oldest first.
    pub fn undelivered_answers(&self) -> impl Iterator<Item = &QaPair> {
        self.qa_history.iter().filter(|qa| !qa.delivered)
    }

    pub fn mark_answers_delivered(&mut self) {
        for qa in &mut self.qa_history {
            qa.delivered = true;
        }
    }

    /// Estimated completion in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.phase == ExecutionPhase::Completed {
            return 1.0;
        }
        let Some(plan) = self.plan.as_ref().filter(|p| !p.is_empty()) else {
            return 0.0;
        };

        let phase = match self.phase {
            ExecutionPhase::Paused
            | ExecutionPhase::WaitingForUser
            | ExecutionPhase::HandlingContextExhaustion => self
                .resume_phase
                .or(self.handoff_return)
                .unwrap_or(self.phase),
            other => other,
        };
        let in_flight = match self.current_task() {
            Some(task) if !task.status.is_settled() && phase.is_task_phase() => {
                phase.progress_weight()
            }
            _ => 0.0,
        };

        let total = plan.tasks.len() as f64;
        ((plan.settled_count() as f64 + in_flight) / total).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::FallbackReason;
    use crate::plan::TaskStatus;

    fn context() -> ExecutionContext {
        ExecutionContext::new(200_000, HandoffThreshold::default())
    }

    const TWO_TASKS: &str = "## Task 1: One\n## Task 2: Two\n";

    #[test]
    fn test_log_is_bounded() {
        let mut ctx = context();
        for i in 0..(MAX_LOG_ENTRIES + 25) {
            ctx.log(LogKind::Info, format!("entry {}", i));
        }
        assert_eq!(ctx.log_entries().count(), MAX_LOG_ENTRIES);
        assert_eq!(ctx.log_entries().next().unwrap().message, "entry 25");
    }

    #[test]
    fn test_errors_are_bounded_and_logged() {
        let mut ctx = context();
        ctx.phase = ExecutionPhase::RunningBuild;
        for i in 0..(MAX_ERRORS + 3) {
            ctx.record_error(format!("boom {}", i), true);
        }
        assert_eq!(ctx.errors().count(), MAX_ERRORS);
        let last = ctx.last_error().unwrap();
        assert_eq!(last.phase, ExecutionPhase::RunningBuild);
        assert!(last.recoverable);
        assert!(ctx.log_entries().any(|e| e.kind == LogKind::Error));
    }

    #[test]
    fn test_single_blocker() {
        let mut ctx = context();
        ctx.phase = ExecutionPhase::ExecutingTask;
        assert!(ctx.is_runnable());

        ctx.set_blocker(Blocker::TaskFailure(PendingTaskFailure {
            task_id: "task-1".into(),
            task_title: "One".into(),
            error: "exit 2".into(),
        }));
        assert!(!ctx.is_runnable());
        assert!(ctx.pending_task_failure().is_some());
        assert!(ctx.pending_question().is_none());

        ctx.set_blocker(Blocker::Confirmation(PendingConfirmation {
            step: ConfirmationStep::Build,
            command: "cargo build".into(),
        }));
        assert!(ctx.pending_task_failure().is_none());
        assert_eq!(ctx.pending_confirmation().unwrap().command, "cargo build");

        assert!(ctx.take_blocker().is_some());
        assert!(ctx.is_runnable());
    }

    #[test]
    fn test_reset_for_new_feature_keeps_history() {
        let mut ctx = context();
        ctx.version = 7;
        ctx.feature_description = "old".into();
        ctx.phase = ExecutionPhase::Completed;
        ctx.plan = Some(Plan::parse(TWO_TASKS));
        ctx.session_id = Some("s1".into());
        ctx.log(LogKind::Info, "did things");
        ctx.record_error("bad", true);
        ctx.fallback.enter(FallbackReason::UserToggled);

        ctx.reset_for_new_feature("new feature");

        assert_eq!(ctx.version, 7);
        assert_eq!(ctx.feature_description, "new feature");
        assert_eq!(ctx.phase, ExecutionPhase::Idle);
        assert!(ctx.plan.is_none());
        assert!(ctx.session_id.is_none());
        assert_eq!(ctx.errors().count(), 1);
        assert!(ctx.fallback.in_fallback_mode);
        let last = ctx.log_entries().last().unwrap();
        assert_eq!(last.kind, LogKind::Separator);
        assert!(ctx.log_entries().any(|e| e.message == "did things"));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut ctx = context();
        ctx.version = 3;
        ctx.phase = ExecutionPhase::Failed;
        ctx.log(LogKind::Info, "x");
        ctx.reset();
        assert_eq!(ctx.version, 3);
        assert_eq!(ctx.phase, ExecutionPhase::Idle);
        assert_eq!(ctx.log_entries().count(), 0);
    }

    #[test]
    fn test_progress() {
        let mut ctx = context();
        assert_eq!(ctx.progress(), 0.0);

        ctx.plan = Some(Plan::parse(TWO_TASKS));
        ctx.phase = ExecutionPhase::ExecutingTask;
        assert!((ctx.progress() - 0.05).abs() < 1e-9);

        ctx.plan.as_mut().unwrap().tasks[0].status = TaskStatus::Completed;
        ctx.current_task_index = 1;
        ctx.phase = ExecutionPhase::ReviewingCode;
        assert!((ctx.progress() - 0.75).abs() < 1e-9);

        ctx.resume_phase = Some(ExecutionPhase::ReviewingCode);
        ctx.phase = ExecutionPhase::Paused;
        assert!((ctx.progress() - 0.75).abs() < 1e-9);

        ctx.phase = ExecutionPhase::Completed;
        assert_eq!(ctx.progress(), 1.0);
    }

    #[test]
    fn test_answers_delivered_once() {
        let mut ctx = context();
        ctx.qa_history.push(QaPair {
            question: "Which DB?".into(),
            answer: "Postgres".into(),
            auto: false,
            delivered: false,
        });
        assert_eq!(ctx.undelivered_answers().count(), 1);
        ctx.mark_answers_delivered();
        assert_eq!(ctx.undelivered_answers().count(), 0);
    }
}
