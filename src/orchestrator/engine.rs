//! The workflow engine.
//!
//! [`workflow`] returns an [`Orchestrator`] to be driven with
//! [`Orchestrator::run`] and a cloneable [`WorkflowHandle`] for control
//! signals and observation. The orchestrator runs one step at a time; control
//! signals are consumed between steps, except pause and stop which also reach
//! into a step in flight.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::build::{BuildConfig, BuildRunner, CommandKind, CommandResult};
use crate::compaction::{DEFAULT_CONTEXT_WINDOW_TOKENS, HandoffThreshold, build_continuation};
use crate::errors::{AgentError, CommandError, ConfigError, ControlError};
use crate::fallback::{
    AutonomousConfig, CommandFailure, PendingTaskFailure, TaskFailureChoice, TaskFailureDecision,
    decide_task_failure,
};
use crate::phase::{ExecutionPhase, TimeoutConfig};
use crate::plan::{Plan, PlanStore, TaskStatus};
use crate::process::ProcessControl;
use crate::retry::RetryConfig;
use crate::stream::first_line_snippet;
use crate::tracker::{CommitOutcome, VersionControl};

use super::context::{
    Blocker, ConfirmationStep, ExecutionContext, LogKind, PendingConfirmation, PendingQuestion,
    QaPair,
};
use super::journal::PhaseJournal;
use super::machine::{self, StepOutcome, Transition, TransitionInputs};
use super::prompts::{build_prompt, default_commit_message, extract_commit_message};
use super::runner::{AgentRequest, AgentRunner, AgentTurn};

const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// Questions answered automatically in one phase before asking the user.
const MAX_AUTO_ANSWERS_PER_PHASE: u32 = 3;

/// Task id used for failures during planning, before any task exists.
const PLANNING_TASK_ID: &str = "plan";

/// Static settings for one workflow instance.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub project_dir: PathBuf,
    pub autonomous: AutonomousConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub build: BuildConfig,
    pub context_window_tokens: u64,
    pub handoff_threshold: HandoffThreshold,
    /// Where the plan is persisted, if anywhere.
    pub plan_file: Option<PathBuf>,
    /// Where phase transitions are journaled, if anywhere.
    pub journal_file: Option<PathBuf>,
}

impl WorkflowSettings {
    pub fn new(project_dir: PathBuf) -> Self {
        Self {
            project_dir,
            autonomous: AutonomousConfig::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            build: BuildConfig::default(),
            context_window_tokens: DEFAULT_CONTEXT_WINDOW_TOKENS,
            handoff_threshold: HandoffThreshold::default(),
            plan_file: None,
            journal_file: None,
        }
    }
}

/// The external systems a workflow drives.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn AgentRunner>,
    pub vcs: Arc<dyn VersionControl>,
    pub builder: Arc<dyn BuildRunner>,
}

type Reply = oneshot::Sender<Result<(), ControlError>>;

#[derive(Debug)]
enum Signal {
    Start {
        feature: String,
        images: Vec<PathBuf>,
    },
    Pause,
    Resume,
    Stop,
    Answer(String),
    TaskFailure(TaskFailureChoice),
    Confirm(bool),
    ManualMode(bool),
    Reset,
}

struct Envelope {
    signal: Signal,
    reply: Reply,
}

/// Control surface and observer for a running [`Orchestrator`].
#[derive(Clone)]
pub struct WorkflowHandle {
    tx: mpsc::Sender<Envelope>,
    snapshot: watch::Receiver<ExecutionContext>,
}

impl WorkflowHandle {
    async fn send(&self, signal: Signal) -> Result<(), ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { signal, reply })
            .await
            .map_err(|_| ControlError::Closed)?;
        rx.await.map_err(|_| ControlError::Closed)?
    }

    /// Start a new feature. Only valid while idle or after a run has ended.
    pub async fn start(
        &self,
        feature: impl Into<String>,
        images: Vec<PathBuf>,
    ) -> Result<(), ControlError> {
        self.send(Signal::Start {
            feature: feature.into(),
            images,
        })
        .await
    }

    /// Pause the running workflow, interrupting the agent if one is running.
    pub async fn pause(&self) -> Result<(), ControlError> {
        self.send(Signal::Pause).await
    }

    pub async fn resume(&self) -> Result<(), ControlError> {
        self.send(Signal::Resume).await
    }

    /// Stop the run. Returns once any running process has been reaped.
    pub async fn stop(&self) -> Result<(), ControlError> {
        self.send(Signal::Stop).await
    }

    pub async fn answer_question(&self, answer: impl Into<String>) -> Result<(), ControlError> {
        self.send(Signal::Answer(answer.into())).await
    }

    pub async fn respond_to_task_failure(
        &self,
        choice: TaskFailureChoice,
    ) -> Result<(), ControlError> {
        self.send(Signal::TaskFailure(choice)).await
    }

    /// Approve or skip the command held for manual confirmation.
    pub async fn confirm_command(&self, approve: bool) -> Result<(), ControlError> {
        self.send(Signal::Confirm(approve)).await
    }

    pub async fn set_manual_mode(&self, enabled: bool) -> Result<(), ControlError> {
        self.send(Signal::ManualMode(enabled)).await
    }

    /// Return to `idle`. Only valid when no run is in progress.
    pub async fn reset(&self) -> Result<(), ControlError> {
        self.send(Signal::Reset).await
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionContext> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> ExecutionContext {
        self.snapshot.borrow().clone()
    }
}

/// Create a workflow instance.
pub fn workflow(
    settings: WorkflowSettings,
    collaborators: Collaborators,
) -> (Orchestrator, WorkflowHandle) {
    let ctx = ExecutionContext::new(settings.context_window_tokens, settings.handoff_threshold);
    let (tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
    let (snapshot_tx, snapshot) = watch::channel(ctx.clone());

    let orchestrator = Orchestrator {
        plan_store: settings.plan_file.clone().map(PlanStore::new),
        journal: settings.journal_file.clone().map(PhaseJournal::new),
        settings,
        collaborators,
        ctx,
        control_rx,
        snapshot_tx,
        process: ProcessControl::new(),
        pending_delay: None,
        closed: false,
    };
    (orchestrator, WorkflowHandle { tx, snapshot })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Pause,
    Stop,
}

struct Supervised<T> {
    output: T,
    halt: Option<Halt>,
    replies: Vec<Reply>,
}

pub struct Orchestrator {
    settings: WorkflowSettings,
    collaborators: Collaborators,
    ctx: ExecutionContext,
    control_rx: mpsc::Receiver<Envelope>,
    snapshot_tx: watch::Sender<ExecutionContext>,
    plan_store: Option<PlanStore>,
    journal: Option<PhaseJournal>,
    /// Control for the step in flight.
    process: ProcessControl,
    /// Backoff before the next attempt of a failed task.
    pending_delay: Option<Duration>,
    /// All handles are gone.
    closed: bool,
}

impl Orchestrator {
    /// Drive the workflow until every handle has been dropped.
    pub async fn run(mut self) {
        loop {
            if self.closed {
                break;
            }
            if self.ctx.is_runnable() {
                while let Ok(envelope) = self.control_rx.try_recv() {
                    self.handle_signal(envelope);
                }
                if self.ctx.is_runnable() {
                    self.step().await;
                }
            } else {
                match self.control_rx.recv().await {
                    Some(envelope) => self.handle_signal(envelope),
                    None => self.closed = true,
                }
            }
        }
        if !self.ctx.phase.is_terminal() && self.ctx.phase != ExecutionPhase::Idle {
            self.fail_run("Workflow handle dropped");
            self.publish();
        }
        debug!("Orchestrator loop finished");
    }

    fn publish(&mut self) {
        self.ctx.version += 1;
        self.snapshot_tx.send_replace(self.ctx.clone());
    }

    // ── Control signals between steps ───────────────────────────────────

    fn handle_signal(&mut self, envelope: Envelope) {
        let Envelope { signal, reply } = envelope;
        debug!(signal = ?signal, phase = %self.ctx.phase, "Control signal");
        let result = match signal {
            Signal::Start { feature, images } => self.start(feature, images),
            Signal::Pause => self.pause(),
            Signal::Resume => self.resume(),
            Signal::Stop => self.stop(),
            Signal::Answer(answer) => self.answer(answer),
            Signal::TaskFailure(choice) => self.respond_to_task_failure(choice),
            Signal::Confirm(approve) => self.confirm(approve),
            Signal::ManualMode(enabled) => {
                self.set_manual_mode(enabled);
                Ok(())
            }
            Signal::Reset => self.reset(),
        };
        if result.is_ok() {
            self.publish();
        }
        let _ = reply.send(result);
    }

    fn is_in_progress(&self) -> bool {
        self.ctx.phase != ExecutionPhase::Idle && !self.ctx.phase.is_terminal()
    }

    fn start(&mut self, feature: String, images: Vec<PathBuf>) -> Result<(), ControlError> {
        if self.is_in_progress() {
            return Err(ControlError::AlreadyRunning);
        }
        let feature = feature.trim().to_string();
        if feature.is_empty() {
            return Err(ConfigError::EmptyFeatureDescription.into());
        }
        if let Some(missing) = images.iter().find(|p| !p.is_file()) {
            return Err(ConfigError::Invalid(format!("Image not found: {}", missing.display())).into());
        }

        self.ctx.reset_for_new_feature(feature);
        self.ctx.attached_images = images;
        self.ctx.started_at = Some(Utc::now());
        self.pending_delay = None;
        info!(feature = %first_line_snippet(&self.ctx.feature_description, 80), "Starting workflow");
        self.ctx.log(LogKind::Info, "Workflow started");
        self.advance(StepOutcome::Done);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), ControlError> {
        if self.ctx.is_blocked() || self.ctx.phase == ExecutionPhase::WaitingForUser {
            return Err(ControlError::Blocked);
        }
        if !self.ctx.phase.is_active() {
            return Err(ControlError::NotRunning);
        }
        self.pause_if_running();
        Ok(())
    }

    fn pause_if_running(&mut self) {
        if self.ctx.is_runnable() {
            self.ctx.resume_phase = Some(self.ctx.phase);
            self.set_phase(ExecutionPhase::Paused);
        }
    }

    fn resume(&mut self) -> Result<(), ControlError> {
        if self.ctx.phase != ExecutionPhase::Paused {
            return Err(ControlError::NotPaused);
        }
        let Some(phase) = self.ctx.resume_phase.take() else {
            return Err(ControlError::NotPaused);
        };
        self.ctx.log(LogKind::Info, "Resumed");
        self.set_phase(phase);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ControlError> {
        if !self.is_in_progress() {
            return Err(ControlError::NotRunning);
        }
        self.stop_run();
        Ok(())
    }

    fn answer(&mut self, answer: String) -> Result<(), ControlError> {
        if self.ctx.phase != ExecutionPhase::WaitingForUser
            || self.ctx.pending_question().is_none()
        {
            return Err(ControlError::NotWaitingForAnswer);
        }
        let Some(Blocker::Question(pending)) = self.ctx.take_blocker() else {
            return Err(ControlError::NotWaitingForAnswer);
        };

        let question = pending
            .questions
            .iter()
            .map(|q| q.question.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.ctx.log(
            LogKind::Info,
            format!("Answered: {}", first_line_snippet(&answer, 80)),
        );
        self.ctx.qa_history.push(QaPair {
            question,
            answer,
            auto: false,
            delivered: false,
        });
        self.ctx.resume_phase = None;
        self.set_phase(pending.raised_in);
        Ok(())
    }

    fn respond_to_task_failure(&mut self, choice: TaskFailureChoice) -> Result<(), ControlError> {
        if self.ctx.pending_task_failure().is_none() {
            return Err(ControlError::NoPendingTaskFailure);
        }
        let Some(Blocker::TaskFailure(failure)) = self.ctx.take_blocker() else {
            return Err(ControlError::NoPendingTaskFailure);
        };
        self.ctx.log(
            LogKind::Info,
            format!("Task failure on {}: {}", failure.task_id, choice),
        );
        match choice {
            TaskFailureChoice::Retry => {}
            TaskFailureChoice::Skip if failure.task_id != PLANNING_TASK_ID => self.skip_task(),
            TaskFailureChoice::Skip | TaskFailureChoice::Stop => {
                self.fail_run(format!("Stopped after failure: {}", failure.error));
            }
        }
        Ok(())
    }

    fn confirm(&mut self, approve: bool) -> Result<(), ControlError> {
        if self.ctx.pending_confirmation().is_none() {
            return Err(ControlError::NoPendingConfirmation);
        }
        if let Some(Blocker::Confirmation(pending)) = self.ctx.take_blocker() {
            let verb = if approve { "Approved" } else { "Skipped" };
            self.ctx
                .log(LogKind::Command, format!("{}: {}", verb, pending.command));
        }
        self.ctx.command_decision = Some(approve);
        Ok(())
    }

    fn set_manual_mode(&mut self, enabled: bool) {
        self.ctx.fallback.set_manual_mode(enabled);
        let state = if enabled { "enabled" } else { "disabled" };
        self.ctx.log(LogKind::Info, format!("Manual mode {}", state));
        if !enabled && self.ctx.pending_confirmation().is_some() {
            self.ctx.take_blocker();
        }
    }

    fn reset(&mut self) -> Result<(), ControlError> {
        if self.is_in_progress() {
            return Err(ControlError::AlreadyRunning);
        }
        self.ctx.reset();
        self.pending_delay = None;
        self.record_journal("reset");
        Ok(())
    }

    // ── Phase bookkeeping ───────────────────────────────────────────────

    /// Id of the task being worked on, `None` while planning.
    fn current_task_id(&self) -> Option<String> {
        self.ctx
            .current_task()
            .filter(|t| self.ctx.phase.is_task_phase() || t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
    }

    fn record_journal(&self, status: &str) {
        if let Some(journal) = &self.journal
            && let Err(e) = journal.record(self.ctx.phase, self.current_task_id().as_deref(), status)
        {
            warn!(error = %e, "Failed to write phase journal");
        }
    }

    fn set_phase(&mut self, next: ExecutionPhase) {
        let from = self.ctx.phase;
        if !machine::is_legal(from, next) {
            warn!(from = %from, to = %next, "Unexpected phase transition");
        }
        if from != next {
            self.ctx.auto_answers_in_phase = 0;
        }
        self.ctx.phase = next;
        info!(phase = %next, task = ?self.current_task_id(), "Phase transition");
        self.ctx.log(LogKind::Phase, next.label());
        self.record_journal("entered");
    }

    fn transition_inputs(&self) -> TransitionInputs {
        let autonomous = &self.settings.autonomous;
        TransitionInputs {
            has_more_tasks: self
                .ctx
                .plan
                .as_ref()
                .and_then(|p| p.next_pending_after(self.ctx.current_task_index))
                .is_some(),
            build_attempts: self.ctx.build_attempts,
            test_attempts: self.ctx.test_attempts,
            max_build_fix_attempts: autonomous.max_build_fix_attempts,
            max_test_fix_attempts: autonomous.max_test_fix_attempts,
            run_build_after_commit: autonomous.run_build_after_commit,
            run_tests_after_commit: autonomous.run_tests_after_commit,
        }
    }

    fn advance(&mut self, outcome: StepOutcome) {
        let phase = self.ctx.phase;
        match machine::next_phase(phase, outcome, &self.transition_inputs()) {
            Transition::To(next) => {
                match next {
                    ExecutionPhase::FixingBuildErrors => self.ctx.build_attempts += 1,
                    ExecutionPhase::FixingTestErrors => self.ctx.test_attempts += 1,
                    ExecutionPhase::ExecutingTask if phase == ExecutionPhase::RewritingPlan => {
                        self.ctx.current_task_index = self
                            .ctx
                            .plan
                            .as_ref()
                            .and_then(Plan::first_pending)
                            .unwrap_or(0);
                    }
                    ExecutionPhase::ExecutingTask if phase == ExecutionPhase::ClearingContext => {
                        if let Some(next_index) = self
                            .ctx
                            .plan
                            .as_ref()
                            .and_then(|p| p.next_pending_after(self.ctx.current_task_index))
                        {
                            self.ctx.current_task_index = next_index;
                        }
                    }
                    _ => {}
                }
                self.set_phase(next);
                if next == ExecutionPhase::Completed {
                    self.finish();
                }
            }
            Transition::Fail(message) => self.fail_run(message),
            Transition::Stay => {}
        }
    }

    fn finish(&mut self) {
        self.ctx.finished_at = Some(Utc::now());
        let summary = self.ctx.budget.status_summary();
        info!(summary = %summary, "Workflow completed");
        self.ctx.log(LogKind::Info, format!("Feature complete. {}", summary));
    }

    /// Reset per-task state before the next task starts.
    fn clear_task_state(&mut self) {
        self.ctx.session_id = None;
        self.ctx.budget.start_new_session();
        self.ctx.build_attempts = 0;
        self.ctx.test_attempts = 0;
        self.ctx.last_build_result = None;
        self.ctx.last_test_result = None;
        self.ctx.review_notes = None;
        self.ctx.test_plan = None;
        self.ctx.commit_message = None;
        self.ctx.command_decision = None;
        self.ctx.continuation = None;
        self.ctx.task_base_commit = None;
        self.ctx.handoff_return = None;
        self.ctx.retry_attempt = 0;
        self.ctx.task_failure_count = 0;
        self.pending_delay = None;
    }

    fn set_task_status(&mut self, status: TaskStatus) {
        if let Some(task) = self.ctx.current_task_mut() {
            task.status = status;
        }
    }

    fn fail_run(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(phase = %self.ctx.phase, error = %message, "Workflow failed");
        self.ctx.record_error(message, false);
        if let Some(task) = self.ctx.current_task_mut()
            && task.status == TaskStatus::InProgress
        {
            task.status = TaskStatus::Failed;
        }
        self.ctx.take_blocker();
        self.ctx.resume_phase = None;
        self.pending_delay = None;
        self.set_phase(ExecutionPhase::Failed);
        self.ctx.finished_at = Some(Utc::now());
    }

    fn stop_run(&mut self) {
        self.fail_run("Stopped by user");
    }

    fn skip_task(&mut self) {
        if let Some(task) = self.ctx.current_task() {
            let message = format!("Skipping {}: {}", task.id, task.title);
            warn!(task = %task.id, "Skipping task");
            self.ctx.log(LogKind::Warning, message);
        }
        self.set_task_status(TaskStatus::Skipped);
        self.clear_task_state();

        let next = self
            .ctx
            .plan
            .as_ref()
            .and_then(|p| p.next_pending_after(self.ctx.current_task_index));
        match next {
            Some(index) => {
                self.ctx.current_task_index = index;
                self.set_phase(ExecutionPhase::ExecutingTask);
            }
            None => {
                self.set_phase(ExecutionPhase::Completed);
                self.finish();
            }
        }
    }

    fn handle_task_failure(&mut self, error: String) {
        self.ctx.record_error(error.clone(), true);
        self.ctx.task_failure_count += 1;
        let (task_id, task_title) = match self.ctx.current_task() {
            Some(task) if self.ctx.phase.is_task_phase() => (task.id.clone(), task.title.clone()),
            _ => (PLANNING_TASK_ID.to_string(), "Planning".to_string()),
        };

        let decision = decide_task_failure(
            &self.settings.autonomous,
            &self.settings.retry,
            self.ctx.retry_attempt,
        );
        warn!(task = %task_id, decision = ?decision, error = %error, "Task failed");
        match decision {
            TaskFailureDecision::Retry { attempt, delay } => {
                self.ctx.retry_attempt = attempt;
                self.pending_delay = Some(delay);
                self.ctx.log(
                    LogKind::Warning,
                    format!(
                        "Retrying {} (attempt {}) in {:.1}s",
                        task_id,
                        attempt,
                        delay.as_secs_f64()
                    ),
                );
            }
            TaskFailureDecision::Skip if task_id != PLANNING_TASK_ID => self.skip_task(),
            TaskFailureDecision::Skip | TaskFailureDecision::Stop => {
                self.fail_run(format!("{} failed: {}", task_id, error));
            }
            TaskFailureDecision::AskUser => {
                self.ctx.set_blocker(Blocker::TaskFailure(PendingTaskFailure {
                    task_id,
                    task_title,
                    error,
                }));
                self.record_journal("task failure pending");
            }
        }
    }

    fn record_command_failure(&mut self, failure: CommandFailure) {
        if self
            .ctx
            .fallback
            .record_command_failure(&self.settings.autonomous, failure)
        {
            let reason = self
                .ctx
                .fallback
                .reason
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_default();
            self.ctx.log(
                LogKind::Warning,
                format!("Switching to manual command confirmation: {}", reason),
            );
        }
    }

    /// Whether a held command may run now. Raises a confirmation blocker
    /// when manual mode needs one; `Some(false)` means the user skipped it.
    fn command_permitted(&mut self, step: ConfirmationStep, command: String) -> Option<bool> {
        if let Some(decision) = self.ctx.command_decision.take() {
            return Some(decision);
        }
        if self.ctx.fallback.requires_manual() {
            self.ctx.log(
                LogKind::Command,
                format!("Waiting for confirmation to {}: {}", step, command),
            );
            self.ctx
                .set_blocker(Blocker::Confirmation(PendingConfirmation { step, command }));
            return None;
        }
        Some(true)
    }

    // ── Steps ───────────────────────────────────────────────────────────

    /// Drive `work` to completion while listening for control signals.
    async fn supervise<T, F>(&mut self, work: F) -> Supervised<T>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(work);
        let mut halt = None;
        let mut replies = Vec::new();
        loop {
            tokio::select! {
                biased;
                output = &mut work => return Supervised { output, halt, replies },
                envelope = self.control_rx.recv(), if !self.closed => match envelope {
                    Some(Envelope { signal: Signal::Pause, reply }) => {
                        if halt.is_none() {
                            halt = Some(Halt::Pause);
                            self.process.interrupt();
                        }
                        replies.push(reply);
                    }
                    Some(Envelope { signal: Signal::Stop, reply }) => {
                        halt = Some(Halt::Stop);
                        self.process.terminate();
                        replies.push(reply);
                    }
                    Some(Envelope { signal: Signal::ManualMode(enabled), reply }) => {
                        self.set_manual_mode(enabled);
                        self.publish();
                        let _ = reply.send(Ok(()));
                    }
                    Some(Envelope { reply, .. }) => {
                        let _ = reply.send(Err(ControlError::Busy));
                    }
                    None => {
                        self.closed = true;
                        halt = Some(Halt::Stop);
                        self.process.terminate();
                    }
                },
            }
        }
    }

    /// Resolve a halt against a step's output. Returns the output when it
    /// should still be applied.
    fn take_unhalted<T, E>(&mut self, output: Result<T, E>, halt: Option<Halt>) -> Option<Result<T, E>> {
        match (halt, output) {
            (None, output) => Some(output),
            (Some(Halt::Stop), _) => {
                self.stop_run();
                None
            }
            (Some(Halt::Pause), Ok(value)) => Some(Ok(value)),
            (Some(Halt::Pause), Err(_)) => None,
        }
    }

    fn finish_halt(&mut self, halt: Option<Halt>, replies: Vec<Reply>) {
        if halt == Some(Halt::Pause) {
            self.pause_if_running();
        }
        if !replies.is_empty() {
            self.publish();
        }
        for reply in replies {
            let _ = reply.send(Ok(()));
        }
    }

    async fn step(&mut self) {
        self.process = ProcessControl::new();

        if let Some(delay) = self.pending_delay.take() {
            let token = self.process.token();
            let supervised = self
                .supervise(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => Ok(()),
                        _ = token.cancelled() => Err(()),
                    }
                })
                .await;
            let halted = supervised.halt.is_some();
            let _ = self.take_unhalted(supervised.output, supervised.halt);
            self.finish_halt(supervised.halt, supervised.replies);
            if halted {
                self.publish();
                return;
            }
        }

        let phase = self.ctx.phase;
        match phase {
            ExecutionPhase::HandlingContextExhaustion => self.step_handoff().await,
            ExecutionPhase::RunningBuild => self.step_command(CommandKind::Build).await,
            ExecutionPhase::RunningTests => self.step_command(CommandKind::Test).await,
            ExecutionPhase::ClearingContext => self.step_clearing(),
            p if p.is_commit() && self.ctx.commit_message.is_some() => self.step_commit().await,
            p if p.is_agent_phase() => self.step_agent(p).await,
            other => warn!(phase = %other, "No step for phase"),
        }
        self.publish();
    }

    fn agent_request(&self, phase: ExecutionPhase) -> AgentRequest {
        let label = format!(
            "{}-{}",
            phase,
            self.current_task_id()
                .unwrap_or_else(|| PLANNING_TASK_ID.to_string())
        );
        let resume_session = self.ctx.session_id.clone();
        // A fresh session needs the images again.
        let images = if resume_session.is_none() {
            self.ctx.attached_images.clone()
        } else {
            Vec::new()
        };
        AgentRequest {
            prompt: build_prompt(&self.ctx, phase),
            permission: phase.permission(),
            resume_session,
            timeout: self.settings.timeouts.for_phase(phase),
            images,
            working_dir: self.settings.project_dir.clone(),
            label,
        }
    }

    async fn run_agent(
        &mut self,
        request: AgentRequest,
    ) -> Supervised<Result<AgentTurn, AgentError>> {
        let agent = Arc::clone(&self.collaborators.agent);
        let control = self.process.clone();
        self.supervise(async move { agent.run_turn(&request, &control).await })
            .await
    }

    async fn step_agent(&mut self, phase: ExecutionPhase) {
        if self.ctx.session_id.is_some() && self.ctx.budget.needs_handoff() {
            info!(phase = %phase, summary = %self.ctx.budget.status_summary(), "Context nearly exhausted, handing off");
            self.ctx.log(
                LogKind::Warning,
                format!("Context nearly exhausted. {}", self.ctx.budget.status_summary()),
            );
            self.ctx.handoff_return = Some(phase);
            self.set_phase(ExecutionPhase::HandlingContextExhaustion);
            return;
        }

        if phase == ExecutionPhase::ExecutingTask
            && self.ctx.current_task().map(|t| t.status) == Some(TaskStatus::Pending)
        {
            self.set_task_status(TaskStatus::InProgress);
            self.ctx.task_base_commit = self.collaborators.vcs.head(&self.settings.project_dir);
            self.record_journal("task started");
        }

        let request = self.agent_request(phase);
        let supervised = self.run_agent(request).await;
        if let Some(output) = self.take_unhalted(supervised.output, supervised.halt) {
            self.apply_agent_result(phase, output);
        }
        self.finish_halt(supervised.halt, supervised.replies);
    }

    fn apply_agent_result(&mut self, phase: ExecutionPhase, result: Result<AgentTurn, AgentError>) {
        let mut turn = match result {
            Ok(turn) => turn,
            Err(e) if e.is_configuration() || matches!(e, AgentError::Payload(_)) => {
                self.fail_run(e.to_string());
                return;
            }
            Err(e) => {
                self.handle_task_failure(e.to_string());
                return;
            }
        };

        self.ctx.budget.record_turn(&turn.usage, turn.cost_usd);
        if let Some(session) = &turn.session_id {
            self.ctx.session_id = Some(session.clone());
        }
        for tool in &turn.tools_used {
            self.ctx.log(LogKind::Tool, tool.clone());
        }

        if let Some(raised) = turn.question.take() {
            let autonomous = &self.settings.autonomous;
            if autonomous.auto_answer_enabled
                && self.ctx.auto_answers_in_phase < MAX_AUTO_ANSWERS_PER_PHASE
            {
                self.ctx.auto_answers_in_phase += 1;
                for question in &raised.questions {
                    let answer = question
                        .options
                        .first()
                        .map(|o| o.label.clone())
                        .unwrap_or_else(|| "Use your best judgement.".to_string());
                    self.ctx.log(
                        LogKind::Info,
                        format!("Auto-answered \"{}\" with \"{}\"", question.question, answer),
                    );
                    self.ctx.qa_history.push(QaPair {
                        question: question.question.clone(),
                        answer,
                        auto: true,
                        delivered: false,
                    });
                }
                return;
            }

            self.ctx.log(
                LogKind::Agent,
                format!(
                    "Question: {}",
                    raised
                        .questions
                        .first()
                        .map(|q| q.question.as_str())
                        .unwrap_or("")
                ),
            );
            self.ctx.set_blocker(Blocker::Question(PendingQuestion {
                tool_use_id: raised.tool_use_id,
                questions: raised.questions,
                raised_in: phase,
            }));
            self.ctx.resume_phase = Some(phase);
            self.set_phase(ExecutionPhase::WaitingForUser);
            return;
        }

        if !turn.succeeded() {
            let detail = first_line_snippet(turn.output(), 200);
            let message = if detail.is_empty() {
                "Agent reported an error".to_string()
            } else {
                format!("Agent reported an error: {}", detail)
            };
            self.handle_task_failure(message);
            return;
        }

        self.ctx.mark_answers_delivered();
        self.ctx.continuation = None;
        let snippet = first_line_snippet(turn.output(), 120);
        if !snippet.is_empty() {
            self.ctx.log(LogKind::Agent, snippet);
        }

        match phase {
            ExecutionPhase::GeneratingInitialPlan | ExecutionPhase::RewritingPlan => {
                let text = turn.plan_text.as_deref().unwrap_or(turn.output());
                let plan = Plan::parse(text);
                if plan.is_empty() {
                    if phase == ExecutionPhase::RewritingPlan && self.ctx.plan.is_some() {
                        self.ctx.log(
                            LogKind::Warning,
                            "Revised plan had no tasks; keeping the initial plan",
                        );
                    } else {
                        self.handle_task_failure("Agent produced no parseable tasks".to_string());
                        return;
                    }
                } else {
                    self.ctx.log(
                        LogKind::Info,
                        format!("Plan has {} tasks", plan.tasks.len()),
                    );
                    if let Some(store) = &self.plan_store
                        && let Err(e) = store.save(&plan)
                    {
                        warn!(error = %e, "Failed to save plan");
                    }
                    self.ctx.plan = Some(plan);
                }
                self.advance(StepOutcome::Done);
            }
            ExecutionPhase::ReviewingCode => {
                self.ctx.review_notes = Some(turn.output().to_string());
                self.advance(StepOutcome::Done);
            }
            ExecutionPhase::WritingTests => {
                self.ctx.test_plan = Some(turn.output().to_string());
                self.advance(StepOutcome::Done);
            }
            p if p.is_commit() => {
                let message = extract_commit_message(turn.output())
                    .unwrap_or_else(|| default_commit_message(p, self.ctx.current_task()));
                self.ctx.commit_message = Some(message);
            }
            _ => self.advance(StepOutcome::Done),
        }
        // Accepted output clears the retry budget.
        self.ctx.retry_attempt = 0;
    }

    async fn step_commit(&mut self) {
        let Some(message) = self.ctx.commit_message.clone() else {
            return;
        };
        let subject = message.lines().next().unwrap_or("").to_string();
        match self.command_permitted(
            ConfirmationStep::Commit,
            format!("git commit -m \"{}\"", subject),
        ) {
            None => return,
            Some(false) => {
                self.ctx.commit_message = None;
                self.advance(StepOutcome::Done);
                return;
            }
            Some(true) => {}
        }

        let vcs = Arc::clone(&self.collaborators.vcs);
        let dir = self.settings.project_dir.clone();
        let timeout = self.settings.timeouts.commit;
        let cancel = self.process.token();
        let supervised = self
            .supervise(async move { vcs.commit_all(&message, &dir, timeout, &cancel).await })
            .await;
        if let Some(output) = self.take_unhalted(supervised.output, supervised.halt) {
            self.apply_commit_result(output);
        }
        self.finish_halt(supervised.halt, supervised.replies);
    }

    fn apply_commit_result(&mut self, result: Result<CommitOutcome, CommandError>) {
        match result {
            Ok(CommitOutcome::Committed(_)) => {
                self.ctx.fallback.record_command_success();
                let subject = self
                    .ctx
                    .commit_message
                    .as_deref()
                    .and_then(|m| m.lines().next())
                    .unwrap_or("")
                    .to_string();
                self.ctx.log(LogKind::Command, format!("Committed: {}", subject));
            }
            Ok(CommitOutcome::NoChanges) => {
                self.ctx.fallback.record_command_success();
                self.ctx.log(LogKind::Command, "Nothing to commit");
            }
            Err(e) => {
                let failure = if e.is_timeout() {
                    CommandFailure::Timeout
                } else {
                    CommandFailure::Failed(e.to_string())
                };
                self.ctx.record_error(format!("Commit failed: {}", e), true);
                self.record_command_failure(failure);
            }
        }
        self.ctx.commit_message = None;
        self.advance(StepOutcome::Done);
    }

    async fn step_command(&mut self, kind: CommandKind) {
        let dir = self.settings.project_dir.clone();
        let Some(command) = self
            .collaborators
            .builder
            .resolve(kind, &dir, &self.settings.build)
        else {
            self.ctx.log(
                LogKind::Command,
                format!("No build system detected; skipping {}", kind),
            );
            self.advance(StepOutcome::Passed);
            return;
        };
        match self.command_permitted(kind.into(), command.clone()) {
            None => return,
            Some(false) => {
                self.advance(StepOutcome::Passed);
                return;
            }
            Some(true) => {}
        }

        self.ctx
            .log(LogKind::Command, format!("Running {}: {}", kind, command));
        let builder = Arc::clone(&self.collaborators.builder);
        let config = self.settings.build.clone();
        let timeout = self.settings.timeouts.command;
        let cancel = self.process.token();
        let supervised = self
            .supervise(async move { builder.run(kind, &dir, &config, timeout, &cancel).await })
            .await;
        if let Some(output) = self.take_unhalted(supervised.output, supervised.halt) {
            self.apply_command_result(kind, output);
        }
        self.finish_halt(supervised.halt, supervised.replies);
    }

    fn apply_command_result(
        &mut self,
        kind: CommandKind,
        result: Result<CommandResult, CommandError>,
    ) {
        let result = match result {
            Ok(result) => result,
            Err(CommandError::NoBuildSystem { .. }) => {
                self.ctx.log(
                    LogKind::Command,
                    format!("No build system detected; skipping {}", kind),
                );
                self.advance(StepOutcome::Passed);
                return;
            }
            Err(e) => {
                let failure = if e.is_timeout() {
                    CommandFailure::Timeout
                } else {
                    CommandFailure::Failed(e.to_string())
                };
                self.record_command_failure(failure);
                CommandResult {
                    success: false,
                    output: String::new(),
                    error_output: Some(e.to_string()),
                    exit_code: -1,
                    duration: Duration::ZERO,
                }
            }
        };

        let passed = result.success;
        if passed {
            self.ctx.fallback.record_command_success();
            self.ctx.log(
                LogKind::Command,
                format!("{} passed in {:.1}s", kind, result.duration.as_secs_f64()),
            );
        } else {
            if result.exit_code != -1 {
                self.record_command_failure(CommandFailure::Failed(format!(
                    "{} exited with code {}",
                    kind, result.exit_code
                )));
            }
            self.ctx.record_error(
                format!("{} failed (exit code {})", kind, result.exit_code),
                true,
            );
        }
        match kind {
            CommandKind::Build => self.ctx.last_build_result = Some(result),
            CommandKind::Test => self.ctx.last_test_result = Some(result),
        }
        self.advance(if passed {
            StepOutcome::Passed
        } else {
            StepOutcome::Failed
        });
    }

    fn step_clearing(&mut self) {
        if let Some(task) = self.ctx.current_task() {
            let message = format!("Completed {}: {}", task.id, task.title);
            info!(task = %task.id, "Task completed");
            self.ctx.log(LogKind::Info, message);
        }
        self.set_task_status(TaskStatus::Completed);
        self.record_journal("task completed");
        self.clear_task_state();
        self.advance(StepOutcome::Done);
    }

    async fn step_handoff(&mut self) {
        let return_to = self
            .ctx
            .handoff_return
            .unwrap_or(ExecutionPhase::ExecutingTask);
        let request = self.agent_request(ExecutionPhase::HandlingContextExhaustion);
        let supervised = self.run_agent(request).await;
        let Some(result) = self.take_unhalted(supervised.output, supervised.halt) else {
            self.finish_halt(supervised.halt, supervised.replies);
            return;
        };

        let report = match result {
            Ok(turn) => {
                self.ctx.budget.record_turn(&turn.usage, turn.cost_usd);
                turn.output().to_string()
            }
            Err(e) if e.is_configuration() => {
                self.fail_run(e.to_string());
                self.finish_halt(supervised.halt, supervised.replies);
                return;
            }
            Err(e) => {
                warn!(error = %e, "Handoff report failed; continuing with a minimal summary");
                self.ctx
                    .record_error(format!("Handoff report failed: {}", e), true);
                String::new()
            }
        };

        let changed = self
            .collaborators
            .vcs
            .changed_files(&self.settings.project_dir, self.ctx.task_base_commit.as_deref())
            .unwrap_or_else(|e| {
                debug!(error = %e, "Could not list changed files");
                Vec::new()
            });
        let (task_id, task_title) = self
            .ctx
            .current_task()
            .map(|t| (t.id.clone(), t.title.clone()))
            .unwrap_or_else(|| (PLANNING_TASK_ID.to_string(), "Planning".to_string()));
        let summary = build_continuation(&task_id, &task_title, &report, changed, Utc::now());

        self.ctx.continuation = Some(summary);
        self.ctx.session_id = None;
        self.ctx.budget.record_handoff();
        self.ctx.handoff_return = None;
        self.ctx.log(LogKind::Info, "Handed off to a fresh session");
        self.set_phase(return_to);
        self.finish_halt(supervised.halt, supervised.replies);
    }
}
