//! Execution phases of a feature workflow.
//!
//! This module provides:
//! - `ExecutionPhase`, the step the orchestrator is currently on
//! - `PermissionLevel`, what the agent may do during a phase
//! - `TimeoutConfig`, per-phase-class time limits

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A step of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionPhase {
    #[default]
    Idle,
    GeneratingInitialPlan,
    RewritingPlan,
    ExecutingTask,
    CommittingImplementation,
    ReviewingCode,
    CommittingReview,
    WritingTests,
    CommittingTests,
    RunningBuild,
    FixingBuildErrors,
    RunningTests,
    FixingTestErrors,
    ClearingContext,
    HandlingContextExhaustion,
    WaitingForUser,
    Paused,
    Completed,
    Failed,
}

/// What the agent is allowed to do while a phase runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionLevel {
    /// No agent is involved.
    None,
    /// Read-only analysis.
    Plan,
    /// May edit files and run commands.
    Edit,
}

impl PermissionLevel {
    /// Value for the agent CLI's `--permission-mode` flag.
    pub fn cli_mode(&self) -> Option<&'static str> {
        match self {
            PermissionLevel::None => None,
            PermissionLevel::Plan => Some("plan"),
            PermissionLevel::Edit => Some("acceptEdits"),
        }
    }
}

/// Which configured timeout applies to a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Plan,
    Execution,
    Commit,
    Command,
}

impl ExecutionPhase {
    pub const ALL: [ExecutionPhase; 19] = [
        ExecutionPhase::Idle,
        ExecutionPhase::GeneratingInitialPlan,
        ExecutionPhase::RewritingPlan,
        ExecutionPhase::ExecutingTask,
        ExecutionPhase::CommittingImplementation,
        ExecutionPhase::ReviewingCode,
        ExecutionPhase::CommittingReview,
        ExecutionPhase::WritingTests,
        ExecutionPhase::CommittingTests,
        ExecutionPhase::RunningBuild,
        ExecutionPhase::FixingBuildErrors,
        ExecutionPhase::RunningTests,
        ExecutionPhase::FixingTestErrors,
        ExecutionPhase::ClearingContext,
        ExecutionPhase::HandlingContextExhaustion,
        ExecutionPhase::WaitingForUser,
        ExecutionPhase::Paused,
        ExecutionPhase::Completed,
        ExecutionPhase::Failed,
    ];

    /// Agent permission required by this phase.
    ///
    /// Analysis, review, and test design run read-only; the commit phase that
    /// follows each of them applies the result with edit permission.
    pub fn permission(&self) -> PermissionLevel {
        use ExecutionPhase::*;
        match self {
            GeneratingInitialPlan | RewritingPlan | ReviewingCode | WritingTests
            | HandlingContextExhaustion => PermissionLevel::Plan,
            ExecutingTask | CommittingImplementation | CommittingReview | CommittingTests
            | FixingBuildErrors | FixingTestErrors => PermissionLevel::Edit,
            Idle | RunningBuild | RunningTests | ClearingContext | WaitingForUser | Paused
            | Completed | Failed => PermissionLevel::None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionPhase::Completed | ExecutionPhase::Failed)
    }

    /// Phases that invoke the agent.
    pub fn is_agent_phase(&self) -> bool {
        self.permission() != PermissionLevel::None
    }

    /// Phases that end with a version-control commit.
    pub fn is_commit(&self) -> bool {
        matches!(
            self,
            ExecutionPhase::CommittingImplementation
                | ExecutionPhase::CommittingReview
                | ExecutionPhase::CommittingTests
        )
    }

    /// Phases where the loop makes progress on its own.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            ExecutionPhase::Idle
                | ExecutionPhase::WaitingForUser
                | ExecutionPhase::Paused
                | ExecutionPhase::Completed
                | ExecutionPhase::Failed
        )
    }

    /// Phases that belong to a single task (as opposed to planning).
    pub fn is_task_phase(&self) -> bool {
        use ExecutionPhase::*;
        matches!(
            self,
            ExecutingTask
                | CommittingImplementation
                | ReviewingCode
                | CommittingReview
                | WritingTests
                | CommittingTests
                | RunningBuild
                | FixingBuildErrors
                | RunningTests
                | FixingTestErrors
                | ClearingContext
        )
    }

    pub fn timeout_class(&self) -> TimeoutClass {
        use ExecutionPhase::*;
        match self {
            RunningBuild | RunningTests => TimeoutClass::Command,
            CommittingImplementation | CommittingReview | CommittingTests => TimeoutClass::Commit,
            _ if self.permission() == PermissionLevel::Plan => TimeoutClass::Plan,
            _ => TimeoutClass::Execution,
        }
    }

    /// How far through a single task this phase is, in `0.0..=1.0`.
    /// Used only for progress display.
    pub fn progress_weight(&self) -> f64 {
        use ExecutionPhase::*;
        match self {
            ExecutingTask => 0.1,
            CommittingImplementation => 0.3,
            RunningBuild => 0.35,
            FixingBuildErrors => 0.4,
            ReviewingCode => 0.5,
            CommittingReview => 0.6,
            WritingTests => 0.7,
            CommittingTests => 0.8,
            RunningTests => 0.85,
            FixingTestErrors => 0.9,
            ClearingContext => 1.0,
            Completed => 1.0,
            _ => 0.0,
        }
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        use ExecutionPhase::*;
        match self {
            Idle => "Idle",
            GeneratingInitialPlan => "Generating plan",
            RewritingPlan => "Refining plan",
            ExecutingTask => "Implementing task",
            CommittingImplementation => "Committing implementation",
            ReviewingCode => "Reviewing code",
            CommittingReview => "Applying review",
            WritingTests => "Designing tests",
            CommittingTests => "Writing tests",
            RunningBuild => "Running build",
            FixingBuildErrors => "Fixing build errors",
            RunningTests => "Running tests",
            FixingTestErrors => "Fixing test failures",
            ClearingContext => "Clearing context",
            HandlingContextExhaustion => "Handing off session",
            WaitingForUser => "Waiting for user",
            Paused => "Paused",
            Completed => "Completed",
            Failed => "Failed",
        }
    }

    /// Stable identifier, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        use ExecutionPhase::*;
        match self {
            Idle => "idle",
            GeneratingInitialPlan => "generatingInitialPlan",
            RewritingPlan => "rewritingPlan",
            ExecutingTask => "executingTask",
            CommittingImplementation => "committingImplementation",
            ReviewingCode => "reviewingCode",
            CommittingReview => "committingReview",
            WritingTests => "writingTests",
            CommittingTests => "committingTests",
            RunningBuild => "runningBuild",
            FixingBuildErrors => "fixingBuildErrors",
            RunningTests => "runningTests",
            FixingTestErrors => "fixingTestErrors",
            ClearingContext => "clearingContext",
            HandlingContextExhaustion => "handlingContextExhaustion",
            WaitingForUser => "waitingForUser",
            Paused => "paused",
            Completed => "completed",
            Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExecutionPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionPhase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown phase: '{}'", s))
    }
}

/// Time limits per phase class.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutConfig {
    pub plan_mode: Duration,
    pub execution: Duration,
    pub commit: Duration,
    pub command: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            plan_mode: Duration::from_secs(600),
            execution: Duration::from_secs(1800),
            commit: Duration::from_secs(300),
            command: Duration::from_secs(900),
        }
    }
}

impl TimeoutConfig {
    pub fn for_phase(&self, phase: ExecutionPhase) -> Duration {
        match phase.timeout_class() {
            TimeoutClass::Plan => self.plan_mode,
            TimeoutClass::Execution => self.execution,
            TimeoutClass::Commit => self.commit,
            TimeoutClass::Command => self.command,
        }
    }
}
