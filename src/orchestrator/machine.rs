//! Phase transition table.
//!
//! Pure functions over phases. The engine feeds in how a step ended and the
//! counters that matter, and gets back where to go next.

use crate::phase::ExecutionPhase;

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Agent or commit step finished.
    Done,
    /// Build or test command succeeded (or had nothing to run).
    Passed,
    /// Build or test command failed.
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionInputs {
    pub has_more_tasks: bool,
    pub build_attempts: u32,
    pub test_attempts: u32,
    pub max_build_fix_attempts: u32,
    pub max_test_fix_attempts: u32,
    pub run_build_after_commit: bool,
    pub run_tests_after_commit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    To(ExecutionPhase),
    /// The run cannot continue.
    Fail(String),
    /// Not a table-driven phase.
    Stay,
}

pub fn next_phase(
    phase: ExecutionPhase,
    outcome: StepOutcome,
    inputs: &TransitionInputs,
) -> Transition {
    use ExecutionPhase::*;

    let to = Transition::To;
    match (phase, outcome) {
        (Idle, _) => to(GeneratingInitialPlan),
        (GeneratingInitialPlan, _) => to(RewritingPlan),
        (RewritingPlan, _) => to(ExecutingTask),
        (ExecutingTask, _) => to(CommittingImplementation),
        (CommittingImplementation, _) if inputs.run_build_after_commit => to(RunningBuild),
        (CommittingImplementation, _) => to(ReviewingCode),
        (RunningBuild, StepOutcome::Failed) => {
            if inputs.build_attempts < inputs.max_build_fix_attempts {
                to(FixingBuildErrors)
            } else {
                Transition::Fail(format!(
                    "Build still failing after {} fix attempts",
                    inputs.build_attempts
                ))
            }
        }
        (RunningBuild, _) => to(ReviewingCode),
        (FixingBuildErrors, _) => to(RunningBuild),
        (ReviewingCode, _) => to(CommittingReview),
        (CommittingReview, _) => to(WritingTests),
        (WritingTests, _) => to(CommittingTests),
        (CommittingTests, _) if inputs.run_tests_after_commit => to(RunningTests),
        (CommittingTests, _) => to(ClearingContext),
        (RunningTests, StepOutcome::Failed) => {
            if inputs.test_attempts < inputs.max_test_fix_attempts {
                to(FixingTestErrors)
            } else {
                Transition::Fail(format!(
                    "Tests still failing after {} fix attempts",
                    inputs.test_attempts
                ))
            }
        }
        (RunningTests, _) => to(ClearingContext),
        (FixingTestErrors, _) => to(RunningTests),
        (ClearingContext, _) if inputs.has_more_tasks => to(ExecutingTask),
        (ClearingContext, _) => to(Completed),
        (HandlingContextExhaustion | WaitingForUser | Paused | Completed | Failed, _) => {
            Transition::Stay
        }
    }
}

/// Phases reachable from `from` along the table.
fn successors(from: ExecutionPhase) -> &'static [ExecutionPhase] {
    use ExecutionPhase::*;

    match from {
        Idle => &[GeneratingInitialPlan],
        GeneratingInitialPlan => &[RewritingPlan],
        RewritingPlan => &[ExecutingTask],
        ExecutingTask => &[CommittingImplementation],
        CommittingImplementation => &[RunningBuild, ReviewingCode],
        RunningBuild => &[ReviewingCode, FixingBuildErrors],
        FixingBuildErrors => &[RunningBuild],
        ReviewingCode => &[CommittingReview],
        CommittingReview => &[WritingTests],
        WritingTests => &[CommittingTests],
        CommittingTests => &[RunningTests, ClearingContext],
        RunningTests => &[ClearingContext, FixingTestErrors],
        FixingTestErrors => &[RunningTests],
        ClearingContext => &[ExecutingTask, Completed],
        HandlingContextExhaustion | WaitingForUser | Paused | Completed | Failed => &[],
    }
}

/// Whether moving from `from` to `to` is part of the workflow graph.
///
/// Besides the table: any phase may fail or be paused, agent phases may
/// block on the user or hand off, and blocked phases return to where they
/// came from.
pub fn is_legal(from: ExecutionPhase, to: ExecutionPhase) -> bool {
    use ExecutionPhase::*;

    if from == to || to == Failed {
        return true;
    }
    match from {
        Paused | WaitingForUser | HandlingContextExhaustion => {
            return !matches!(to, Idle | Completed);
        }
        Completed | Failed => return to == Idle,
        _ => {}
    }
    if to == Paused || to == Idle {
        return true;
    }
    if matches!(to, WaitingForUser | HandlingContextExhaustion) {
        return from.is_agent_phase();
    }
    // Skipping a task jumps straight to the next one or finishes.
    if from.is_task_phase() && matches!(to, ExecutingTask | Completed) {
        return true;
    }
    successors(from).contains(&to)
}
