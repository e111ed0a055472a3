//! Prompt construction for each agent phase.

use crate::build::CommandResult;
use crate::compaction::handoff_prompt;
use crate::phase::ExecutionPhase;
use crate::plan::Task;
use crate::util::extract_tagged;

use super::context::ExecutionContext;

/// Longest slice of build or test output quoted back to the agent.
const MAX_COMMAND_OUTPUT_CHARS: usize = 6_000;

const PLAN_FORMAT: &str = r#"Write the plan as markdown using exactly this structure for every task:

## Task 1: <short title>
**Description:** <one or two sentences on what this task delivers>
- [ ] <concrete step>
- [ ] <concrete step>

Number tasks from 1. Order them so each task builds on the previous ones and
leaves the project compiling with passing tests. Keep each task small enough
for one focused session."#;

const COMMIT_INSTRUCTIONS: &str = r#"Do NOT run `git commit` yourself; the orchestrator commits for you.
End your reply with a conventional commit message for the changes wrapped in
<commit></commit> tags, for example:

<commit>feat(auth): add OAuth login button</commit>"#;

/// Build the full prompt for an agent phase.
pub fn build_prompt(ctx: &ExecutionContext, phase: ExecutionPhase) -> String {
    let task = ctx.current_task();

    if phase == ExecutionPhase::HandlingContextExhaustion {
        let (id, title) = task
            .map(|t| (t.id.as_str(), t.title.as_str()))
            .unwrap_or(("plan", "Planning"));
        return handoff_prompt(id, title);
    }

    let mut prompt = String::new();
    if let Some(summary) = &ctx.continuation {
        prompt.push_str(&summary.render());
        prompt.push('\n');
    }

    prompt.push_str("## FEATURE REQUEST\n");
    prompt.push_str(ctx.feature_description.trim());
    prompt.push_str("\n\n");

    if let Some(plan) = &ctx.plan
        && phase != ExecutionPhase::GeneratingInitialPlan
    {
        prompt.push_str("## PLAN\n");
        prompt.push_str(plan.raw_text.trim());
        prompt.push_str("\n\n");
    }

    if phase.is_task_phase()
        && let Some(task) = task
    {
        prompt.push_str("## CURRENT TASK\n");
        prompt.push_str(&task.to_markdown());
        prompt.push('\n');
    }

    let answers: Vec<_> = ctx.undelivered_answers().collect();
    if !answers.is_empty() {
        prompt.push_str("## ANSWERS TO YOUR QUESTIONS\n");
        for qa in answers {
            prompt.push_str(&format!("Q: {}\nA: {}\n", qa.question, qa.answer));
        }
        prompt.push('\n');
    }

    prompt.push_str("## INSTRUCTIONS\n");
    prompt.push_str(&instructions(ctx, phase, task));
    prompt.push('\n');
    prompt
}

fn instructions(ctx: &ExecutionContext, phase: ExecutionPhase, task: Option<&Task>) -> String {
    let title = task.map(|t| t.title.as_str()).unwrap_or("the current task");
    match phase {
        ExecutionPhase::GeneratingInitialPlan => format!(
            "Explore the codebase and design an implementation plan for the feature request.\n\
             Do not modify any files.\n\n{}",
            PLAN_FORMAT
        ),
        ExecutionPhase::RewritingPlan => format!(
            "Critically review the plan above against the codebase. Fix missing steps, wrong\n\
             ordering, and tasks that are too large. Output the complete revised plan.\n\
             Do not modify any files.\n\n{}",
            PLAN_FORMAT
        ),
        ExecutionPhase::ExecutingTask => format!(
            "Implement \"{}\". Follow existing conventions, check existing code before\n\
             changing it, and keep the change focused on this task. Do not commit.",
            title
        ),
        ExecutionPhase::CommittingImplementation => format!(
            "Review the uncommitted changes for \"{}\" (git status, git diff). Remove debug\n\
             leftovers and finish anything incomplete.\n\n{}",
            title, COMMIT_INSTRUCTIONS
        ),
        ExecutionPhase::ReviewingCode => format!(
            "Review the changes made for \"{}\" for bugs, missing edge cases, and deviations\n\
             from the plan. List each issue with file and line and the fix you recommend.\n\
             Do not modify any files.",
            title
        ),
        ExecutionPhase::CommittingReview => {
            let notes = ctx
                .review_notes
                .as_deref()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or("(no review notes were produced)");
            format!(
                "Apply the fixes from this review of \"{}\":\n\n{}\n\n{}",
                title,
                notes.trim(),
                COMMIT_INSTRUCTIONS
            )
        }
        ExecutionPhase::WritingTests => format!(
            "Design tests for \"{}\": which behaviours to cover, which files the tests go in,\n\
             and the cases for each. Follow the project's existing test layout.\n\
             Do not modify any files.",
            title
        ),
        ExecutionPhase::CommittingTests => {
            let plan = ctx
                .test_plan
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or("(no test plan was produced; choose sensible tests)");
            format!(
                "Write the tests for \"{}\" following this test plan:\n\n{}\n\n{}",
                title,
                plan.trim(),
                COMMIT_INSTRUCTIONS
            )
        }
        ExecutionPhase::FixingBuildErrors => fix_instructions("build", ctx.last_build_result.as_ref()),
        ExecutionPhase::FixingTestErrors => fix_instructions("tests", ctx.last_test_result.as_ref()),
        other => format!("Continue with: {}.", other.label()),
    }
}

fn fix_instructions(what: &str, result: Option<&CommandResult>) -> String {
    let output = result
        .map(|r| tail_chars(&r.combined_output(), MAX_COMMAND_OUTPUT_CHARS))
        .unwrap_or_default();
    let exit = result.map(|r| r.exit_code).unwrap_or(-1);
    format!(
        "The {what} failed (exit code {exit}). Fix the root cause without weakening or\n\
         deleting tests. Output:\n\n```\n{output}\n```"
    )
}

/// Last `max` characters of `text`.
fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max).collect();
    format!("...{}", tail)
}

/// Commit message from `<commit>` tags, first line of it kept as subject.
pub fn extract_commit_message(output: &str) -> Option<String> {
    extract_tagged(output, "commit").map(|m| m.to_string())
}

/// Message used when the agent didn't supply one.
pub fn default_commit_message(phase: ExecutionPhase, task: Option<&Task>) -> String {
    let title = task.map(|t| t.title.as_str()).unwrap_or("changes");
    match phase {
        ExecutionPhase::CommittingReview => format!("refactor: address review for {}", title),
        ExecutionPhase::CommittingTests => format!("test: add tests for {}", title),
        _ => format!("feat: {}", title),
    }
}
