//! Feature delivery: `conductor run`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use conductor::orchestrator::{Blocker, PendingQuestion, WorkflowHandle};
use conductor::stream::QuestionOption;
use conductor::ui::WorkflowUI;

use super::super::{Cli, RunArgs};

pub async fn cmd_run(cli: &Cli, project_dir: PathBuf, args: RunArgs) -> Result<()> {
    use conductor::build::ShellBuildRunner;
    use conductor::conductor_config::CliOverrides;
    use conductor::config::Config;
    use conductor::orchestrator::{ClaudeRunner, Collaborators, workflow};
    use conductor::phase::ExecutionPhase;
    use conductor::tracker::GitTracker;

    let overrides = CliOverrides {
        model: args.model.clone(),
        auto_answer: args.auto_answer,
        failure_handling: args
            .failure_handling
            .as_deref()
            .map(str::parse)
            .transpose()?,
        skip_build: args.skip_build,
        skip_tests: args.skip_tests,
    };
    let config = Config::new(project_dir, cli.verbose, overrides)?;
    config.ensure_directories()?;

    for warning in config.conductor_config().validate() {
        eprintln!("{} {}", console::style("warning:").yellow().bold(), warning);
    }

    let feature = match args.feature.clone() {
        Some(feature) => feature,
        None => dialoguer::Input::<String>::new()
            .with_prompt("Describe the feature to build")
            .interact_text()
            .context("Failed to read feature description")?,
    };

    let (orchestrator, handle) = workflow(
        config.workflow_settings()?,
        Collaborators {
            agent: Arc::new(ClaudeRunner::new(config.agent_settings())),
            vcs: Arc::new(GitTracker::new()),
            builder: Arc::new(ShellBuildRunner),
        },
    );
    let engine = tokio::spawn(orchestrator.run());

    handle.start(feature, args.images.clone()).await?;

    let mut ui = WorkflowUI::new(cli.verbose);
    let mut rx = handle.subscribe();
    let mut plan_shown = false;
    let final_ctx = loop {
        let ctx = rx.borrow_and_update().clone();
        ui.render(&ctx);

        if !plan_shown
            && ctx.phase == ExecutionPhase::ExecutingTask
            && let Some(plan) = &ctx.plan
        {
            ui.print_plan(plan);
            plan_shown = true;
        }
        if ctx.phase.is_terminal() {
            break ctx;
        }
        if let Some(blocker) = ctx.blocker() {
            resolve_blocker(&ui, &handle, blocker).await?;
            continue;
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break ctx;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                ui.suspend(|| eprintln!("Stopping..."));
                handle.stop().await?;
            }
        }
    };

    ui.finish(&final_ctx);
    drop(handle);
    drop(rx);
    engine.await.context("Orchestrator task panicked")?;

    if final_ctx.phase == ExecutionPhase::Failed {
        let reason = final_ctx
            .last_error()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "unknown error".to_string());
        anyhow::bail!("Run failed: {}", reason);
    }
    Ok(())
}

/// Ask the user to resolve whatever the workflow is blocked on.
async fn resolve_blocker(
    ui: &WorkflowUI,
    handle: &WorkflowHandle,
    blocker: &Blocker,
) -> Result<()> {
    use conductor::fallback::TaskFailureChoice;
    use dialoguer::{Confirm, Select, theme::ColorfulTheme};

    match blocker {
        Blocker::Question(pending) => {
            let answer = ui.suspend(|| ask_questions(pending))?;
            handle.answer_question(answer).await?;
        }
        Blocker::TaskFailure(failure) => {
            let choices = [
                TaskFailureChoice::Retry,
                TaskFailureChoice::Skip,
                TaskFailureChoice::Stop,
            ];
            let selection = ui.suspend(|| {
                Select::with_theme(&ColorfulTheme::default())
                    .with_prompt(format!("{} failed: {}", failure.task_title, failure.error))
                    .items(&["Retry", "Skip this task", "Stop the run"])
                    .default(0)
                    .interact()
            })?;
            handle.respond_to_task_failure(choices[selection]).await?;
        }
        Blocker::Confirmation(pending) => {
            let approve = ui.suspend(|| {
                Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt(format!("Run {}: {}?", pending.step, pending.command))
                    .default(true)
                    .interact()
            })?;
            handle.confirm_command(approve).await?;
        }
    }
    Ok(())
}

/// Prompt for every question in an `AskUserQuestion` call and combine the
/// answers into one reply.
fn ask_questions(pending: &PendingQuestion) -> Result<String, dialoguer::Error> {
    use dialoguer::{Input, MultiSelect, Select, theme::ColorfulTheme};

    let theme = ColorfulTheme::default();
    let mut answers = Vec::new();
    for question in &pending.questions {
        let answer = if question.options.is_empty() {
            Input::<String>::with_theme(&theme)
                .with_prompt(&question.question)
                .interact_text()?
        } else {
            let mut items: Vec<String> = question.options.iter().map(option_item).collect();
            items.push("Other (type an answer)".to_string());
            let other = question.options.len();

            let selection = if question.multi_select {
                MultiSelect::with_theme(&theme)
                    .with_prompt(&question.question)
                    .items(&items)
                    .interact()?
            } else {
                vec![
                    Select::with_theme(&theme)
                        .with_prompt(&question.question)
                        .items(&items)
                        .default(0)
                        .interact()?,
                ]
            };
            let typed = if selection.is_empty() || selection.contains(&other) {
                Some(
                    Input::<String>::with_theme(&theme)
                        .with_prompt("Your answer")
                        .interact_text()?,
                )
            } else {
                None
            };
            selected_answer(&question.options, &selection, typed)
        };
        answers.push((question.question.clone(), answer));
    }

    Ok(combine_answers(&answers))
}

fn option_item(option: &QuestionOption) -> String {
    if option.description.is_empty() {
        option.label.clone()
    } else {
        format!("{} - {}", option.label, option.description)
    }
}

/// Labels of the chosen options, plus any typed answer, joined with commas.
fn selected_answer(
    options: &[QuestionOption],
    selection: &[usize],
    typed: Option<String>,
) -> String {
    selection
        .iter()
        .filter_map(|&i| options.get(i).map(|o| o.label.clone()))
        .chain(typed.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A single answer goes back verbatim; several become `question: answer` lines.
fn combine_answers(answers: &[(String, String)]) -> String {
    match answers {
        [(_, answer)] => answer.clone(),
        _ => answers
            .iter()
            .map(|(q, a)| format!("{}: {}", q, a))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(labels: &[&str]) -> Vec<QuestionOption> {
        labels
            .iter()
            .map(|label| QuestionOption {
                label: label.to_string(),
                description: String::new(),
            })
            .collect()
    }

    #[test]
    fn test_multi_select_joins_chosen_labels() {
        let opts = options(&["Postgres", "Redis", "SQLite"]);
        assert_eq!(selected_answer(&opts, &[0, 2], None), "Postgres, SQLite");
    }

    #[test]
    fn test_other_entry_contributes_typed_answer() {
        let opts = options(&["Postgres", "Redis"]);
        assert_eq!(
            selected_answer(&opts, &[1, 2], Some(" DynamoDB ".to_string())),
            "Redis, DynamoDB"
        );
        assert_eq!(selected_answer(&opts, &[2], Some("MySQL".to_string())), "MySQL");
    }

    #[test]
    fn test_combine_answers() {
        let one = vec![("Which database?".to_string(), "Postgres".to_string())];
        assert_eq!(combine_answers(&one), "Postgres");

        let two = vec![
            ("Which database?".to_string(), "Postgres".to_string()),
            ("Add caching?".to_string(), "Redis, CDN".to_string()),
        ];
        assert_eq!(
            combine_answers(&two),
            "Which database?: Postgres\nAdd caching?: Redis, CDN"
        );
    }
}
