//! Plan inspection: `conductor plan <file>`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

pub fn cmd_plan(file: &Path) -> Result<()> {
    use conductor::plan::Plan;

    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read plan from {}", file.display()))?;
    let plan = Plan::parse(raw);

    if plan.is_empty() {
        anyhow::bail!(
            "No tasks found in {}. Tasks start with a '## Task N: <title>' header.",
            file.display()
        );
    }

    println!();
    println!("Plan: {}", file.display());
    println!();
    for task in &plan.tasks {
        println!(
            "{} {}",
            style(format!("Task {}:", task.ordinal)).bold(),
            task.title
        );
        if !task.description.is_empty() {
            println!("    {}", style(&task.description).dim());
        }
        for subtask in &task.subtasks {
            let mark = if subtask.done { "x" } else { " " };
            println!("    [{}] {}", mark, subtask.title);
        }
    }
    println!();

    let subtasks: usize = plan.tasks.iter().map(|t| t.subtasks.len()).sum();
    println!("{} tasks, {} checklist items", plan.tasks.len(), subtasks);
    println!();
    Ok(())
}
