//! Status and reset commands.

use anyhow::Result;
use std::path::Path;

pub fn cmd_status(project_dir: &Path) -> Result<()> {
    use conductor::conductor_config::CONDUCTOR_DIR;
    use conductor::orchestrator::PhaseJournal;
    use conductor::plan::PlanStore;

    let conductor_dir = project_dir.join(CONDUCTOR_DIR);

    println!();
    println!("Conductor Status");
    println!("================");
    println!();

    if !conductor_dir.exists() {
        println!("Execution: Not started");
        println!();
        println!("Run 'conductor run --feature \"...\"' to start.");
        println!();
        return Ok(());
    }

    match PlanStore::new(conductor_dir.join("plan.md")).load()? {
        Some(plan) if !plan.is_empty() => {
            println!("Plan: {} tasks", plan.tasks.len());
            for task in &plan.tasks {
                println!("  Task {}: {}", task.ordinal, task.title);
            }
        }
        _ => println!("Plan: none"),
    }
    println!();

    let journal = PhaseJournal::new(conductor_dir.join("state"));
    let entries = journal.entries()?;
    if entries.is_empty() {
        println!("Execution: Not started");
        println!();
        return Ok(());
    }

    if let Some(last) = entries.last() {
        println!("Current phase: {} ({})", last.phase.label(), last.phase);
    }
    let completed: std::collections::BTreeSet<_> = entries
        .iter()
        .filter(|e| e.status == "task completed")
        .map(|e| e.task.as_str())
        .collect();
    println!("Tasks completed: {}", completed.len());

    println!();
    println!("Recent activity:");
    for entry in entries.iter().rev().take(8) {
        let task = if entry.task == "-" {
            String::new()
        } else {
            format!(" [{}]", entry.task)
        };
        println!(
            "  {}{}: {} ({})",
            entry.phase,
            task,
            entry.status,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    Ok(())
}

pub fn cmd_reset(project_dir: &Path, force: bool) -> Result<()> {
    use conductor::conductor_config::CONDUCTOR_DIR;
    use conductor::orchestrator::PhaseJournal;
    use conductor::plan::PlanStore;
    use dialoguer::Confirm;

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will delete the saved plan, phase journal, and logs. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    let conductor_dir = project_dir.join(CONDUCTOR_DIR);
    PhaseJournal::new(conductor_dir.join("state")).reset()?;
    PlanStore::new(conductor_dir.join("plan.md")).clear()?;

    let log_dir = conductor_dir.join("logs");
    if log_dir.exists() {
        std::fs::remove_dir_all(&log_dir).ok();
    }

    println!("Reset complete");
    Ok(())
}
