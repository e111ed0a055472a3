use chrono::{DateTime, Utc};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::orchestrator::{ExecutionContext, LogEntry, LogKind};
use crate::phase::ExecutionPhase;
use crate::plan::{Plan, TaskStatus};
use crate::ui::icons::{
    AGENT, BLOCKER, CHECK, COMMAND, CROSS, PAUSED, PIVOT, QUESTION, RUNNING, SPARKLE, TOOL,
    WARNING,
};

/// Terminal UI for a workflow run, rendered from context snapshots.
///
/// Two bars are stacked vertically:
/// - Progress bar: overall feature progress in percent
/// - Phase spinner: current task and phase, plus the context budget
///
/// New execution-log entries are printed above the bars as they appear.
pub struct WorkflowUI {
    multi: MultiProgress,
    progress_bar: ProgressBar,
    phase_bar: ProgressBar,
    verbose: bool,
    /// Newest log entry already printed.
    last_printed: Option<(DateTime<Utc>, String)>,
}

impl WorkflowUI {
    pub fn new(verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let progress_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let progress_bar = multi.add(ProgressBar::new(100));
        progress_bar.set_style(progress_style);
        progress_bar.set_prefix("Feature");

        let phase_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let phase_bar = multi.add(ProgressBar::new_spinner());
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("  Phase");
        phase_bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            multi,
            progress_bar,
            phase_bar,
            verbose,
            last_printed: None,
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if the rich UI fails.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Run `f` with the bars hidden, for interactive prompts.
    pub fn suspend<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.multi.suspend(f)
    }

    /// Bring the bars and log up to date with a snapshot.
    pub fn render(&mut self, ctx: &ExecutionContext) {
        let entries: Vec<&LogEntry> = ctx.log_entries().collect();
        for entry in unseen_entries(&entries, self.last_printed.as_ref()) {
            if let Some(line) = format_entry(entry, self.verbose) {
                self.print_line(line);
            }
        }
        if let Some(last) = entries.last() {
            self.last_printed = Some((last.timestamp, last.message.clone()));
        }

        self.progress_bar
            .set_position((ctx.progress() * 100.0).round() as u64);
        if let Some(plan) = &ctx.plan {
            self.progress_bar.set_message(format!(
                "{}/{} tasks",
                plan.settled_count(),
                plan.tasks.len()
            ));
        }
        self.phase_bar.set_message(phase_message(ctx));
    }

    pub fn print_plan(&self, plan: &Plan) {
        self.print_separator();
        for task in &plan.tasks {
            let marker = match task.status {
                TaskStatus::Completed => style("✓").green(),
                TaskStatus::Skipped => style("↷").yellow(),
                TaskStatus::Failed => style("✗").red(),
                TaskStatus::InProgress => style("▶").cyan(),
                TaskStatus::Pending => style("·").dim(),
            };
            self.print_line(format!(
                "{} {} {}",
                marker,
                style(format!("Task {}:", task.ordinal)).bold(),
                task.title
            ));
        }
        self.print_separator();
    }

    /// Print a full-width cyan separator line.
    pub fn print_separator(&self) {
        self.print_line(format!("{}", style("═".repeat(70)).cyan()));
    }

    /// Stop the spinner and print the final banner.
    pub fn finish(&self, ctx: &ExecutionContext) {
        match ctx.phase {
            ExecutionPhase::Completed => {
                self.progress_bar.finish();
                self.phase_bar
                    .finish_with_message(format!("{}Feature complete", CHECK));
                if let Some(plan) = &ctx.plan {
                    self.print_line(format!("\n{} {}", SPARKLE, task_tally(plan)));
                }
                self.print_line(format!(
                    "\n{} {}\n",
                    SPARKLE,
                    style(ctx.budget.status_summary()).green()
                ));
            }
            ExecutionPhase::Failed => {
                let reason = ctx
                    .last_error()
                    .map(|e| e.message.as_str())
                    .unwrap_or("unknown error");
                self.progress_bar.abandon();
                self.phase_bar
                    .abandon_with_message(format!("{}Run failed: {}", CROSS, reason));
                if let Some(plan) = &ctx.plan {
                    self.print_line(format!("\n{}\n", style(task_tally(plan)).dim()));
                }
            }
            _ => {
                self.progress_bar.abandon();
                self.phase_bar.abandon();
            }
        }
    }
}

/// "3 completed, 1 skipped" style summary of task outcomes, omitting zeros.
fn task_tally(plan: &Plan) -> String {
    let parts: Vec<String> = [
        (TaskStatus::Completed, "completed"),
        (TaskStatus::Skipped, "skipped"),
        (TaskStatus::Failed, "failed"),
        (TaskStatus::Pending, "not started"),
    ]
    .into_iter()
    .filter_map(|(status, label)| match plan.count(status) {
        0 => None,
        n => Some(format!("{} {}", n, label)),
    })
    .collect();
    format!("Tasks: {}", parts.join(", "))
}

fn phase_message(ctx: &ExecutionContext) -> String {
    let task = ctx
        .current_task()
        .filter(|t| t.status == TaskStatus::InProgress)
        .map(|t| format!("{} ", style(format!("Task {}", t.ordinal)).yellow()))
        .unwrap_or_default();
    let icon = match ctx.phase {
        ExecutionPhase::Paused => PAUSED,
        ExecutionPhase::WaitingForUser => QUESTION,
        ExecutionPhase::HandlingContextExhaustion => PIVOT,
        _ if ctx.is_blocked() => BLOCKER,
        _ => RUNNING,
    };
    format!(
        "{}{}{} {}",
        icon,
        task,
        ctx.phase.label(),
        style(format!(
            "({:.0}% context left)",
            ctx.budget.percent_remaining() * 100.0
        ))
        .dim()
    )
}

/// Entries after the last one printed. Everything when the marker has been
/// evicted from the bounded log.
fn unseen_entries<'a>(
    entries: &[&'a LogEntry],
    last_printed: Option<&(DateTime<Utc>, String)>,
) -> Vec<&'a LogEntry> {
    let Some((timestamp, message)) = last_printed else {
        return entries.to_vec();
    };
    match entries
        .iter()
        .rposition(|e| e.timestamp == *timestamp && e.message == *message)
    {
        Some(pos) => entries[pos + 1..].to_vec(),
        None => entries
            .iter()
            .filter(|e| e.timestamp > *timestamp)
            .copied()
            .collect(),
    }
}

/// One printable line for a log entry, `None` when it is hidden at this
/// verbosity.
fn format_entry(entry: &LogEntry, verbose: bool) -> Option<String> {
    let line = match entry.kind {
        LogKind::Phase => format!(
            "{} {}",
            style("▶").green().bold(),
            style(&entry.message).bold()
        ),
        LogKind::Tool => format!("    {}{}", TOOL, style(&entry.message).yellow()),
        LogKind::Agent if verbose => format!("    {}{}", AGENT, style(&entry.message).dim()),
        LogKind::Agent => return None,
        LogKind::Command => format!("  {}{}", COMMAND, entry.message),
        LogKind::Info => format!("  {}", entry.message),
        LogKind::Warning => format!("  {}{}", WARNING, style(&entry.message).yellow()),
        LogKind::Error => format!("  {}{}", CROSS, style(&entry.message).red()),
        LogKind::Separator => format!("{}", style("─".repeat(70)).dim()),
    };
    Some(line)
}
