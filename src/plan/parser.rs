//! Plan grammar.
//!
//! ```text
//! ## Task 1: Add login                 task header (## or ###, ":" "." or "-")
//! **Description:** OAuth flow          optional, first one wins
//! - [ ] wire button                    checklist item ("-" or "*", [ ] or [x])
//! - [x] add route
//! ```
//!
//! Everything else is ignored. Ordinals come from position, not from the
//! number written in the header.

use std::sync::LazyLock;

use regex::Regex;

use super::{Subtask, Task};

static TASK_HEADER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^#{2,3}\s*task\s+\d+\s*[:.\-]\s*(.+?)\s*$").unwrap()
});

static DESCRIPTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\*\*description:?\*\*:?\s*(.*?)\s*$").unwrap());

static CHECKLIST_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s+\[([ xX])\]\s+(.+?)\s*$").unwrap());

/// Parse plan markdown into tasks, all `pending`.
pub fn parse_plan(text: &str) -> Vec<Task> {
    let mut tasks: Vec<Task> = Vec::new();
    let mut has_description = false;

    for line in text.lines() {
        if let Some(caps) = TASK_HEADER_REGEX.captures(line.trim_end()) {
            let ordinal = tasks.len() + 1;
            tasks.push(Task::new(ordinal, &caps[1]));
            has_description = false;
            continue;
        }

        let Some(task) = tasks.last_mut() else {
            continue;
        };

        if !has_description && let Some(caps) = DESCRIPTION_REGEX.captures(line.trim()) {
            task.description = caps[1].to_string();
            has_description = true;
        } else if let Some(caps) = CHECKLIST_REGEX.captures(line) {
            task.subtasks.push(Subtask {
                title: caps[2].to_string(),
                done: !caps[1].trim().is_empty(),
            });
        }
    }

    tasks
}
