//! Implementation plan model.
//!
//! A plan is the agent's markdown breakdown of a feature into ordered tasks.
//! The raw text is kept verbatim; tasks are always derived from it by
//! [`parse_plan`], so saving and re-parsing a plan is lossless.

mod parser;
mod store;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use parser::parse_plan;
pub use store::PlanStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Completed or skipped: the workflow will not come back to it.
    pub fn is_settled(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// A checklist item under a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub title: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// `task-<ordinal>`
    pub id: String,
    /// 1-based position in the plan
    pub ordinal: usize,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub subtasks: Vec<Subtask>,
}

impl Task {
    pub fn new(ordinal: usize, title: impl Into<String>) -> Self {
        Self {
            id: format!("task-{}", ordinal),
            ordinal,
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            subtasks: Vec::new(),
        }
    }

    /// Markdown rendering used in prompts.
    pub fn to_markdown(&self) -> String {
        let mut text = format!("### Task {}: {}\n", self.ordinal, self.title);
        if !self.description.is_empty() {
            text.push_str(&format!("**Description:** {}\n", self.description));
        }
        for subtask in &self.subtasks {
            let mark = if subtask.done { 'x' } else { ' ' };
            text.push_str(&format!("- [{}] {}\n", mark, subtask.title));
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub raw_text: String,
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn parse(raw_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        let tasks = parse_plan(&raw_text);
        Self { raw_text, tasks }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn task_mut(&mut self, index: usize) -> Option<&mut Task> {
        self.tasks.get_mut(index)
    }

    /// Index of the first task after `index` that still needs work.
    pub fn next_pending_after(&self, index: usize) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .skip(index + 1)
            .find(|(_, t)| t.status == TaskStatus::Pending)
            .map(|(i, _)| i)
    }

    pub fn first_pending(&self) -> Option<usize> {
        self.tasks
            .iter()
            .position(|t| t.status == TaskStatus::Pending)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn settled_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status.is_settled()).count()
    }
}
