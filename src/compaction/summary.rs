//! Continuation summary that seeds a fresh session after a handoff.

use chrono::{DateTime, SecondsFormat, Utc};

/// Immutable snapshot of where a task stood when its session ran out of room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationSummary {
    task_id: String,
    task_title: String,
    progress_description: String,
    files_modified: Vec<String>,
    pending_work: Vec<String>,
    generated_at: DateTime<Utc>,
}

impl ContinuationSummary {
    /// File paths are sorted and deduplicated; blank entries are dropped.
    pub fn new(
        task_id: impl Into<String>,
        task_title: impl Into<String>,
        progress_description: impl Into<String>,
        files_modified: impl IntoIterator<Item = String>,
        pending_work: impl IntoIterator<Item = String>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let mut files: Vec<String> = files_modified
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        files.sort();
        files.dedup();

        let pending = pending_work
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        Self {
            task_id: task_id.into(),
            task_title: task_title.into(),
            progress_description: progress_description.into().trim().to_string(),
            files_modified: files,
            pending_work: pending,
            generated_at,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn task_title(&self) -> &str {
        &self.task_title
    }

    pub fn progress_description(&self) -> &str {
        &self.progress_description
    }

    pub fn files_modified(&self) -> &[String] {
        &self.files_modified
    }

    pub fn pending_work(&self) -> &[String] {
        &self.pending_work
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Render the block that opens the next session's first prompt.
    pub fn render(&self) -> String {
        let mut text = String::new();

        text.push_str("## CONTINUATION FROM PREVIOUS SESSION\n\n");
        text.push_str(
            "The previous session ran out of context and was replaced by this one. \
             Pick up exactly where it left off; do not redo finished work.\n\n",
        );
        text.push_str(&format!(
            "**Task:** {} - {}\n",
            self.task_id, self.task_title
        ));
        text.push_str(&format!(
            "**Summary written:** {}\n\n",
            self.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));

        text.push_str("### Progress So Far\n\n");
        if self.progress_description.is_empty() {
            text.push_str("(no progress description was recorded)\n\n");
        } else {
            text.push_str(&self.progress_description);
            text.push_str("\n\n");
        }

        if !self.files_modified.is_empty() {
            text.push_str("### Files Modified\n\n");
            for file in &self.files_modified {
                text.push_str(&format!("- {}\n", file));
            }
            text.push('\n');
        }

        if !self.pending_work.is_empty() {
            text.push_str("### Remaining Work\n\n");
            for item in &self.pending_work {
                text.push_str(&format!("- {}\n", item));
            }
            text.push('\n');
        }

        text
    }
}
