//! Session handoff: ask the agent for a structured progress report and turn
//! it into a [`ContinuationSummary`].

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::summary::ContinuationSummary;
use crate::stream::truncate_str;
use crate::util::{extract_json_object, extract_tagged};

/// Longest free-text progress description kept when the report is unstructured.
const MAX_FALLBACK_PROGRESS_CHARS: usize = 2_000;

/// Structured report the agent writes before its session is replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HandoffReport {
    #[serde(default, alias = "progressDescription")]
    pub progress: String,
    #[serde(default, alias = "filesModified")]
    pub files_modified: Vec<String>,
    #[serde(default, alias = "pendingWork")]
    pub pending_work: Vec<String>,
}

/// Prompt asking the current session to summarise itself.
pub fn handoff_prompt(task_id: &str, task_title: &str) -> String {
    format!(
        r#"## CONTEXT HANDOFF

This session is close to its context limit and will be replaced by a fresh
session that knows nothing about this conversation. Write a handoff report for
task {task_id} ("{task_title}") so the next session can continue seamlessly.

Do not modify any files. Respond with a single JSON object wrapped in
<handoff></handoff> tags:

<handoff>
{{
  "progress": "What has been done so far and the approach being taken",
  "files_modified": ["relative/path/one.rs", "relative/path/two.rs"],
  "pending_work": ["Concrete next step", "Another remaining step"]
}}
</handoff>
"#
    )
}

/// Parse the agent's handoff report. Falls back to the first JSON object in
/// the text when the tags are missing.
pub fn parse_handoff_report(text: &str) -> Option<HandoffReport> {
    let body = extract_tagged(text, "handoff").unwrap_or(text);
    let json = extract_json_object(body)?;
    match serde_json::from_str::<HandoffReport>(json) {
        Ok(report) => Some(report),
        Err(e) => {
            debug!(error = %e, "Handoff report was not valid JSON");
            None
        }
    }
}

/// Build the continuation summary from whatever the agent reported plus the
/// files version control sees as changed.
pub fn build_continuation(
    task_id: &str,
    task_title: &str,
    agent_output: &str,
    changed_files: Vec<String>,
    generated_at: DateTime<Utc>,
) -> ContinuationSummary {
    let report = parse_handoff_report(agent_output).unwrap_or_else(|| HandoffReport {
        progress: truncate_str(agent_output.trim(), MAX_FALLBACK_PROGRESS_CHARS),
        ..HandoffReport::default()
    });

    let files = report.files_modified.into_iter().chain(changed_files);
    ContinuationSummary::new(
        task_id,
        task_title,
        report.progress,
        files,
        report.pending_work,
        generated_at,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_mentions_task_and_format() {
        let prompt = handoff_prompt("task-3", "Add caching");
        assert!(prompt.contains("task-3"));
        assert!(prompt.contains("Add caching"));
        assert!(prompt.contains("<handoff>"));
        assert!(prompt.contains("\"pending_work\""));
    }

    #[test]
    fn test_parse_tagged_report() {
        let text = r#"Sure.
<handoff>
{"progress": "Cache layer written", "files_modified": ["src/cache.rs"], "pending_work": ["Add eviction"]}
</handoff>"#;
        let report = parse_handoff_report(text).unwrap();
        assert_eq!(report.progress, "Cache layer written");
        assert_eq!(report.files_modified, vec!["src/cache.rs"]);
        assert_eq!(report.pending_work, vec!["Add eviction"]);
    }

    #[test]
    fn test_parse_untagged_camel_case_report() {
        let text = r#"{"progressDescription": "Half done", "pendingWork": ["finish"]}"#;
        let report = parse_handoff_report(text).unwrap();
        assert_eq!(report.progress, "Half done");
        assert!(report.files_modified.is_empty());
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(parse_handoff_report("I did some things").is_none());
        assert!(parse_handoff_report("<handoff>{not json}</handoff>").is_none());
    }

    #[test]
    fn test_build_continuation_merges_changed_files() {
        let text = r#"<handoff>{"progress": "p", "files_modified": ["src/a.rs"]}</handoff>"#;
        let summary = build_continuation(
            "task-1",
            "Title",
            text,
            vec!["src/b.rs".to_string(), "src/a.rs".to_string()],
            Utc::now(),
        );
        assert_eq!(summary.files_modified(), &["src/a.rs", "src/b.rs"]);
        assert_eq!(summary.progress_description(), "p");
    }

    #[test]
    fn test_build_continuation_falls_back_to_raw_text() {
        let summary = build_continuation(
            "task-1",
            "Title",
            "Implemented the parser, tests remain.",
            Vec::new(),
            Utc::now(),
        );
        assert_eq!(
            summary.progress_description(),
            "Implemented the parser, tests remain."
        );
    }
}
