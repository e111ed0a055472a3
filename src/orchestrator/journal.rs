use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::phase::ExecutionPhase;

/// One line of the phase journal.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub phase: ExecutionPhase,
    /// Task id, or "-" outside of task phases.
    pub task: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only `phase|task|status|timestamp` log of phase transitions.
pub struct PhaseJournal {
    path: PathBuf,
}

impl PhaseJournal {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, phase: ExecutionPhase, task: Option<&str>, status: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create journal directory")?;
        }
        let line = format!(
            "{}|{}|{}|{}\n",
            phase,
            task.unwrap_or("-"),
            status.replace(['|', '\n'], " "),
            Utc::now().to_rfc3339()
        );

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open journal file")?
            .write_all(line.as_bytes())
            .context("Failed to write journal entry")?;

        Ok(())
    }

    /// All readable entries. Malformed lines are skipped.
    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read journal file")?;

        Ok(content
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.splitn(4, '|').collect();
                let [phase, task, status, timestamp] = parts[..] else {
                    return None;
                };
                Some(JournalEntry {
                    phase: phase.parse().ok()?,
                    task: task.to_string(),
                    status: status.to_string(),
                    timestamp: DateTime::parse_from_rfc3339(timestamp)
                        .ok()?
                        .with_timezone(&Utc),
                })
            })
            .collect())
    }

    pub fn last_entry(&self) -> Result<Option<JournalEntry>> {
        Ok(self.entries()?.pop())
    }

    pub fn reset(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).context("Failed to remove journal file")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_and_read_back() {
        let dir = tempdir().unwrap();
        let journal = PhaseJournal::new(dir.path().join(".conductor/state"));

        journal
            .record(ExecutionPhase::GeneratingInitialPlan, None, "started")
            .unwrap();
        journal
            .record(ExecutionPhase::ExecutingTask, Some("task-1"), "started")
            .unwrap();
        journal
            .record(ExecutionPhase::RunningBuild, Some("task-1"), "failed|exit 101\n")
            .unwrap();

        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].phase, ExecutionPhase::GeneratingInitialPlan);
        assert_eq!(entries[0].task, "-");
        assert_eq!(entries[1].task, "task-1");
        assert_eq!(entries[2].status, "failed exit 101 ");
        assert_eq!(
            journal.last_entry().unwrap().unwrap().phase,
            ExecutionPhase::RunningBuild
        );
    }

    #[test]
    fn test_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        fs::write(
            &path,
            "garbage\nnotAPhase|-|x|2026-01-01T00:00:00Z\ncompleted|-|done|2026-01-01T00:00:00+00:00\n",
        )
        .unwrap();
        let entries = PhaseJournal::new(path).entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].phase, ExecutionPhase::Completed);
    }

    #[test]
    fn test_missing_file_and_reset() {
        let dir = tempdir().unwrap();
        let journal = PhaseJournal::new(dir.path().join("state"));
        assert!(journal.entries().unwrap().is_empty());
        journal.record(ExecutionPhase::Idle, None, "reset").unwrap();
        journal.reset().unwrap();
        assert!(journal.last_entry().unwrap().is_none());
    }
}
