use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::{Delta, DiffOptions, Repository};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{CommitOutcome, VersionControl};
use crate::build::{CommandResult, run_command};
use crate::errors::CommandError;

/// Git-backed [`VersionControl`]: commits through the `git` CLI so user hooks
/// and signing config apply, and inspects changes through libgit2.
#[derive(Debug, Clone, Default)]
pub struct GitTracker;

impl GitTracker {
    pub fn new() -> Self {
        Self
    }

    fn open(dir: &Path) -> Result<Repository> {
        Repository::discover(dir).context("Failed to open git repository")
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
        repo.head().ok().and_then(|head| head.peel_to_commit().ok())
    }
}

fn failed(command: &str, result: &CommandResult) -> CommandError {
    CommandError::Failed {
        command: command.to_string(),
        exit_code: result.exit_code,
        stderr: result
            .error_output
            .clone()
            .unwrap_or_else(|| result.output.clone()),
    }
}

fn is_nothing_to_commit(result: &CommandResult) -> bool {
    let text = result.combined_output();
    text.contains("nothing to commit") || text.contains("no changes added to commit")
}

#[async_trait]
impl VersionControl for GitTracker {
    async fn commit_all(
        &self,
        message: &str,
        dir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommitOutcome, CommandError> {
        let add = run_command("git", &["add", "-A"], dir, timeout, cancel).await?;
        if !add.success {
            return Err(failed("git add -A", &add));
        }

        let commit = run_command("git", &["commit", "-m", message], dir, timeout, cancel).await?;
        if commit.success {
            info!(message = %message.lines().next().unwrap_or(""), "Committed changes");
            return Ok(CommitOutcome::Committed(commit.output));
        }
        if is_nothing_to_commit(&commit) {
            return Ok(CommitOutcome::NoChanges);
        }
        Err(failed("git commit", &commit))
    }

    fn head(&self, dir: &Path) -> Option<String> {
        let repo = Self::open(dir).ok()?;
        Self::head_commit(&repo).map(|c| c.id().to_string())
    }

    fn changed_files(&self, dir: &Path, base: Option<&str>) -> Result<Vec<String>> {
        let repo = Self::open(dir)?;
        let base_tree = match base {
            Some(sha) => {
                let oid = git2::Oid::from_str(sha).context("Invalid base commit id")?;
                Some(repo.find_commit(oid)?.tree()?)
            }
            None => match Self::head_commit(&repo) {
                Some(commit) => Some(commit.tree()?),
                None => None,
            },
        };

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = repo.diff_tree_to_workdir_with_index(base_tree.as_ref(), Some(&mut opts))?;

        let mut files: Vec<String> = diff
            .deltas()
            .filter(|delta| {
                matches!(
                    delta.status(),
                    Delta::Added
                        | Delta::Untracked
                        | Delta::Modified
                        | Delta::Renamed
                        | Delta::Copied
                )
            })
            .filter_map(|delta| delta.new_file().path().map(|p| p.to_string_lossy().into_owned()))
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }
}
