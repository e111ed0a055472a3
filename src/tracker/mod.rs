//! Version-control collaborator.

mod git;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::CommandError;

pub use git::GitTracker;

/// Result of committing the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Output of the commit command.
    Committed(String),
    NoChanges,
}

/// Commits work and reports what changed.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Stage everything and commit. "Nothing to commit" is `NoChanges`, not
    /// an error.
    async fn commit_all(
        &self,
        message: &str,
        dir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommitOutcome, CommandError>;

    /// Current HEAD commit, `None` for repositories without commits.
    fn head(&self, dir: &Path) -> Option<String>;

    /// Files added or modified since `base` (or since HEAD when `None`),
    /// including uncommitted and untracked files. Paths are relative to the
    /// repository root.
    fn changed_files(&self, dir: &Path, base: Option<&str>) -> Result<Vec<String>>;
}
