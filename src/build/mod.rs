//! Build and test collaborator.
//!
//! Detects the project type from its manifest files and runs the matching
//! build or test command through `sh -c`. Commands from `[build]` in
//! `conductor.toml` take precedence over detection.

mod command;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::CommandError;

pub use command::{CommandResult, run_command};

/// Project ecosystems recognised from manifest files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectType {
    Rust,
    Swift,
    Go,
    Node,
    Python,
    Make,
}

impl ProjectType {
    /// Checked in order; the first manifest found wins.
    const MANIFESTS: [(&'static str, ProjectType); 7] = [
        ("Cargo.toml", ProjectType::Rust),
        ("Package.swift", ProjectType::Swift),
        ("go.mod", ProjectType::Go),
        ("package.json", ProjectType::Node),
        ("pyproject.toml", ProjectType::Python),
        ("setup.py", ProjectType::Python),
        ("Makefile", ProjectType::Make),
    ];

    pub fn detect(dir: &Path) -> Option<Self> {
        Self::MANIFESTS
            .iter()
            .find(|(manifest, _)| dir.join(manifest).is_file())
            .map(|(_, project_type)| *project_type)
    }

    pub fn default_command(&self, kind: CommandKind) -> &'static str {
        match (self, kind) {
            (ProjectType::Rust, CommandKind::Build) => "cargo build",
            (ProjectType::Rust, CommandKind::Test) => "cargo test",
            (ProjectType::Swift, CommandKind::Build) => "swift build",
            (ProjectType::Swift, CommandKind::Test) => "swift test",
            (ProjectType::Go, CommandKind::Build) => "go build ./...",
            (ProjectType::Go, CommandKind::Test) => "go test ./...",
            (ProjectType::Node, CommandKind::Build) => "npm run build --if-present",
            (ProjectType::Node, CommandKind::Test) => "npm test",
            (ProjectType::Python, CommandKind::Build) => "python -m compileall -q .",
            (ProjectType::Python, CommandKind::Test) => "python -m pytest",
            (ProjectType::Make, CommandKind::Build) => "make",
            (ProjectType::Make, CommandKind::Test) => "make test",
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProjectType::Rust => "rust",
            ProjectType::Swift => "swift",
            ProjectType::Go => "go",
            ProjectType::Node => "node",
            ProjectType::Python => "python",
            ProjectType::Make => "make",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Build,
    Test,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Build => write!(f, "build"),
            CommandKind::Test => write!(f, "test"),
        }
    }
}

/// Explicit commands that override detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildConfig {
    pub build_command: Option<String>,
    pub test_command: Option<String>,
}

impl BuildConfig {
    fn command_for(&self, kind: CommandKind) -> Option<&str> {
        match kind {
            CommandKind::Build => self.build_command.as_deref(),
            CommandKind::Test => self.test_command.as_deref(),
        }
        .map(str::trim)
        .filter(|c| !c.is_empty())
    }
}

/// Runs project builds and tests.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// The shell command `run` would execute, if any applies.
    fn resolve(&self, kind: CommandKind, dir: &Path, config: &BuildConfig) -> Option<String>;

    async fn run(
        &self,
        kind: CommandKind,
        dir: &Path,
        config: &BuildConfig,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError>;

    async fn run_build(
        &self,
        dir: &Path,
        config: &BuildConfig,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        self.run(CommandKind::Build, dir, config, timeout, cancel).await
    }

    async fn run_tests(
        &self,
        dir: &Path,
        config: &BuildConfig,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        self.run(CommandKind::Test, dir, config, timeout, cancel).await
    }
}

/// [`BuildRunner`] that shells out via `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellBuildRunner;

#[async_trait]
impl BuildRunner for ShellBuildRunner {
    fn resolve(&self, kind: CommandKind, dir: &Path, config: &BuildConfig) -> Option<String> {
        config
            .command_for(kind)
            .map(str::to_string)
            .or_else(|| ProjectType::detect(dir).map(|p| p.default_command(kind).to_string()))
    }

    async fn run(
        &self,
        kind: CommandKind,
        dir: &Path,
        config: &BuildConfig,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        let command = self
            .resolve(kind, dir, config)
            .ok_or_else(|| CommandError::NoBuildSystem {
                dir: dir.to_path_buf(),
            })?;
        info!(kind = %kind, command = %command, "Running project command");
        run_command("sh", &["-c", &command], dir, timeout, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_detect_project_types() {
        let cases = [
            ("Cargo.toml", ProjectType::Rust),
            ("package.json", ProjectType::Node),
            ("go.mod", ProjectType::Go),
            ("pyproject.toml", ProjectType::Python),
            ("setup.py", ProjectType::Python),
            ("Package.swift", ProjectType::Swift),
            ("Makefile", ProjectType::Make),
        ];
        for (manifest, expected) in cases {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join(manifest), "").unwrap();
            assert_eq!(ProjectType::detect(dir.path()), Some(expected), "{}", manifest);
        }
    }

    #[test]
    fn test_detect_prefers_earlier_manifest() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Makefile"), "").unwrap();
        fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        assert_eq!(ProjectType::detect(dir.path()), Some(ProjectType::Rust));
    }

    #[test]
    fn test_detect_nothing() {
        let dir = tempdir().unwrap();
        assert_eq!(ProjectType::detect(dir.path()), None);
    }

    #[test]
    fn test_config_overrides_detection() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        let config = BuildConfig {
            build_command: Some("cargo build --release".into()),
            test_command: Some("   ".into()),
        };
        let runner = ShellBuildRunner;
        assert_eq!(
            runner.resolve(CommandKind::Build, dir.path(), &config).as_deref(),
            Some("cargo build --release")
        );
        assert_eq!(
            runner.resolve(CommandKind::Test, dir.path(), &config).as_deref(),
            Some("cargo test")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_build_success_and_failure() {
        let dir = tempdir().unwrap();
        let runner = ShellBuildRunner;
        let config = BuildConfig {
            build_command: Some("echo built".into()),
            test_command: Some("echo '1 failed' >&2; exit 101".into()),
        };
        let cancel = CancellationToken::new();

        let build = runner
            .run_build(dir.path(), &config, Duration::from_secs(10), &cancel)
            .await
            .unwrap();
        assert!(build.success);
        assert_eq!(build.output, "built");

        let tests = runner
            .run_tests(dir.path(), &config, Duration::from_secs(10), &cancel)
            .await
            .unwrap();
        assert!(!tests.success);
        assert_eq!(tests.exit_code, 101);
        assert_eq!(tests.error_output.as_deref(), Some("1 failed"));
    }

    #[tokio::test]
    async fn test_run_without_build_system() {
        let dir = tempdir().unwrap();
        let err = ShellBuildRunner
            .run_build(
                dir.path(),
                &BuildConfig::default(),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NoBuildSystem { .. }));
    }
}
