use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::conductor_config::{CliOverrides, ConductorConfig};
use crate::orchestrator::{AgentSettings, WorkflowSettings};

/// Runtime configuration for conductor.
///
/// This struct bridges the layered ConductorConfig with what the binary needs
/// to wire an orchestrator: resolved paths, the agent command, and the
/// settings handed to the workflow and the agent runner.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub plan_file: PathBuf,
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
    pub transcript_dir: PathBuf,
    pub agent_cmd: String,
    pub model: Option<String>,
    pub skip_permissions: bool,
    pub verbose: bool,
    /// The underlying layered configuration
    conductor_config: ConductorConfig,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool, cli: CliOverrides) -> Result<Self> {
        let conductor_config = ConductorConfig::with_cli_args(project_dir, verbose, cli)?;

        let conductor_dir = conductor_config.conductor_dir.clone();
        Ok(Self {
            project_dir: conductor_config.project_dir.clone(),
            plan_file: conductor_config.plan_file(),
            state_file: conductor_config.state_file(),
            log_dir: conductor_config.log_dir(),
            transcript_dir: conductor_dir.join("transcripts"),
            conductor_dir,
            agent_cmd: conductor_config.agent_cmd(),
            model: conductor_config.model(),
            skip_permissions: conductor_config.toml.agent.skip_permissions,
            verbose,
            conductor_config,
        })
    }

    pub fn conductor_config(&self) -> &ConductorConfig {
        &self.conductor_config
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.transcript_dir)
            .context("Failed to create transcript directory")?;
        Ok(())
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            command: self.agent_cmd.clone(),
            model: self.model.clone(),
            extra_args: self.conductor_config.toml.agent.extra_args.clone(),
            skip_permissions: self.skip_permissions,
            retry: self.conductor_config.retry_config(),
            transcript_dir: Some(self.transcript_dir.clone()),
        }
    }

    pub fn workflow_settings(&self) -> Result<WorkflowSettings> {
        let toml = &self.conductor_config.toml;
        let mut settings = WorkflowSettings::new(self.project_dir.clone());
        settings.autonomous = self.conductor_config.autonomous_config();
        settings.retry = self.conductor_config.retry_config();
        settings.timeouts = toml.timeouts.to_timeout_config();
        settings.build = toml.build.to_build_config();
        settings.context_window_tokens = toml.agent.context_window_tokens;
        settings.handoff_threshold = toml.handoff_threshold()?;
        settings.plan_file = Some(self.plan_file.clone());
        settings.journal_file = Some(self.state_file.clone());
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::HandoffThreshold;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_paths_live_in_conductor_directory() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), true, CliOverrides::default()).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert!(config.verbose);
        assert_eq!(config.conductor_dir, root.join(".conductor"));
        assert_eq!(config.plan_file, root.join(".conductor/plan.md"));
        assert_eq!(config.state_file, root.join(".conductor/state"));
        assert_eq!(config.log_dir, root.join(".conductor/logs"));
    }

    #[test]
    fn test_missing_project_dir_is_an_error() {
        let dir = tempdir().unwrap();
        let result = Config::new(dir.path().join("nope"), false, CliOverrides::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false, CliOverrides::default()).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.log_dir.exists());
        assert!(config.transcript_dir.exists());
    }

    #[test]
    fn test_workflow_settings_from_file_and_cli() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".conductor")).unwrap();
        fs::write(
            dir.path().join(".conductor/conductor.toml"),
            r#"
[agent]
context_window_tokens = 100000
handoff_threshold = "5000"
extra_args = ["--add-dir", "../shared"]

[autonomous]
max_task_retries = 4

[timeouts]
build_secs = 60

[build]
test_command = "make check"
"#,
        )
        .unwrap();

        let cli = CliOverrides {
            skip_build: true,
            ..CliOverrides::default()
        };
        let config = Config::new(dir.path().to_path_buf(), false, cli).unwrap();
        let settings = config.workflow_settings().unwrap();
        assert_eq!(settings.context_window_tokens, 100_000);
        assert_eq!(settings.handoff_threshold, HandoffThreshold::Absolute(5000));
        assert_eq!(settings.autonomous.max_task_retries, 4);
        assert!(!settings.autonomous.run_build_after_commit);
        assert_eq!(settings.timeouts.command.as_secs(), 60);
        assert_eq!(settings.build.test_command.as_deref(), Some("make check"));
        assert_eq!(settings.journal_file, Some(config.state_file.clone()));

        let agent = config.agent_settings();
        assert_eq!(agent.extra_args, vec!["--add-dir", "../shared"]);
        assert_eq!(agent.transcript_dir, Some(config.transcript_dir.clone()));
    }

    #[test]
    fn test_bad_threshold_fails_workflow_settings() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".conductor")).unwrap();
        fs::write(
            dir.path().join(".conductor/conductor.toml"),
            "[agent]\nhandoff_threshold = \"lots\"\n",
        )
        .unwrap();
        let config = Config::new(dir.path().to_path_buf(), false, CliOverrides::default()).unwrap();
        assert!(config.workflow_settings().is_err());
    }
}
