//! Layered configuration for conductor.
//!
//! Settings are read from `.conductor/conductor.toml`, then environment
//! variables, then CLI flags. A missing file means all defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [agent]
//! command = "claude"
//! model = "opus"
//! extra_args = ["--add-dir", "../shared"]
//! skip_permissions = false
//! context_window_tokens = 200000
//! handoff_threshold = "10%"
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_secs = 1.0
//! backoff_multiplier = 2.0
//! max_delay_secs = 30.0
//!
//! [autonomous]
//! auto_answer = false
//! failure_handling = "retry_then_skip"
//! max_task_retries = 2
//! run_build_after_commit = true
//! run_tests_after_commit = true
//! consecutive_failures_before_fallback = 3
//! fallback_on_command_failure = true
//! max_build_fix_attempts = 3
//! max_test_fix_attempts = 3
//!
//! [timeouts]
//! plan_mode_secs = 600
//! execution_secs = 1800
//! commit_secs = 300
//! build_secs = 900
//!
//! [build]
//! build_command = "cargo build --workspace"
//! test_command = "cargo test --workspace"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::build::BuildConfig;
use crate::compaction::{DEFAULT_CONTEXT_WINDOW_TOKENS, HandoffThreshold, parse_handoff_threshold};
use crate::errors::ConfigError;
use crate::fallback::{AutonomousConfig, FailureHandling};
use crate::phase::TimeoutConfig;
use crate::retry::RetryConfig;

/// Name of the per-project state directory.
pub const CONDUCTOR_DIR: &str = ".conductor";

/// Name of the config file inside [`CONDUCTOR_DIR`].
pub const CONFIG_FILE: &str = "conductor.toml";

/// Agent CLI settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent executable (default: "claude")
    #[serde(default)]
    pub command: Option<String>,
    /// Model passed via `--model`
    #[serde(default)]
    pub model: Option<String>,
    /// Extra arguments appended to every invocation
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Use `--dangerously-skip-permissions` instead of `acceptEdits` for editing phases
    #[serde(default)]
    pub skip_permissions: bool,
    #[serde(default = "default_context_window_tokens")]
    pub context_window_tokens: u64,
    /// Percentage of the window ("10%") or absolute tokens remaining ("20000")
    #[serde(default = "default_handoff_threshold")]
    pub handoff_threshold: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            model: None,
            extra_args: Vec::new(),
            skip_permissions: false,
            context_window_tokens: default_context_window_tokens(),
            handoff_threshold: default_handoff_threshold(),
        }
    }
}

fn default_context_window_tokens() -> u64 {
    DEFAULT_CONTEXT_WINDOW_TOKENS
}

fn default_handoff_threshold() -> String {
    "10%".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_secs() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_secs() -> f64 {
    30.0
}

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: secs(self.initial_delay_secs),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: secs(self.max_delay_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomousSection {
    #[serde(default)]
    pub auto_answer: bool,
    #[serde(default)]
    pub failure_handling: FailureHandling,
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,
    #[serde(default = "default_true")]
    pub run_build_after_commit: bool,
    #[serde(default = "default_true")]
    pub run_tests_after_commit: bool,
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures_before_fallback: u32,
    #[serde(default = "default_true")]
    pub fallback_on_command_failure: bool,
    #[serde(default = "default_fix_attempts")]
    pub max_build_fix_attempts: u32,
    #[serde(default = "default_fix_attempts")]
    pub max_test_fix_attempts: u32,
}

impl Default for AutonomousSection {
    fn default() -> Self {
        Self {
            auto_answer: false,
            failure_handling: FailureHandling::default(),
            max_task_retries: default_max_task_retries(),
            run_build_after_commit: true,
            run_tests_after_commit: true,
            consecutive_failures_before_fallback: default_consecutive_failures(),
            fallback_on_command_failure: true,
            max_build_fix_attempts: default_fix_attempts(),
            max_test_fix_attempts: default_fix_attempts(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_task_retries() -> u32 {
    2
}

fn default_consecutive_failures() -> u32 {
    3
}

fn default_fix_attempts() -> u32 {
    3
}

impl AutonomousSection {
    pub fn to_autonomous_config(&self) -> AutonomousConfig {
        AutonomousConfig {
            auto_answer_enabled: self.auto_answer,
            auto_failure_handling: self.failure_handling,
            max_task_retries: self.max_task_retries,
            run_build_after_commit: self.run_build_after_commit,
            run_tests_after_commit: self.run_tests_after_commit,
            consecutive_failures_before_fallback: self.consecutive_failures_before_fallback,
            fallback_on_command_failure: self.fallback_on_command_failure,
            max_build_fix_attempts: self.max_build_fix_attempts,
            max_test_fix_attempts: self.max_test_fix_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_plan_mode_secs")]
    pub plan_mode_secs: u64,
    #[serde(default = "default_execution_secs")]
    pub execution_secs: u64,
    #[serde(default = "default_commit_secs")]
    pub commit_secs: u64,
    #[serde(default = "default_build_secs")]
    pub build_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            plan_mode_secs: default_plan_mode_secs(),
            execution_secs: default_execution_secs(),
            commit_secs: default_commit_secs(),
            build_secs: default_build_secs(),
        }
    }
}

fn default_plan_mode_secs() -> u64 {
    600
}

fn default_execution_secs() -> u64 {
    1800
}

fn default_commit_secs() -> u64 {
    300
}

fn default_build_secs() -> u64 {
    900
}

impl TimeoutsSection {
    pub fn to_timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig {
            plan_mode: Duration::from_secs(self.plan_mode_secs),
            execution: Duration::from_secs(self.execution_secs),
            commit: Duration::from_secs(self.commit_secs),
            command: Duration::from_secs(self.build_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSection {
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
}

impl BuildSection {
    pub fn to_build_config(&self) -> BuildConfig {
        BuildConfig {
            build_command: self.build_command.clone(),
            test_command: self.test_command.clone(),
        }
    }
}

/// The complete conductor.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub autonomous: AutonomousSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub build: BuildSection,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `conductor.toml` from the given state directory, or defaults if
    /// the file doesn't exist.
    pub fn load_or_default(conductor_dir: &Path) -> Result<Self> {
        let config_path = conductor_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Agent command (file → `CLAUDE_CMD` → "claude").
    pub fn agent_cmd(&self) -> String {
        self.agent
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Model (`CONDUCTOR_MODEL` overrides the file).
    pub fn model(&self) -> Option<String> {
        std::env::var("CONDUCTOR_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.agent.model.clone())
    }

    pub fn handoff_threshold(&self) -> Result<HandoffThreshold> {
        parse_handoff_threshold(&self.agent.handoff_threshold)
            .map_err(|e| ConfigError::Invalid(format!("handoff_threshold: {:#}", e)).into())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if parse_handoff_threshold(&self.agent.handoff_threshold).is_err() {
            warnings.push(format!(
                "Invalid handoff_threshold '{}': should be a percentage (e.g., '10%') or a token count",
                self.agent.handoff_threshold
            ));
        }
        if self.agent.context_window_tokens == 0 {
            warnings.push("context_window_tokens must be greater than zero".to_string());
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; one attempt will still be made".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "retry.backoff_multiplier {} is below 1.0; delays will shrink",
                self.retry.backoff_multiplier
            ));
        }
        if self.retry.initial_delay_secs > self.retry.max_delay_secs {
            warnings.push(format!(
                "retry.initial_delay_secs ({}) exceeds max_delay_secs ({})",
                self.retry.initial_delay_secs, self.retry.max_delay_secs
            ));
        }
        if self.autonomous.consecutive_failures_before_fallback == 0 {
            warnings.push(
                "autonomous.consecutive_failures_before_fallback is 0; treated as 1".to_string(),
            );
        }
        for (name, value) in [
            ("plan_mode_secs", self.timeouts.plan_mode_secs),
            ("execution_secs", self.timeouts.execution_secs),
            ("commit_secs", self.timeouts.commit_secs),
            ("build_secs", self.timeouts.build_secs),
        ] {
            if value == 0 {
                warnings.push(format!("timeouts.{} is 0; every run would time out", name));
            }
        }

        warnings
    }
}

/// Command-line overrides, applied on top of file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub model: Option<String>,
    pub auto_answer: bool,
    pub failure_handling: Option<FailureHandling>,
    pub skip_build: bool,
    pub skip_tests: bool,
}

/// Merged configuration: file → environment → CLI.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub toml: ConductorToml,
    pub verbose: bool,
    pub cli: CliOverrides,
}

impl ConductorConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .map_err(|_| ConfigError::MissingProjectPath {
                path: project_dir.clone(),
            })?;
        let conductor_dir = project_dir.join(CONDUCTOR_DIR);
        let toml = ConductorToml::load_or_default(&conductor_dir)?;

        Ok(Self {
            project_dir,
            conductor_dir,
            toml,
            verbose: false,
            cli: CliOverrides::default(),
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool, cli: CliOverrides) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli = cli;
        Ok(config)
    }

    pub fn agent_cmd(&self) -> String {
        self.toml.agent_cmd()
    }

    /// Model (CLI → env → file).
    pub fn model(&self) -> Option<String> {
        self.cli.model.clone().or_else(|| self.toml.model())
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.toml.retry.to_retry_config()
    }

    pub fn autonomous_config(&self) -> AutonomousConfig {
        let mut config = self.toml.autonomous.to_autonomous_config();
        if self.cli.auto_answer {
            config.auto_answer_enabled = true;
        }
        if let Some(handling) = self.cli.failure_handling {
            config.auto_failure_handling = handling;
        }
        if self.cli.skip_build {
            config.run_build_after_commit = false;
        }
        if self.cli.skip_tests {
            config.run_tests_after_commit = false;
        }
        config
    }

    pub fn config_file(&self) -> PathBuf {
        self.conductor_dir.join(CONFIG_FILE)
    }

    pub fn plan_file(&self) -> PathBuf {
        self.conductor_dir.join("plan.md")
    }

    pub fn state_file(&self) -> PathBuf {
        self.conductor_dir.join("state")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.conductor_dir.join("logs")
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
