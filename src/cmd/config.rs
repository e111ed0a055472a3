//! Configuration view and validation commands: `conductor config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use conductor::conductor_config::{CONDUCTOR_DIR, CONFIG_FILE, ConductorConfig, ConductorToml};

    let conductor_dir = project_dir.join(CONDUCTOR_DIR);
    let config_path = conductor_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                ConductorToml::load(&config_path)?
            } else {
                println!("No conductor.toml found at {}", config_path.display());
                println!("Using default configuration.");
                ConductorToml::default()
            };
            println!();

            let agent = &toml.agent;
            println!("[agent]");
            if let Some(cmd) = &agent.command {
                println!("  command = \"{}\"", cmd);
            }
            if let Some(model) = &agent.model {
                println!("  model = \"{}\"", model);
            }
            if !agent.extra_args.is_empty() {
                println!("  extra_args = {:?}", agent.extra_args);
            }
            println!("  skip_permissions = {}", agent.skip_permissions);
            println!("  context_window_tokens = {}", agent.context_window_tokens);
            println!("  handoff_threshold = \"{}\"", agent.handoff_threshold);
            println!();

            let retry = &toml.retry;
            println!("[retry]");
            println!("  max_attempts = {}", retry.max_attempts);
            println!("  initial_delay_secs = {}", retry.initial_delay_secs);
            println!("  backoff_multiplier = {}", retry.backoff_multiplier);
            println!("  max_delay_secs = {}", retry.max_delay_secs);
            println!();

            let auto = &toml.autonomous;
            println!("[autonomous]");
            println!("  auto_answer = {}", auto.auto_answer);
            println!("  failure_handling = \"{}\"", auto.failure_handling);
            println!("  max_task_retries = {}", auto.max_task_retries);
            println!("  run_build_after_commit = {}", auto.run_build_after_commit);
            println!("  run_tests_after_commit = {}", auto.run_tests_after_commit);
            println!(
                "  consecutive_failures_before_fallback = {}",
                auto.consecutive_failures_before_fallback
            );
            println!(
                "  fallback_on_command_failure = {}",
                auto.fallback_on_command_failure
            );
            println!("  max_build_fix_attempts = {}", auto.max_build_fix_attempts);
            println!("  max_test_fix_attempts = {}", auto.max_test_fix_attempts);
            println!();

            let timeouts = &toml.timeouts;
            println!("[timeouts]");
            println!("  plan_mode_secs = {}", timeouts.plan_mode_secs);
            println!("  execution_secs = {}", timeouts.execution_secs);
            println!("  commit_secs = {}", timeouts.commit_secs);
            println!("  build_secs = {}", timeouts.build_secs);
            println!();

            if toml.build.build_command.is_some() || toml.build.test_command.is_some() {
                println!("[build]");
                if let Some(cmd) = &toml.build.build_command {
                    println!("  build_command = \"{}\"", cmd);
                }
                if let Some(cmd) = &toml.build.test_command {
                    println!("  test_command = \"{}\"", cmd);
                }
                println!();
            }

            // Show effective values (including env overrides)
            println!("Effective values (with env overrides):");
            let config = ConductorConfig::new(project_dir.to_path_buf())?;
            println!("  agent command = \"{}\"", config.agent_cmd());
            match config.model() {
                Some(model) => println!("  model = \"{}\"", model),
                None => println!("  model = (agent default)"),
            }
            println!();

            if !config_path.exists() {
                println!("Run 'conductor config init' to create a conductor.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conductor.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ConductorToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("conductor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&conductor_dir)?;
            ConductorToml::default().save(&config_path)?;

            println!("Created conductor.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [agent] command, model, handoff_threshold");
            println!("  - [autonomous] failure_handling, auto_answer, fix attempts");
            println!("  - [build] build_command, test_command");
            println!();
        }
    }

    Ok(())
}
