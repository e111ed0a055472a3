use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Autonomous feature-delivery orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit stderr logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deliver a feature end-to-end: plan, implement, build, review, test
    Run(RunArgs),
    /// Parse a plan file and list its tasks
    Plan {
        /// Path to the plan (markdown)
        file: PathBuf,
    },
    /// Show the saved plan and recent phase transitions
    Status,
    /// Clear the saved plan, phase journal, and logs
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(clap::Args, Clone, Debug)]
pub struct RunArgs {
    /// Feature description. Prompted for when omitted.
    #[arg(short, long)]
    pub feature: Option<String>,

    /// Image to attach to the feature request (repeatable)
    #[arg(long = "image", value_name = "PATH")]
    pub images: Vec<PathBuf>,

    /// Answer agent questions with their first option instead of asking
    #[arg(long)]
    pub auto_answer: bool,

    /// Task failure strategy: pause_for_user, retry_then_skip, retry_then_stop
    #[arg(long)]
    pub failure_handling: Option<String>,

    /// Don't run the build after implementation commits
    #[arg(long)]
    pub skip_build: bool,

    /// Don't run tests after test commits
    #[arg(long)]
    pub skip_tests: bool,

    /// Model passed to the agent
    #[arg(long)]
    pub model: Option<String>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conductor.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Only runs write a log file; the other commands are read-mostly.
    let log_dir = matches!(cli.command, Commands::Run(_)).then(|| {
        project_dir
            .join(conductor::conductor_config::CONDUCTOR_DIR)
            .join("logs")
    });
    let _log_guard = conductor::logging::init(cli.verbose, cli.json_logs, log_dir.as_deref())?;

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&cli, project_dir, args.clone()).await?,
        Commands::Plan { file } => cmd::cmd_plan(file)?,
        Commands::Status => cmd::cmd_status(&project_dir)?,
        Commands::Reset { force } => cmd::cmd_reset(&project_dir, *force)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
