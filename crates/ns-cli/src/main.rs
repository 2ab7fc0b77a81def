mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ns_core::config::Config;

/// nightshift -- overnight maintenance runs for your repositories.
#[derive(Parser)]
#[command(name = "nightshift", version, about)]
struct Cli {
    /// Path to the config file (default: ~/.config/nightshift/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Select and execute tasks now (default: one project).
    Run {
        /// Simulate: select tasks but invoke nothing.
        #[arg(long)]
        dry_run: bool,
        /// Run only this project directory.
        #[arg(short, long)]
        project: Option<String>,
        /// Cap on projects for this pass.
        #[arg(long, default_value_t = 1)]
        max_projects: usize,
        /// Cap on tasks per project.
        #[arg(long, default_value_t = 3)]
        max_tasks: usize,
        /// Per-task agent timeout, e.g. "30m".
        #[arg(long)]
        timeout: Option<String>,
        /// Skip the interactive confirmation.
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Run the background daemon (snapshot ticker + scheduled runs).
    Daemon,

    /// Show budget state; subcommands manage calibration snapshots.
    Budget {
        #[command(subcommand)]
        command: Option<commands::budget::BudgetCommands>,
    },

    /// Show projects, recent runs, and aggregate stats.
    Status,

    /// Write a default config file if none exists.
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path).context("loading config")?,
        None => Config::load().context("loading config")?,
    };
    ns_telemetry::init_logging(&config.logging);

    match cli.command {
        None | Some(Commands::Status) => commands::status::run(config).await,
        Some(Commands::Run {
            dry_run,
            project,
            max_projects,
            max_tasks,
            timeout,
            yes,
        }) => {
            commands::run::run(
                config,
                commands::run::Flags {
                    dry_run,
                    project,
                    max_projects,
                    max_tasks,
                    timeout,
                    yes,
                },
            )
            .await
        }
        Some(Commands::Daemon) => commands::daemon::run(config).await,
        Some(Commands::Budget { command }) => commands::budget::run(config, command).await,
        Some(Commands::Init) => commands::init::run(cli.config),
    }
}
