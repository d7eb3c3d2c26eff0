use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use forge_grid::config::GridConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "forge-grid")]
#[command(version, about = "Autonomous issue-to-execution coordinator")]
pub struct Cli {
    /// Log at debug level (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to grid.toml. Defaults to .forge-grid/grid.toml
    #[arg(long, global = true, env = "GRID_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server and the management loop
    Serve,
    /// Run one management cycle and print the report as JSON
    Cycle {
        /// Run a single phase instead of the whole cycle
        #[arg(long)]
        phase: Option<String>,
    },
    /// Create the config file and database, and bootstrap repository labels
    Init {
        /// Do not create labels in the target repository
        #[arg(long)]
        skip_labels: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration (secrets omitted)
    Show,
    /// Check the configuration and report problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = GridConfig::load_layered(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    let _log_guard = forge_grid::logging::init_logging(&config.logging)?;

    match &cli.command {
        Commands::Serve => cmd::cmd_serve(config).await?,
        Commands::Cycle { phase } => cmd::cmd_cycle(config, phase.as_deref()).await?,
        Commands::Init { skip_labels } => {
            cmd::cmd_init(&config, cli.config.as_deref(), *skip_labels).await?
        }
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
