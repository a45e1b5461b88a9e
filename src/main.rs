//! Cryostat - JVM target discovery and capture automation CLI
//!
#![doc = "Main entry point for the Cryostat command-line tool."]

use anyhow::Result;

use cryostat::cli::{Cli, Commands};
use cryostat::commands;
use cryostat::config::Config;
use cryostat::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let config_path = cli.config.as_deref().unwrap_or("config/cryostat.yaml");
    let config = Config::load(config_path, &cli)?;

    init_logging(&config.logging)?;
    config.validate()?;

    match cli.command {
        Commands::Discover => {
            tracing::info!("Listing discoverable targets");
            commands::discover::run_discover(&config).await
        }
        Commands::Tree => {
            tracing::info!("Building discovery tree");
            commands::discover::run_tree(&config).await
        }
        Commands::Rules { command } => {
            tracing::debug!(?command, "Running rule command");
            commands::rules::run_rules(&config, command)
        }
    }
}
