//! Configuration view and validation commands: `forge-grid config`.

use anyhow::{Context, Result};
use forge_grid::config::GridConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &GridConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let rendered = toml::to_string_pretty(config).context("Failed to render config")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate()?;
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration is valid with {} warning(s):", warnings.len());
                for w in &warnings {
                    println!("  - {}", w);
                }
            }
        }
    }
    Ok(())
}
