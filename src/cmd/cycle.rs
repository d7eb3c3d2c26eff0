//! `forge-grid cycle`: one management cycle in the foreground.

use std::str::FromStr;

use anyhow::Result;
use forge_grid::config::GridConfig;
use forge_grid::coordinator::{Coordinator, CoordinatorSettings, CyclePhase};

use super::{build_services, check_config};

pub async fn cmd_cycle(config: GridConfig, phase: Option<&str>) -> Result<()> {
    let phase = phase
        .map(CyclePhase::from_str)
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;
    check_config(&config)?;

    let services = build_services(&config)?;
    let coordinator = Coordinator::new(services, CoordinatorSettings::from_config(&config));
    coordinator.adopt_active_executions().await?;

    let report = match phase {
        Some(phase) => coordinator.run_phase(phase).await,
        None => coordinator.run_cycle().await,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
