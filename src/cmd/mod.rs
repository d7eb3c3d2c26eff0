//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `cycle`   | `Cycle`          |
//! | `init`    | `Init`           |
//! | `config`  | `Config`         |

pub mod config;
pub mod cycle;
pub mod init;
pub mod serve;

use std::sync::Arc;

use anyhow::{Context, Result};
use forge_grid::config::GridConfig;
use forge_grid::coordinator::{DbHandle, GridDb, Services};
use forge_grid::grid::FlyGrid;
use forge_grid::llm::build_completion_service;
use forge_grid::tracker::GitHubClient;

pub use config::cmd_config;
pub use cycle::cmd_cycle;
pub use init::cmd_init;
pub use serve::cmd_serve;

pub fn open_store(config: &GridConfig) -> Result<DbHandle> {
    let db = GridDb::new(&config.store.path).with_context(|| {
        format!("Failed to open database at {}", config.store.path.display())
    })?;
    Ok(DbHandle::new(db))
}

/// Build the production collaborators from configuration.
pub fn build_services(config: &GridConfig) -> Result<Services> {
    let github = Arc::new(GitHubClient::new(&config.github)?);
    let grid = Arc::new(FlyGrid::new(&config.fly, config.orchestrator_url())?);
    let completion = build_completion_service(&config.completion)?;
    Ok(Services {
        tracker: github.clone(),
        code_host: github,
        grid,
        completion,
        db: open_store(config)?,
    })
}

/// Fail on invalid settings, log warnings otherwise.
pub fn check_config(config: &GridConfig) -> Result<()> {
    for warning in config.validate()? {
        tracing::warn!(%warning, "configuration");
    }
    anyhow::ensure!(
        !config.coordinator.target_repo.is_empty(),
        "coordinator.target_repo is required (set GRID_TARGET_REPO)"
    );
    Ok(())
}
