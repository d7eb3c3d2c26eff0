//! `forge-grid init`: config file, database and repository labels.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use forge_grid::config::{DEFAULT_CONFIG_PATH, GridConfig};
use forge_grid::tracker::{GitHubClient, LabelManager};

use super::open_store;

pub async fn cmd_init(config: &GridConfig, config_path: Option<&Path>, skip_labels: bool) -> Result<()> {
    let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
    if path.exists() {
        println!("Config exists: {}", path.display());
    } else {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(&GridConfig::default())
            .context("Failed to render default config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote default config: {}", path.display());
    }

    open_store(config)?;
    println!("Database ready: {}", config.store.path.display());

    if skip_labels {
        return Ok(());
    }
    let repo = &config.coordinator.target_repo;
    if repo.is_empty() || config.github.token.is_none() {
        println!("Skipping labels: set GRID_TARGET_REPO and GITHUB_TOKEN to create them.");
        return Ok(());
    }
    let github = Arc::new(GitHubClient::new(&config.github)?);
    LabelManager::new(github)
        .ensure_labels_exist(repo)
        .await
        .with_context(|| format!("Failed to create labels in {}", repo))?;
    println!("Labels ready in {}", repo);
    Ok(())
}
