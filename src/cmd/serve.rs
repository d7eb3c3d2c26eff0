//! `forge-grid serve`: HTTP server, coordinator actor and management loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use forge_grid::config::GridConfig;
use forge_grid::coordinator::management_loop::ManagementLoop;
use forge_grid::coordinator::{Coordinator, CoordinatorSettings, spawn_coordinator};
use forge_grid::grid::GridEvent;
use forge_grid::server::{AppState, build_router, serve};
use tokio::sync::{broadcast, watch};

use super::{build_services, check_config};

pub async fn cmd_serve(config: GridConfig) -> Result<()> {
    check_config(&config)?;
    let services = build_services(&config)?;
    let settings = CoordinatorSettings::from_config(&config);
    let coordinator = Coordinator::new(services.clone(), settings);

    let adopted = coordinator
        .adopt_active_executions()
        .await
        .context("Failed to reload active executions")?;
    if adopted > 0 {
        tracing::info!(adopted, "resumed tracking of active executions");
    }

    tokio::spawn(log_grid_events(services.grid.subscribe()));

    let budget = coordinator.budget().clone();
    let (handle, actor) = spawn_coordinator(coordinator);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let management = ManagementLoop::new(
        handle.clone(),
        config.coordinator.interval(),
        config.coordinator.startup_delay(),
    );
    let loop_task = tokio::spawn(management.run(shutdown_rx.clone()));

    let state = Arc::new(AppState {
        coordinator: handle,
        db: services.db.clone(),
        budget,
        repo: config.coordinator.target_repo.clone(),
    });
    let router = build_router(state);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown requested");
        let _ = signal_tx.send(true);
    });

    let mut server_shutdown = shutdown_rx.clone();
    let served = serve(&config.server.addr(), router, async move {
        while !*server_shutdown.borrow_and_update() {
            if server_shutdown.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    // Also covers the server failing to bind.
    let _ = shutdown_tx.send(true);

    // The router held one handle and the loop the other; once both are gone
    // the actor drains its queue and exits.
    if let Err(e) = loop_task.await {
        tracing::warn!(error = %e, "management loop task failed");
    }
    if let Err(e) = actor.await {
        tracing::warn!(error = %e, "coordinator task failed");
    }
    served
}

async fn log_grid_events(mut rx: broadcast::Receiver<GridEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match &event {
                GridEvent::Started { execution_id, issue_number } => {
                    tracing::info!(execution_id = %execution_id, issue = issue_number, "grid: started")
                }
                GridEvent::Completed { execution_id, issue_number, pr_number } => {
                    tracing::info!(execution_id = %execution_id, issue = issue_number, pr = ?pr_number, "grid: completed")
                }
                GridEvent::Failed { execution_id, issue_number, error } => {
                    tracing::warn!(execution_id = %execution_id, issue = issue_number, error = %error, "grid: failed")
                }
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "grid event log lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
