//! Execution backends.
//!
//! An [`ExecutionGrid`] starts one isolated, short-lived run per execution and
//! forgets about it; the run reports back through the completion callback.
//! Backends publish lifecycle events on an [`EventBus`].

pub mod fly;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grid_common::ExecutionMode;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use fly::FlyGrid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionConfig {
    pub repo_url: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Allocated by the coordinator before launch so the callback can be
    /// matched even if the launch response is lost.
    pub execution_id: String,
    pub issue_number: u64,
    pub mode: ExecutionMode,
    pub config: ExecutionConfig,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchReceipt {
    pub execution_id: String,
    pub external_run_id: Option<String>,
}

/// A run the backend is tracking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GridExecution {
    pub execution_id: String,
    pub issue_number: u64,
    pub mode: ExecutionMode,
    pub external_run_id: Option<String>,
    pub launched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum GridEvent {
    Started {
        execution_id: String,
        issue_number: u64,
    },
    Completed {
        execution_id: String,
        issue_number: u64,
        pr_number: Option<u64>,
    },
    Failed {
        execution_id: String,
        issue_number: u64,
        error: String,
    },
}

impl GridEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Started { execution_id, .. }
            | Self::Completed { execution_id, .. }
            | Self::Failed { execution_id, .. } => execution_id,
        }
    }
}

#[async_trait]
pub trait ExecutionGrid: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchReceipt>;

    async fn status(&self, execution_id: &str) -> Option<GridExecution>;

    /// Best-effort termination. `Ok(false)` when the run is unknown.
    async fn cancel(&self, execution_id: &str) -> Result<bool>;

    async fn list_active(&self) -> Vec<GridExecution>;

    fn subscribe(&self) -> broadcast::Receiver<GridEvent>;

    /// Re-register a run that was launched by a previous process.
    fn adopt(&self, run: GridExecution);

    /// Stop tracking a run after its terminal transition and publish `event`.
    async fn finish(&self, execution_id: &str, event: GridEvent);
}

// ── Shared plumbing for backends ─────────────────────────────────────

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GridEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: GridEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// In-memory index of runs a backend has launched.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<String, GridExecution>>>,
}

impl RunRegistry {
    pub fn insert(&self, run: GridExecution) {
        if let Ok(mut runs) = self.runs.write() {
            runs.insert(run.execution_id.clone(), run);
        }
    }

    pub fn get(&self, execution_id: &str) -> Option<GridExecution> {
        self.runs.read().ok()?.get(execution_id).cloned()
    }

    pub fn remove(&self, execution_id: &str) -> Option<GridExecution> {
        self.runs.write().ok()?.remove(execution_id)
    }

    pub fn list(&self) -> Vec<GridExecution> {
        let mut runs: Vec<_> = self
            .runs
            .read()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        runs.sort_by_key(|r| r.launched_at);
        runs
    }
}
