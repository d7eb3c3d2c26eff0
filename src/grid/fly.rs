//! Fly Machines backend: one ephemeral machine per execution.
//!
//! Machines boot the worker image with everything it needs in the
//! environment, run once, and destroy themselves on exit. The worker posts its
//! result to `{ORCHESTRATOR_URL}/api/agent-status`.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{
    EventBus, ExecutionGrid, GridEvent, GridExecution, LaunchReceipt, LaunchRequest, RunRegistry,
};
use crate::config::FlySection;

#[derive(Debug, Serialize)]
struct CreateMachine {
    name: String,
    region: String,
    config: MachineConfig,
}

#[derive(Debug, Serialize)]
struct MachineConfig {
    image: String,
    env: BTreeMap<String, String>,
    guest: Guest,
    auto_destroy: bool,
    restart: RestartPolicy,
}

#[derive(Debug, Serialize)]
struct Guest {
    cpu_kind: &'static str,
    cpus: u32,
    memory_mb: u32,
}

#[derive(Debug, Serialize)]
struct RestartPolicy {
    policy: &'static str,
}

#[derive(Debug, Deserialize)]
struct Machine {
    id: String,
    #[serde(default)]
    state: String,
}

pub struct FlyGrid {
    http: reqwest::Client,
    api_token: String,
    machines_url: String,
    image: String,
    region: String,
    cpus: u32,
    memory_mb: u32,
    orchestrator_url: String,
    registry: RunRegistry,
    events: EventBus,
}

impl FlyGrid {
    pub fn new(config: &FlySection, orchestrator_url: String) -> Result<Self> {
        let api_token = config
            .api_token
            .clone()
            .context("FLY_API_TOKEN is required for the Fly grid")?;
        let app = config
            .app_name
            .as_deref()
            .context("FLY_APP_NAME is required for the Fly grid")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build Fly HTTP client")?;
        Ok(Self {
            http,
            api_token,
            machines_url: format!("{}/apps/{}/machines", config.api_base.trim_end_matches('/'), app),
            image: config.image.clone(),
            region: config.region.clone(),
            cpus: config.cpus,
            memory_mb: config.memory_mb,
            orchestrator_url,
            registry: RunRegistry::default(),
            events: EventBus::default(),
        })
    }

    fn machine_request(&self, request: &LaunchRequest) -> CreateMachine {
        let env = BTreeMap::from([
            ("EXECUTION_ID".to_string(), request.execution_id.clone()),
            ("REPO_URL".to_string(), request.config.repo_url.clone()),
            ("ISSUE_NUMBER".to_string(), request.issue_number.to_string()),
            ("MODE".to_string(), request.mode.as_str().to_string()),
            ("PROMPT".to_string(), request.config.prompt.clone()),
            ("CONTEXT_JSON".to_string(), request.context.to_string()),
            ("ORCHESTRATOR_URL".to_string(), self.orchestrator_url.clone()),
        ]);
        CreateMachine {
            name: format!("worker-{}-{}", request.issue_number, Utc::now().timestamp()),
            region: self.region.clone(),
            config: MachineConfig {
                image: self.image.clone(),
                env,
                guest: Guest {
                    cpu_kind: "shared",
                    cpus: self.cpus,
                    memory_mb: self.memory_mb,
                },
                auto_destroy: true,
                restart: RestartPolicy { policy: "no" },
            },
        }
    }

    async fn destroy_machine(&self, machine_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(format!("{}/{}", self.machines_url, machine_id))
            .bearer_auth(&self.api_token)
            .query(&[("force", "true")])
            .send()
            .await
            .context("Failed to send destroy request to Fly")?;
        let status = resp.status();
        // Auto-destroyed machines are already gone.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Fly destroy returned {}: {}", status, body)
    }
}

#[async_trait]
impl ExecutionGrid for FlyGrid {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchReceipt> {
        let body = self.machine_request(&request);
        let resp = self
            .http
            .post(&self.machines_url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .context("Failed to send machine create request to Fly")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Fly machine create returned {}: {}", status, text);
        }
        let machine: Machine = resp
            .json()
            .await
            .context("Failed to parse Fly machine response")?;

        tracing::info!(
            execution_id = %request.execution_id,
            issue = request.issue_number,
            machine_id = %machine.id,
            state = %machine.state,
            "machine launched"
        );

        self.registry.insert(GridExecution {
            execution_id: request.execution_id.clone(),
            issue_number: request.issue_number,
            mode: request.mode,
            external_run_id: Some(machine.id.clone()),
            launched_at: Utc::now(),
        });
        self.events.publish(GridEvent::Started {
            execution_id: request.execution_id.clone(),
            issue_number: request.issue_number,
        });

        Ok(LaunchReceipt {
            execution_id: request.execution_id,
            external_run_id: Some(machine.id),
        })
    }

    async fn status(&self, execution_id: &str) -> Option<GridExecution> {
        self.registry.get(execution_id)
    }

    async fn cancel(&self, execution_id: &str) -> Result<bool> {
        let Some(run) = self.registry.remove(execution_id) else {
            return Ok(false);
        };
        if let Some(machine_id) = &run.external_run_id {
            self.destroy_machine(machine_id).await?;
        }
        Ok(true)
    }

    async fn list_active(&self) -> Vec<GridExecution> {
        self.registry.list()
    }

    fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.events.subscribe()
    }

    fn adopt(&self, run: GridExecution) {
        self.registry.insert(run);
    }

    async fn finish(&self, execution_id: &str, event: GridEvent) {
        self.registry.remove(execution_id);
        self.events.publish(event);
    }
}
