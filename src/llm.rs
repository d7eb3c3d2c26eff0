//! Text completion backends used for classification and planning.
//!
//! The coordinator only depends on [`CompletionService`]. Two implementations
//! are provided: the Anthropic Messages API over HTTP and the local `claude`
//! CLI in print mode.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::{CompletionBackend, CompletionSection};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Which model class a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Cheap, short answers (classification).
    Fast,
    /// Longer structured output (planning).
    Strong,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub tier: ModelTier,
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

pub fn build_completion_service(config: &CompletionSection) -> Result<Arc<dyn CompletionService>> {
    Ok(match config.backend {
        CompletionBackend::Api => Arc::new(AnthropicClient::new(config)?),
        CompletionBackend::Cli => Arc::new(ClaudeCli::new(config)),
    })
}

// ── Anthropic Messages API ────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    fast_model: String,
}

impl AnthropicClient {
    pub fn new(config: &CompletionSection) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .context("ANTHROPIC_API_KEY is required for the api completion backend")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            api_key,
            endpoint: format!("{}/v1/messages", config.api_base.trim_end_matches('/')),
            model: config.model.clone(),
            fast_model: config.classify_model.clone(),
        })
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast_model,
            ModelTier::Strong => &self.model,
        }
    }
}

#[async_trait]
impl CompletionService for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let body = MessagesRequest {
            model: self.model_for(request.tier),
            max_tokens: request.max_tokens,
            system: request.system.as_deref(),
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("Failed to send request to Anthropic API")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            anyhow::bail!("Anthropic API returned {}: {}", status, message);
        }

        let parsed: MessagesResponse = resp
            .json()
            .await
            .context("Failed to parse Anthropic API response")?;
        Ok(parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

// ── claude CLI ────────────────────────────────────────────────────────

pub struct ClaudeCli {
    claude_cmd: String,
    timeout: Duration,
}

impl ClaudeCli {
    pub fn new(config: &CompletionSection) -> Self {
        Self {
            claude_cmd: config.claude_cmd.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl CompletionService for ClaudeCli {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let mut cmd = Command::new(&self.claude_cmd);
        cmd.args(["--print", "--output-format", "text", "-p", request.prompt.as_str()]);
        if let Some(system) = &request.system {
            cmd.args(["--system", system.as_str()]);
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("claude CLI timed out after {:?}", self.timeout))?
            .context("Failed to run claude CLI")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("claude CLI failed: {}", stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Slice from the first `{` to the last `}` so JSON wrapped in prose or
/// markdown fences still parses.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
