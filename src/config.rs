//! Layered configuration for forge-grid.
//!
//! Settings are read from `.forge-grid/grid.toml` (or `--config`), then
//! environment variables override individual fields. A `.env` file in the
//! working directory is loaded into the environment first.
//!
//! ```toml
//! [coordinator]
//! target_repo = "acme/widgets"
//! interval_secs = 300
//! execution_timeout_secs = 3600
//!
//! [budget]
//! max_concurrent = 5
//! max_daily_cost_usd = 50.0
//! max_retries_per_issue = 2
//!
//! [completion]
//! backend = "api"
//!
//! [fly]
//! app_name = "forge-grid-workers"
//! image = "ghcr.io/acme/agent-worker:latest"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::GridError;

pub const DEFAULT_CONFIG_PATH: &str = ".forge-grid/grid.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub completion: CompletionSection,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub fly: FlySection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

// ── Sections ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    /// `owner/name` of the repository whose issues are worked.
    #[serde(default)]
    pub target_repo: String,
    /// Clone URL handed to executions. Derived from `target_repo` when unset.
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_agent_branch_prefix")]
    pub agent_branch_prefix: String,
    /// How far back the pull request phases look before their first watermark.
    #[serde(default = "default_initial_lookback_secs")]
    pub initial_lookback_secs: u64,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_startup_delay_secs() -> u64 {
    30
}

fn default_execution_timeout_secs() -> u64 {
    3600
}

fn default_agent_branch_prefix() -> String {
    "agent/".to_string()
}

fn default_initial_lookback_secs() -> u64 {
    86_400
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            target_repo: String::new(),
            repo_url: None,
            interval_secs: default_interval_secs(),
            startup_delay_secs: default_startup_delay_secs(),
            execution_timeout_secs: default_execution_timeout_secs(),
            agent_branch_prefix: default_agent_branch_prefix(),
            initial_lookback_secs: default_initial_lookback_secs(),
        }
    }
}

impl CoordinatorSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// The initial delay never exceeds one tick interval.
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs.min(self.interval_secs))
    }

    pub fn execution_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.execution_timeout_secs as i64)
    }

    pub fn initial_lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.initial_lookback_secs as i64)
    }

    pub fn repo_url(&self) -> String {
        self.repo_url
            .clone()
            .unwrap_or_else(|| format!("https://github.com/{}.git", self.target_repo))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_max_daily_cost_usd")]
    pub max_daily_cost_usd: f64,
    #[serde(default = "default_max_retries_per_issue")]
    pub max_retries_per_issue: u32,
    /// Charged for a finished execution whose callback reports no cost.
    #[serde(default)]
    pub default_execution_cost_usd: f64,
}

fn default_max_concurrent() -> u32 {
    5
}

fn default_max_daily_cost_usd() -> f64 {
    50.0
}

fn default_max_retries_per_issue() -> u32 {
    2
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_daily_cost_usd: default_max_daily_cost_usd(),
            max_retries_per_issue: default_max_retries_per_issue(),
            default_execution_cost_usd: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionBackend {
    /// Anthropic Messages API over HTTP.
    #[default]
    Api,
    /// Local `claude` CLI in print mode.
    Cli,
}

impl std::str::FromStr for CompletionBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "api" => Ok(Self::Api),
            "cli" => Ok(Self::Cli),
            _ => anyhow::bail!("Invalid completion backend '{}'. Valid values: api, cli", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionSection {
    #[serde(default)]
    pub backend: CompletionBackend,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_anthropic_api_base")]
    pub api_base: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_classify_model")]
    pub classify_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_claude_cmd")]
    pub claude_cmd: String,
}

fn default_anthropic_api_base() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_classify_model() -> String {
    "claude-3-5-haiku-20241022".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_claude_cmd() -> String {
    "claude".to_string()
}

impl Default for CompletionSection {
    fn default() -> Self {
        Self {
            backend: CompletionBackend::default(),
            api_key: None,
            api_base: default_anthropic_api_base(),
            model: default_model(),
            classify_model: default_classify_model(),
            timeout_secs: default_timeout_secs(),
            claude_cmd: default_claude_cmd(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubSection {
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default = "default_github_api_base")]
    pub api_base: String,
    #[serde(default = "default_github_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_github_timeout_secs() -> u64 {
    30
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            token: None,
            api_base: default_github_api_base(),
            timeout_secs: default_github_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlySection {
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default = "default_fly_image")]
    pub image: String,
    #[serde(default = "default_fly_region")]
    pub region: String,
    #[serde(default = "default_fly_cpus")]
    pub cpus: u32,
    #[serde(default = "default_fly_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_fly_api_base")]
    pub api_base: String,
    /// Public base URL workers call back to. Defaults to the server address.
    #[serde(default)]
    pub orchestrator_url: Option<String>,
}

fn default_fly_image() -> String {
    "registry.fly.io/forge-grid-worker:latest".to_string()
}

fn default_fly_region() -> String {
    "iad".to_string()
}

fn default_fly_cpus() -> u32 {
    2
}

fn default_fly_memory_mb() -> u32 {
    4096
}

fn default_fly_api_base() -> String {
    "https://api.machines.dev/v1".to_string()
}

impl Default for FlySection {
    fn default() -> Self {
        Self {
            api_token: None,
            app_name: None,
            image: default_fly_image(),
            region: default_fly_region(),
            cpus: default_fly_cpus(),
            memory_mb: default_fly_memory_mb(),
            api_base: default_fly_api_base(),
            orchestrator_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSection {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".forge-grid/grid.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rotated log files. Stdout only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────

impl GridConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse grid.toml")
    }

    /// File (if present), then `.env`, then process environment.
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides through `lookup` so tests need not touch
    /// the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GRID_TARGET_REPO") {
            self.coordinator.target_repo = v;
        }
        if let Some(v) = lookup("GITHUB_TOKEN") {
            self.github.token = Some(v);
        }
        if let Some(v) = lookup("ANTHROPIC_API_KEY") {
            self.completion.api_key = Some(v);
        }
        if let Some(v) = lookup("CLAUDE_CMD") {
            self.completion.claude_cmd = v;
        }
        if let Some(v) = lookup("FLY_API_TOKEN") {
            self.fly.api_token = Some(v);
        }
        if let Some(v) = lookup("FLY_APP_NAME") {
            self.fly.app_name = Some(v);
        }
        if let Some(v) = lookup("GRID_ORCHESTRATOR_URL") {
            self.fly.orchestrator_url = Some(v);
        }
        if let Some(v) = lookup("GRID_DB_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(port) = lookup("GRID_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(n) = lookup("GRID_MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
            self.budget.max_concurrent = n;
        }
    }

    /// Reject impossible settings; return warnings for missing credentials.
    pub fn validate(&self) -> Result<Vec<String>, GridError> {
        if self.coordinator.interval_secs == 0 {
            return Err(GridError::Config("coordinator.interval_secs must be > 0".into()));
        }
        if self.budget.max_concurrent == 0 {
            return Err(GridError::Config("budget.max_concurrent must be > 0".into()));
        }
        if self.budget.max_daily_cost_usd < 0.0 {
            return Err(GridError::Config(
                "budget.max_daily_cost_usd must not be negative".into(),
            ));
        }
        if !self.coordinator.target_repo.is_empty()
            && self.coordinator.target_repo.split('/').count() != 2
        {
            return Err(GridError::Config(format!(
                "coordinator.target_repo must be owner/name, got '{}'",
                self.coordinator.target_repo
            )));
        }

        let mut warnings = Vec::new();
        if self.coordinator.target_repo.is_empty() {
            warnings.push("coordinator.target_repo is not set (GRID_TARGET_REPO)".to_string());
        }
        if self.github.token.is_none() {
            warnings.push("GitHub token is not set (GITHUB_TOKEN)".to_string());
        }
        if self.completion.backend == CompletionBackend::Api && self.completion.api_key.is_none() {
            warnings.push("Anthropic API key is not set (ANTHROPIC_API_KEY)".to_string());
        }
        if self.fly.api_token.is_none() || self.fly.app_name.is_none() {
            warnings.push("Fly credentials are not set (FLY_API_TOKEN, FLY_APP_NAME)".to_string());
        }
        Ok(warnings)
    }

    pub fn orchestrator_url(&self) -> String {
        self.fly
            .orchestrator_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.server.addr()))
    }
}
