use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Implement,
    AddressReview,
    RetryWithFeedback,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implement => "implement",
            Self::AddressReview => "address_review",
            Self::RetryWithFeedback => "retry_with_feedback",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "implement" => Ok(Self::Implement),
            "address_review" => Ok(Self::AddressReview),
            "retry_with_feedback" => Ok(Self::RetryWithFeedback),
            _ => Err(format!("Invalid execution mode: {}", s)),
        }
    }
}

/// Opaque context handed from one execution to the next for the same issue.
///
/// Keys are free-form; the coordinator itself only reads a handful of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Checkpoint(pub BTreeMap<String, serde_json::Value>);

impl Checkpoint {
    pub const DECISIONS_MADE: &'static str = "decisions_made";
    pub const CONTEXT_SUMMARY: &'static str = "context_summary";
    pub const WHAT_NOT_TO_DO: &'static str = "what_not_to_do";

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// String view of a key. Arrays are joined one item per line so lists of
    /// decisions render readably in prompts.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.trim().is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(items) if items.is_empty() => None,
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => format!("- {}", s),
                        other => format!("- {}", other),
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            other => Some(other.to_string()),
        }
    }

    pub fn insert(&mut self, key: &str, value: serde_json::Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One attempt to have an agent work an issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: String,
    pub issue_number: u64,
    pub repo: String,
    pub repo_url: String,
    pub status: ExecutionStatus,
    pub mode: ExecutionMode,
    pub prompt: String,
    pub result: Option<String>,
    pub pr_number: Option<u64>,
    pub branch: Option<String>,
    pub checkpoint: Option<Checkpoint>,
    pub external_run_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
