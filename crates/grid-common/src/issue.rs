use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classification::Category;
use crate::label::Label;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Closed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    #[serde(default)]
    pub author_is_bot: bool,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    /// Bot accounts either carry the bot flag or GitHub's `[bot]` login suffix.
    pub fn is_from_bot(&self) -> bool {
        self.author_is_bot || self.author.ends_with("[bot]")
    }
}

/// A tracked unit of work, as last read from the tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub number: u64,
    pub repo: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub status: IssueStatus,
    #[serde(default)]
    pub parent: Option<u64>,
    #[serde(default)]
    pub blocked_by: Vec<u64>,
    #[serde(default)]
    pub sub_issues: Vec<u64>,
}

impl Issue {
    pub fn has_label(&self, label: Label) -> bool {
        self.labels.iter().any(|l| l == label.as_str())
    }

    /// The pipeline status label currently on the issue, if any.
    pub fn status_label(&self) -> Option<Label> {
        self.labels
            .iter()
            .filter_map(|l| Label::from_str(l).ok())
            .find(|l| l.is_status())
    }

    pub fn is_open(&self) -> bool {
        self.status == IssueStatus::Open
    }
}

/// Coordinator-local bookkeeping for one issue, keyed by (number, repo).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueState {
    pub issue_number: u64,
    pub repo: String,
    pub classification: Option<Category>,
    pub parent_issue: Option<u64>,
    #[serde(default)]
    pub sub_issues: Vec<u64>,
    pub retry_count: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl IssueState {
    pub fn new(issue_number: u64, repo: &str) -> Self {
        Self {
            issue_number,
            repo: repo.to_string(),
            classification: None,
            parent_issue: None,
            sub_issues: Vec::new(),
            retry_count: 0,
            last_checked_at: None,
            metadata: serde_json::Value::Null,
        }
    }
}
