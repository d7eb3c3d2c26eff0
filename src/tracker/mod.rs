//! Issue tracker and code host contracts.
//!
//! The coordinator treats the tracker as the source of truth for pipeline
//! state: labels encode status and comments carry questions and summaries.
//! GitHub has no native parent/blocker fields, so that linkage is written as
//! header lines at the top of a sub-issue body and parsed back on read.

pub mod github;
pub mod labels;
pub mod metadata;

use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grid_common::{Comment, Issue, IssueStatus, Label};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use github::GitHubClient;
pub use labels::LabelManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateFilter {
    #[default]
    Open,
    Closed,
    All,
}

impl StateFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::All => "all",
        }
    }
}

/// Listing filter. `labels` must all be present on a returned issue.
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub state: StateFilter,
    pub labels: Vec<Label>,
}

impl IssueFilter {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn open_with(label: Label) -> Self {
        Self {
            state: StateFilter::Open,
            labels: vec![label],
        }
    }
}

/// A sub-issue about to be created under a parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubIssueDraft {
    pub title: String,
    pub body: String,
    pub labels: Vec<Label>,
    pub blocked_by: Vec<u64>,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Issues matching `filter`, without comments. Pull requests are excluded.
    async fn list_issues(&self, repo: &str, filter: &IssueFilter) -> Result<Vec<Issue>>;

    /// A single issue including its comments.
    async fn get_issue(&self, repo: &str, number: u64) -> Result<Issue>;

    async fn list_sub_issues(&self, repo: &str, parent: u64) -> Result<Vec<Issue>>;

    async fn create_sub_issue(&self, repo: &str, parent: u64, draft: &SubIssueDraft)
    -> Result<Issue>;

    async fn add_comment(&self, repo: &str, number: u64, body: &str) -> Result<()>;

    async fn update_status(&self, repo: &str, number: u64, status: IssueStatus) -> Result<()>;

    async fn add_label(&self, repo: &str, number: u64, label: Label) -> Result<()>;

    /// Removing a label that is not present succeeds.
    async fn remove_label(&self, repo: &str, number: u64, label: Label) -> Result<()>;

    /// Create the label in the repository if it does not exist yet.
    async fn ensure_label(&self, repo: &str, label: Label) -> Result<()>;
}

// ── Code host (pull requests) ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub head_ref: String,
    pub merged: bool,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Review {
    pub id: u64,
    pub author: String,
    /// `APPROVED`, `CHANGES_REQUESTED`, `COMMENTED`, ...
    pub state: String,
    pub body: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewComment {
    pub id: u64,
    pub author: String,
    pub path: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn list_pull_requests(&self, repo: &str, state: PrState) -> Result<Vec<PullRequest>>;

    async fn list_reviews(&self, repo: &str, pr: u64) -> Result<Vec<Review>>;

    async fn list_review_comments(&self, repo: &str, pr: u64) -> Result<Vec<ReviewComment>>;

    /// Conversation comments on an issue or pull request created after `since`.
    async fn list_comments_since(
        &self,
        repo: &str,
        number: u64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Comment>>;
}

// ── Body linkage ─────────────────────────────────────────────────────

static PARENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^\s*Parent:\s*#(\d+)").unwrap());

static BLOCKED_BY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^\s*Blocked by:\s*(.+)$").unwrap());

static ISSUE_REF_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\d+)").unwrap());

static CLOSING_REF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:closes|fixes|resolves)\s+#(\d+)").unwrap());

/// Parent and blocking issue numbers declared in an issue body.
pub fn parse_linkage(body: &str) -> (Option<u64>, Vec<u64>) {
    let parent = PARENT_REGEX
        .captures(body)
        .and_then(|c| c[1].parse().ok());
    let blocked_by = BLOCKED_BY_REGEX
        .captures(body)
        .map(|c| {
            ISSUE_REF_REGEX
                .captures_iter(&c[1])
                .filter_map(|r| r[1].parse().ok())
                .collect()
        })
        .unwrap_or_default();
    (parent, blocked_by)
}

/// Header lines that [`parse_linkage`] reads back.
pub fn format_linkage(parent: u64, blocked_by: &[u64]) -> String {
    let mut header = format!("Parent: #{}\n", parent);
    if !blocked_by.is_empty() {
        let refs: Vec<String> = blocked_by.iter().map(|n| format!("#{}", n)).collect();
        header.push_str(&format!("Blocked by: {}\n", refs.join(", ")));
    }
    header
}

/// The issue a pull request closes, from `Closes/Fixes/Resolves #N` in its body.
pub fn linked_issue_number(pr_body: &str) -> Option<u64> {
    CLOSING_REF_REGEX
        .captures(pr_body)
        .and_then(|c| c[1].parse().ok())
}
