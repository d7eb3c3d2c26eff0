use std::sync::Arc;

use anyhow::Result;
use grid_common::{Issue, Label};

use crate::tracker::{IssueFilter, IssueTracker};

/// Phase 1: open issues that have not entered the pipeline yet.
#[derive(Clone)]
pub struct Scanner {
    tracker: Arc<dyn IssueTracker>,
}

/// An issue is a candidate when it carries no status label and is not an
/// epic. Structural `ai-sub-issue` alone does not exclude it.
pub fn is_candidate(issue: &Issue) -> bool {
    issue.is_open() && issue.status_label().is_none() && !issue.has_label(Label::Epic)
}

impl Scanner {
    pub fn new(tracker: Arc<dyn IssueTracker>) -> Self {
        Self { tracker }
    }

    pub async fn scan(&self, repo: &str) -> Result<Vec<Issue>> {
        let mut issues: Vec<Issue> = self
            .tracker
            .list_issues(repo, &IssueFilter::open())
            .await?
            .into_iter()
            .filter(is_candidate)
            .collect();
        issues.sort_by_key(|i| i.number);
        tracing::debug!(repo, candidates = issues.len(), "scan complete");
        Ok(issues)
    }
}
