use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use grid_common::{Comment, Label};

use crate::tracker::metadata::{CommentKind, extract_metadata, is_agent_comment};
use crate::tracker::{IssueFilter, IssueTracker, LabelManager};

/// Phase 7: release `ai-blocked` issues once a human has answered.
#[derive(Clone)]
pub struct BlockerResolver {
    tracker: Arc<dyn IssueTracker>,
    labels: LabelManager,
}

/// Whether `comments` hold a human reply after the cutoff. The cutoff is the
/// later of the watermark and the last blocking question; with neither there
/// is nothing to answer.
pub fn has_human_reply(comments: &[Comment], since: Option<DateTime<Utc>>) -> bool {
    let last_question = comments
        .iter()
        .filter(|c| {
            extract_metadata(&c.body).is_some_and(|m| m.kind == CommentKind::BlockingQuestion)
        })
        .map(|c| c.created_at)
        .max();

    let cutoff = match (since, last_question) {
        (Some(a), Some(b)) => a.max(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return false,
    };

    comments
        .iter()
        .filter(|c| c.created_at > cutoff)
        .any(|c| !is_agent_comment(&c.body) && !c.is_from_bot())
}

impl BlockerResolver {
    pub fn new(tracker: Arc<dyn IssueTracker>, labels: LabelManager) -> Self {
        Self { tracker, labels }
    }

    /// Returns the issues that were unblocked.
    pub async fn resolve(&self, repo: &str, since: Option<DateTime<Utc>>) -> Result<Vec<u64>> {
        let blocked = self
            .tracker
            .list_issues(repo, &IssueFilter::open_with(Label::Blocked))
            .await?;

        let mut unblocked = Vec::new();
        for brief in blocked {
            let issue = match self.tracker.get_issue(repo, brief.number).await {
                Ok(i) => i,
                Err(e) => {
                    tracing::warn!(issue = brief.number, error = %e, "failed to fetch blocked issue");
                    continue;
                }
            };
            if !has_human_reply(&issue.comments, since) {
                continue;
            }
            match self.labels.remove(repo, issue.number, Label::Blocked).await {
                Ok(()) => {
                    tracing::info!(issue = issue.number, "human replied, issue unblocked");
                    unblocked.push(issue.number);
                }
                Err(e) => {
                    tracing::warn!(issue = issue.number, error = %e, "failed to remove blocked label");
                }
            }
        }
        Ok(unblocked)
    }
}
