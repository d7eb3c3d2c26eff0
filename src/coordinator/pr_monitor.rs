use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracker::{CodeHost, PrState, PullRequest, linked_issue_number};

const FEEDBACK_SEPARATOR: &str = "\n\n---\n\n";

/// New review feedback on an open agent pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub issue_number: u64,
    pub pr_number: u64,
    pub branch: String,
    pub feedback: String,
}

/// An agent pull request closed without merging, with what humans said after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedFeedback {
    pub issue_number: u64,
    pub pr_number: u64,
    pub branch: String,
    pub feedback: String,
}

/// Phases 5 and 6: watch pull requests opened from agent branches.
#[derive(Clone)]
pub struct PrMonitor {
    code_host: Arc<dyn CodeHost>,
    branch_prefix: String,
}

fn newer(at: Option<DateTime<Utc>>, since: DateTime<Utc>) -> bool {
    at.is_some_and(|at| at > since)
}

impl PrMonitor {
    pub fn new(code_host: Arc<dyn CodeHost>, branch_prefix: impl Into<String>) -> Self {
        Self {
            code_host,
            branch_prefix: branch_prefix.into(),
        }
    }

    fn is_agent_pr(&self, pr: &PullRequest) -> bool {
        pr.head_ref.starts_with(&self.branch_prefix)
    }

    /// Issue a pull request works on: its closing reference, else the number
    /// encoded in the agent branch (`agent/42`, `agent/42-retry-1`).
    fn issue_for(&self, pr: &PullRequest) -> Option<u64> {
        linked_issue_number(&pr.body).or_else(|| {
            pr.head_ref
                .strip_prefix(&self.branch_prefix)?
                .split('-')
                .next()?
                .parse()
                .ok()
        })
    }

    /// Reviews requesting changes or commenting, and line comments, newer
    /// than `since`. One entry per pull request with anything new.
    ///
    /// `carried` is feedback found earlier but not yet acted on. It is merged
    /// ahead of the new items for pull requests that are still open and
    /// dropped for the rest.
    pub async fn check_reviews(
        &self,
        repo: &str,
        since: DateTime<Utc>,
        carried: &[ReviewFeedback],
    ) -> Result<Vec<ReviewFeedback>> {
        let prs = self.code_host.list_pull_requests(repo, PrState::Open).await?;
        let mut found = Vec::new();

        for pr in prs.iter().filter(|pr| self.is_agent_pr(pr)) {
            let Some(issue_number) = self.issue_for(pr) else {
                tracing::debug!(pr = pr.number, "agent PR without a linked issue");
                continue;
            };
            let earlier = carried.iter().find(|c| c.pr_number == pr.number);

            let fetched = match self.code_host.list_reviews(repo, pr.number).await {
                Ok(reviews) => self
                    .code_host
                    .list_review_comments(repo, pr.number)
                    .await
                    .map(|comments| (reviews, comments)),
                Err(e) => Err(e),
            };
            let (reviews, comments) = match fetched {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(pr = pr.number, error = %e, "failed to fetch review feedback");
                    found.extend(earlier.cloned());
                    continue;
                }
            };

            let mut parts: Vec<String> = earlier.map(|c| c.feedback.clone()).into_iter().collect();
            parts.extend(
                reviews
                    .iter()
                    .filter(|r| matches!(r.state.as_str(), "CHANGES_REQUESTED" | "COMMENTED"))
                    .filter(|r| !r.body.trim().is_empty())
                    .filter(|r| newer(r.submitted_at, since))
                    .map(|r| r.body.clone()),
            );
            parts.extend(
                comments
                    .iter()
                    .filter(|c| newer(Some(c.created_at), since))
                    .map(|c| format!("File: {}\n{}", c.path, c.body)),
            );

            if parts.is_empty() {
                continue;
            }
            tracing::info!(
                pr = pr.number,
                issue = issue_number,
                items = parts.len(),
                carried = earlier.is_some(),
                "review feedback pending"
            );
            found.push(ReviewFeedback {
                issue_number,
                pr_number: pr.number,
                branch: pr.head_ref.clone(),
                feedback: parts.join(FEEDBACK_SEPARATOR),
            });
        }

        for stale in carried.iter().filter(|c| !prs.iter().any(|pr| pr.number == c.pr_number)) {
            tracing::info!(
                pr = stale.pr_number,
                issue = stale.issue_number,
                "dropping carried feedback for a PR no longer open"
            );
        }
        Ok(found)
    }

    /// Agent pull requests closed unmerged after `since` that carry human
    /// comments posted once they were closed.
    pub async fn check_closed(
        &self,
        repo: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ClosedFeedback>> {
        let prs = self.code_host.list_pull_requests(repo, PrState::Closed).await?;
        let mut found = Vec::new();

        for pr in prs.iter().filter(|pr| self.is_agent_pr(pr) && !pr.merged) {
            let Some(closed_at) = pr.closed_at else {
                continue;
            };
            if !newer(Some(closed_at), since) {
                continue;
            }
            let Some(issue_number) = self.issue_for(pr) else {
                continue;
            };

            let comments = match self
                .code_host
                .list_comments_since(repo, pr.number, closed_at)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(pr = pr.number, error = %e, "failed to fetch post-close comments");
                    continue;
                }
            };
            let feedback: Vec<&str> = comments
                .iter()
                .filter(|c| !c.is_from_bot())
                .map(|c| c.body.trim())
                .filter(|b| !b.is_empty())
                .collect();
            if feedback.is_empty() {
                continue;
            }

            tracing::info!(pr = pr.number, issue = issue_number, "rejected PR with feedback");
            found.push(ClosedFeedback {
                issue_number,
                pr_number: pr.number,
                branch: pr.head_ref.clone(),
                feedback: feedback.join("\n\n"),
            });
        }

        Ok(found)
    }
}
