use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use grid_common::{IssueStatus, Label};

use crate::tracker::metadata::{CommentKind, CommentMeta, embed_metadata, extract_metadata};
use crate::tracker::{IssueFilter, IssueTracker, LabelManager};

pub const EPIC_COMPLETE_MESSAGE: &str = "All sub-tasks completed! Closing parent issue.";

/// Releases waiting sub-issues and closes epics whose sub-issues are done.
#[derive(Clone)]
pub struct DependencyResolver {
    tracker: Arc<dyn IssueTracker>,
    labels: LabelManager,
}

impl DependencyResolver {
    pub fn new(tracker: Arc<dyn IssueTracker>, labels: LabelManager) -> Self {
        Self { tracker, labels }
    }

    /// Remove `ai-waiting` from issues whose blockers are all closed. A blocker
    /// that cannot be fetched counts as open. Returns the released issues.
    pub async fn release_waiting(&self, repo: &str) -> Result<Vec<u64>> {
        let waiting = self
            .tracker
            .list_issues(repo, &IssueFilter::open_with(Label::Waiting))
            .await?;

        let mut released = Vec::new();
        for issue in waiting {
            let blockers = join_all(
                issue
                    .blocked_by
                    .iter()
                    .map(|n| self.tracker.get_issue(repo, *n)),
            )
            .await;

            let all_closed = blockers.iter().zip(&issue.blocked_by).all(|(b, n)| match b {
                Ok(blocker) => blocker.status == IssueStatus::Closed,
                Err(e) => {
                    tracing::warn!(issue = issue.number, blocker = n, error = %e, "cannot verify blocker");
                    false
                }
            });
            if !all_closed {
                continue;
            }

            match self.labels.remove(repo, issue.number, Label::Waiting).await {
                Ok(()) => {
                    tracing::info!(issue = issue.number, "dependencies resolved, released");
                    released.push(issue.number);
                }
                Err(e) => tracing::warn!(issue = issue.number, error = %e, "failed to release"),
            }
        }
        Ok(released)
    }

    /// Close open epics whose sub-issues are all closed. Returns the epics closed.
    pub async fn close_finished_epics(&self, repo: &str) -> Result<Vec<u64>> {
        let epics = self
            .tracker
            .list_issues(repo, &IssueFilter::open_with(Label::Epic))
            .await?;

        let mut closed = Vec::new();
        for epic in epics {
            let subs = match self.tracker.list_sub_issues(repo, epic.number).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(issue = epic.number, error = %e, "failed to list sub-issues");
                    continue;
                }
            };
            if subs.is_empty() || subs.iter().any(|s| s.status != IssueStatus::Closed) {
                continue;
            }

            if let Err(e) = self.close_epic(repo, epic.number).await {
                tracing::warn!(issue = epic.number, error = %e, "failed to close epic");
                continue;
            }
            tracing::info!(issue = epic.number, sub_issues = subs.len(), "epic complete");
            closed.push(epic.number);
        }
        Ok(closed)
    }

    async fn close_epic(&self, repo: &str, number: u64) -> Result<()> {
        // A previous tick may have commented before failing to close.
        let epic = self.tracker.get_issue(repo, number).await?;
        let already_commented = epic.comments.iter().any(|c| {
            extract_metadata(&c.body).is_some_and(|m| m.kind == CommentKind::EpicComplete)
        });
        if !already_commented {
            let body = embed_metadata(
                EPIC_COMPLETE_MESSAGE,
                &CommentMeta::new(CommentKind::EpicComplete),
            );
            self.tracker.add_comment(repo, number, &body).await?;
        }
        self.tracker
            .update_status(repo, number, IssueStatus::Closed)
            .await?;
        self.labels.transition(&epic, Label::Done).await
    }
}
