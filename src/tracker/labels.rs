use std::sync::Arc;

use anyhow::Result;
use grid_common::{Issue, Label};

use super::IssueTracker;

/// Idempotent label transitions on top of an [`IssueTracker`].
///
/// `transition` means "make `target` the only status label": other status
/// labels are removed and the target added, while structural labels are left
/// alone. A transition interrupted halfway is repaired by repeating it.
#[derive(Clone)]
pub struct LabelManager {
    tracker: Arc<dyn IssueTracker>,
}

impl LabelManager {
    pub fn new(tracker: Arc<dyn IssueTracker>) -> Self {
        Self { tracker }
    }

    /// Transition using labels already known for the issue, skipping calls for
    /// labels that are absent. Falls back to blind removal when unknown.
    pub async fn transition(&self, issue: &Issue, target: Label) -> Result<()> {
        self.set_status(&issue.repo, issue.number, Some(&issue.labels), Some(target))
            .await
    }

    /// Transition without a fresh read of the issue's labels.
    pub async fn transition_number(&self, repo: &str, number: u64, target: Label) -> Result<()> {
        self.set_status(repo, number, None, Some(target)).await
    }

    /// Remove every status label, keeping structural ones.
    pub async fn clear_status(&self, issue: &Issue) -> Result<()> {
        self.set_status(&issue.repo, issue.number, Some(&issue.labels), None)
            .await
    }

    /// Make the issue an epic: no status label, `ai-epic` present.
    pub async fn mark_epic(&self, issue: &Issue) -> Result<()> {
        self.clear_status(issue).await?;
        if !issue.has_label(Label::Epic) {
            self.tracker
                .add_label(&issue.repo, issue.number, Label::Epic)
                .await?;
        }
        Ok(())
    }

    pub async fn remove(&self, repo: &str, number: u64, label: Label) -> Result<()> {
        self.tracker.remove_label(repo, number, label).await
    }

    /// Create every pipeline label in the repository.
    pub async fn ensure_labels_exist(&self, repo: &str) -> Result<()> {
        for label in Label::ALL {
            self.tracker.ensure_label(repo, label).await?;
        }
        Ok(())
    }

    async fn set_status(
        &self,
        repo: &str,
        number: u64,
        current: Option<&[String]>,
        target: Option<Label>,
    ) -> Result<()> {
        let present = |label: Label| match current {
            Some(labels) => labels.iter().any(|l| l == label.as_str()),
            None => true,
        };

        // Add first so a half-applied transition never leaves zero status labels.
        if let Some(target) = target {
            let already = current.is_some_and(|labels| labels.iter().any(|l| l == target.as_str()));
            if !already {
                self.tracker.add_label(repo, number, target).await?;
            }
        }

        let mut first_err = None;
        for label in Label::STATUS {
            if Some(label) == target || !present(label) {
                continue;
            }
            if let Err(e) = self.tracker.remove_label(repo, number, label).await {
                tracing::warn!(repo, issue = number, label = %label, error = %e, "label removal failed");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                tracing::debug!(repo, issue = number, target = ?target.map(|l| l.as_str()), "status label set");
                Ok(())
            }
        }
    }
}
