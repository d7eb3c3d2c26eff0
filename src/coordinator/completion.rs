//! Terminal transitions: agent callbacks, operator cancels and timeouts all
//! end up in [`Coordinator::finalize`].

use chrono::Utc;
use grid_common::{Checkpoint, Execution, ExecutionStatus, Label};
use serde::{Deserialize, Serialize};

use super::db::{TerminalUpdate, TransitionOutcome};
use super::engine::Coordinator;
use crate::errors::GridError;
use crate::grid::GridEvent;
use crate::tracker::metadata::{CommentKind, CommentMeta, embed_metadata};

/// Body of `POST /api/agent-status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Applied,
    /// The execution was already terminal; nothing changed.
    Duplicate,
}

impl CompletionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

impl Coordinator {
    /// Apply an agent's completion callback. Replays answer `Duplicate`.
    pub async fn handle_completion(
        &self,
        report: CompletionReport,
    ) -> Result<CompletionOutcome, GridError> {
        if !report.status.is_terminal() {
            return Err(GridError::BadRequest(format!(
                "status must be completed or failed, got {}",
                report.status.as_str()
            )));
        }

        let update = TerminalUpdate {
            id: report.execution_id.clone(),
            status: report.status,
            result: report.result,
            pr_number: report.pr_number,
            branch: report.branch,
            checkpoint: report.checkpoint,
            cost_usd: report.cost_usd,
        };
        let Some(execution) = self.finalize(update, false).await? else {
            tracing::info!(execution_id = %report.execution_id, "duplicate completion ignored");
            return Ok(CompletionOutcome::Duplicate);
        };

        let repo = execution.repo.as_str();
        let number = execution.issue_number;
        let labelled = match (execution.status, execution.pr_number) {
            (ExecutionStatus::Completed, Some(_)) => {
                self.labels()
                    .transition_number(repo, number, Label::ReviewPending)
                    .await
            }
            (ExecutionStatus::Completed, None) => {
                self.labels().transition_number(repo, number, Label::Done).await
            }
            _ => {
                let reason = execution.result.as_deref().unwrap_or("no details reported");
                self.report_failure(
                    &execution,
                    CommentKind::Failure,
                    &format!("Execution `{}` failed:\n\n{}", execution.id, truncate(reason, 4000)),
                )
                .await;
                Ok(())
            }
        };
        if let Err(e) = labelled {
            tracing::warn!(issue = number, error = %e, "failed to relabel after completion");
        }

        tracing::info!(
            execution_id = %execution.id,
            issue = number,
            status = execution.status.as_str(),
            pr = ?execution.pr_number,
            "execution finished"
        );
        Ok(CompletionOutcome::Applied)
    }

    /// Operator cancel: fail locally first, then stop the remote run.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<CompletionOutcome, GridError> {
        let update = TerminalUpdate {
            id: execution_id.to_string(),
            status: ExecutionStatus::Failed,
            result: Some("cancelled".into()),
            pr_number: None,
            branch: None,
            checkpoint: None,
            cost_usd: None,
        };
        let Some(execution) = self.finalize(update, true).await? else {
            return Ok(CompletionOutcome::Duplicate);
        };
        self.report_failure(
            &execution,
            CommentKind::Failure,
            &format!("Execution `{}` was cancelled by an operator.", execution.id),
        )
        .await;
        tracing::info!(execution_id, issue = execution.issue_number, "execution cancelled");
        Ok(CompletionOutcome::Applied)
    }

    /// Fail an execution that ran past the timeout. Returns whether this call
    /// made the transition.
    pub(crate) async fn time_out(&self, execution: &Execution) -> Result<bool, GridError> {
        let elapsed = (Utc::now() - execution.started_at.unwrap_or(execution.created_at))
            .num_seconds();
        let timeout = GridError::Timeout {
            id: execution.id.clone(),
            elapsed_secs: elapsed,
        };
        let update = TerminalUpdate {
            id: execution.id.clone(),
            status: ExecutionStatus::Failed,
            result: Some(timeout.to_string()),
            pr_number: None,
            branch: None,
            checkpoint: None,
            cost_usd: None,
        };
        let Some(execution) = self.finalize(update, true).await? else {
            return Ok(false);
        };
        tracing::warn!(execution_id = %execution.id, issue = execution.issue_number, elapsed_secs = elapsed, "execution timed out");
        self.report_failure(
            &execution,
            CommentKind::Timeout,
            &format!(
                "Execution `{}` did not report back within {} minutes and was stopped.",
                execution.id,
                self.settings().execution_timeout.num_minutes()
            ),
        )
        .await;
        Ok(true)
    }

    /// The single terminal path. `None` when another caller got there first.
    /// Only the winner records usage and emits the downstream event.
    async fn finalize(
        &self,
        update: TerminalUpdate,
        terminate: bool,
    ) -> Result<Option<Execution>, GridError> {
        let id = update.id.clone();
        let outcome = self
            .services()
            .db
            .call(move |db| db.complete_execution(&update))
            .await
            .map_err(GridError::Store)?;

        match outcome {
            TransitionOutcome::NotFound => return Err(GridError::ExecutionNotFound { id }),
            TransitionOutcome::AlreadyTerminal => return Ok(None),
            TransitionOutcome::Transitioned => {}
        }

        let lookup = id.clone();
        let execution = self
            .services()
            .db
            .call(move |db| db.get_execution(&lookup))
            .await
            .map_err(GridError::Store)?
            .ok_or_else(|| GridError::ExecutionNotFound { id: id.clone() })?;

        let started = execution.started_at.unwrap_or(execution.created_at);
        let duration = (execution.completed_at.unwrap_or_else(Utc::now) - started).num_seconds();
        if let Err(e) = self
            .budget()
            .record_usage(&execution.id, execution.issue_number, execution.cost_usd, duration)
            .await
        {
            tracing::warn!(execution_id = %execution.id, error = %e, "failed to record budget usage");
        }

        if terminate {
            match self.services().grid.cancel(&execution.id).await {
                Ok(true) => tracing::debug!(execution_id = %execution.id, "remote run terminated"),
                Ok(false) => tracing::debug!(execution_id = %execution.id, "no remote run to terminate"),
                Err(e) => {
                    tracing::warn!(execution_id = %execution.id, error = %e, "remote termination failed")
                }
            }
        }

        let event = match execution.status {
            ExecutionStatus::Completed => GridEvent::Completed {
                execution_id: execution.id.clone(),
                issue_number: execution.issue_number,
                pr_number: execution.pr_number,
            },
            _ => GridEvent::Failed {
                execution_id: execution.id.clone(),
                issue_number: execution.issue_number,
                error: execution.result.clone().unwrap_or_default(),
            },
        };
        self.services().grid.finish(&execution.id, event).await;

        Ok(Some(execution))
    }

    /// Failure comment plus `ai-failed`. Tracker errors are logged only.
    pub(crate) async fn report_failure(&self, execution: &Execution, kind: CommentKind, message: &str) {
        let repo = execution.repo.as_str();
        let number = execution.issue_number;
        let body = embed_metadata(message, &CommentMeta::for_execution(kind, &execution.id));
        if let Err(e) = self.services().tracker.add_comment(repo, number, &body).await {
            tracing::warn!(issue = number, error = %e, "failed to post failure comment");
        }
        if let Err(e) = self
            .labels()
            .transition_number(repo, number, Label::Failed)
            .await
        {
            tracing::warn!(issue = number, error = %e, "failed to label failed issue");
        }
    }
}
