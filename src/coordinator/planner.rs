use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use grid_common::{Category, Issue, IssueState, Label};
use serde::{Deserialize, Serialize};

use super::db::DbHandle;
use crate::errors::GridError;
use crate::llm::{CompletionRequest, CompletionService, ModelTier, extract_json_object};
use crate::tracker::metadata::{CommentKind, CommentMeta, embed_metadata};
use crate::tracker::{IssueTracker, LabelManager, SubIssueDraft};

const PLAN_MAX_TOKENS: u32 = 4096;

const PLANNER_SYSTEM_PROMPT: &str = r#"You are a technical lead breaking a large GitHub issue into sub-tasks that autonomous coding agents will implement one pull request at a time.

Rules:
- Each sub-task must be independently reviewable and small (one concern).
- Order sub-tasks so dependencies come first; `depends_on` lists zero-based indices of EARLIER sub-tasks only.
- Prefer 2 to 6 sub-tasks.

Respond with a single JSON object:
{
  "summary": "one paragraph plan",
  "sub_tasks": [
    {
      "title": "short imperative title",
      "description": "what to build and why",
      "acceptance_criteria": ["..."],
      "files_hint": ["path/to/file.rs"],
      "complexity": 1-10,
      "depends_on": [0]
    }
  ],
  "risks": ["..."]
}"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub files_hint: Vec<String>,
    #[serde(default)]
    pub complexity: Option<u8>,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub sub_tasks: Vec<PlannedTask>,
    #[serde(default)]
    pub risks: Vec<String>,
}

impl Plan {
    /// Parse model output. A plan without sub-tasks is an error.
    pub fn parse(text: &str) -> Result<Self, GridError> {
        let json = extract_json_object(text).ok_or_else(|| GridError::Parse {
            what: "plan".into(),
            message: "no JSON object in output".into(),
        })?;
        let plan: Plan = serde_json::from_str(json).map_err(|e| GridError::Parse {
            what: "plan".into(),
            message: e.to_string(),
        })?;
        if plan.sub_tasks.is_empty() {
            return Err(GridError::Parse {
                what: "plan".into(),
                message: "plan has no sub_tasks".into(),
            });
        }
        Ok(plan)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreatedSubIssue {
    pub number: u64,
    pub title: String,
    pub blocked_by: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Decomposition {
    pub parent: u64,
    pub sub_issues: Vec<CreatedSubIssue>,
}

/// Phase 3 for COMPLEX issues: plan, create dependent sub-issues, and turn
/// the parent into an epic.
#[derive(Clone)]
pub struct Planner {
    tracker: Arc<dyn IssueTracker>,
    labels: LabelManager,
    completion: Arc<dyn CompletionService>,
    db: DbHandle,
}

impl Planner {
    pub fn new(
        tracker: Arc<dyn IssueTracker>,
        completion: Arc<dyn CompletionService>,
        db: DbHandle,
    ) -> Self {
        Self {
            labels: LabelManager::new(tracker.clone()),
            tracker,
            completion,
            db,
        }
    }

    /// On failure the parent is labelled failed with an explanatory comment.
    /// Sub-issues created before the failure are left in place.
    pub async fn decompose(&self, issue: &Issue) -> Result<Decomposition> {
        let mut created = Vec::new();
        match self.try_decompose(issue, &mut created).await {
            Ok(()) => Ok(Decomposition {
                parent: issue.number,
                sub_issues: created,
            }),
            Err(e) => {
                tracing::warn!(issue = issue.number, error = %e, created = created.len(), "decomposition failed");
                let mut body = format!("Planning this issue failed: {}", e);
                if !created.is_empty() {
                    let refs: Vec<String> = created.iter().map(|c| format!("#{}", c.number)).collect();
                    body.push_str(&format!(
                        "\n\nSub-issues created before the failure: {}",
                        refs.join(", ")
                    ));
                }
                let body = embed_metadata(&body, &CommentMeta::new(CommentKind::Failure));
                if let Err(ce) = self.tracker.add_comment(&issue.repo, issue.number, &body).await {
                    tracing::warn!(issue = issue.number, error = %ce, "failed to post planning failure comment");
                }
                if let Err(le) = self
                    .labels
                    .transition_number(&issue.repo, issue.number, Label::Failed)
                    .await
                {
                    tracing::warn!(issue = issue.number, error = %le, "failed to label planning failure");
                }
                Err(e)
            }
        }
    }

    async fn try_decompose(&self, issue: &Issue, created: &mut Vec<CreatedSubIssue>) -> Result<()> {
        let repo = issue.repo.as_str();
        self.labels.transition(issue, Label::Planning).await?;

        let text = self
            .completion
            .complete(CompletionRequest {
                tier: ModelTier::Strong,
                system: Some(PLANNER_SYSTEM_PROMPT.to_string()),
                prompt: render_plan_prompt(issue),
                max_tokens: PLAN_MAX_TOKENS,
            })
            .await
            .context("Planner completion failed")?;
        let plan = Plan::parse(&text)?;

        for (idx, task) in plan.sub_tasks.iter().enumerate() {
            let mut blocked_by = Vec::new();
            for &dep in &task.depends_on {
                match created.get(dep) {
                    Some(prior) if dep < idx => blocked_by.push(prior.number),
                    _ => tracing::warn!(
                        issue = issue.number,
                        task = idx,
                        depends_on = dep,
                        "ignoring dependency on a non-earlier sub-task"
                    ),
                }
            }
            blocked_by.sort_unstable();
            blocked_by.dedup();

            let mut labels = vec![Label::SubIssue];
            if !blocked_by.is_empty() {
                labels.push(Label::Waiting);
            }
            let draft = SubIssueDraft {
                title: task.title.clone(),
                body: render_task_body(task, issue.number),
                labels,
                blocked_by: blocked_by.clone(),
            };
            let sub = self
                .tracker
                .create_sub_issue(repo, issue.number, &draft)
                .await
                .with_context(|| format!("Failed to create sub-issue '{}'", task.title))?;
            tracing::info!(parent = issue.number, sub_issue = sub.number, "sub-issue created");
            created.push(CreatedSubIssue {
                number: sub.number,
                title: task.title.clone(),
                blocked_by,
            });
        }

        let summary = render_summary(&plan, created);
        let summary = embed_metadata(&summary, &CommentMeta::new(CommentKind::PlanSummary));
        self.tracker
            .add_comment(repo, issue.number, &summary)
            .await
            .context("Failed to post plan summary")?;

        // Labels as they now stand: planning was added above.
        let mut current = issue.clone();
        current
            .labels
            .retain(|l| !Label::STATUS.iter().any(|s| s.as_str() == l));
        current.labels.push(Label::Planning.as_str().to_string());
        self.labels.mark_epic(&current).await?;

        self.record_state(issue, created).await?;
        Ok(())
    }

    async fn record_state(&self, issue: &Issue, created: &[CreatedSubIssue]) -> Result<()> {
        let repo = issue.repo.clone();
        let parent = issue.number;
        let children: Vec<u64> = created.iter().map(|c| c.number).collect();
        self.db
            .call(move |db| {
                let mut state = db
                    .get_issue_state(&repo, parent)?
                    .unwrap_or_else(|| IssueState::new(parent, &repo));
                state.classification = Some(Category::Complex);
                state.sub_issues = children.clone();
                state.last_checked_at = Some(Utc::now());
                db.upsert_issue_state(&state)?;
                for child in children {
                    let mut child_state = db
                        .get_issue_state(&repo, child)?
                        .unwrap_or_else(|| IssueState::new(child, &repo));
                    child_state.parent_issue = Some(parent);
                    db.upsert_issue_state(&child_state)?;
                }
                Ok(())
            })
            .await
    }
}

fn render_plan_prompt(issue: &Issue) -> String {
    format!(
        "Decompose GitHub issue #{} in {}.\n\nTitle: {}\n\n{}\n",
        issue.number,
        issue.repo,
        issue.title,
        if issue.body.trim().is_empty() {
            "(no description)"
        } else {
            issue.body.as_str()
        }
    )
}

fn render_task_body(task: &PlannedTask, parent: u64) -> String {
    let mut body = format!("Sub-task of #{}.\n\n## Description\n\n{}\n", parent, task.description);
    if !task.acceptance_criteria.is_empty() {
        body.push_str("\n## Acceptance criteria\n\n");
        for c in &task.acceptance_criteria {
            body.push_str(&format!("- [ ] {}\n", c));
        }
    }
    if !task.files_hint.is_empty() {
        body.push_str("\n## Likely files\n\n");
        for f in &task.files_hint {
            body.push_str(&format!("- `{}`\n", f));
        }
    }
    if let Some(c) = task.complexity {
        body.push_str(&format!("\nEstimated complexity: {}/10\n", c));
    }
    body
}

fn render_summary(plan: &Plan, created: &[CreatedSubIssue]) -> String {
    let mut out = String::from("## Plan\n\n");
    if !plan.summary.is_empty() {
        out.push_str(&plan.summary);
        out.push_str("\n\n");
    }
    out.push_str("### Sub-issues\n\n");
    for sub in created {
        out.push_str(&format!("- #{} {}", sub.number, sub.title));
        if !sub.blocked_by.is_empty() {
            // By title so each number appears exactly once in the comment.
            let deps: Vec<&str> = sub
                .blocked_by
                .iter()
                .filter_map(|n| created.iter().find(|c| c.number == *n))
                .map(|c| c.title.as_str())
                .collect();
            out.push_str(&format!(" (after: {})", deps.join(", ")));
        }
        out.push('\n');
    }
    if !plan.risks.is_empty() {
        out.push_str("\n### Risks\n\n");
        for r in &plan.risks {
            out.push_str(&format!("- {}\n", r));
        }
    }
    out
}
