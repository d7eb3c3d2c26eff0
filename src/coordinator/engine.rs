use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use grid_common::{Category, Checkpoint, Classification, Execution, Issue, IssueState, Label};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::blocker::BlockerResolver;
use super::budget::BudgetManager;
use super::checkpoint::CheckpointStore;
use super::classifier::Classifier;
use super::db::NewExecution;
use super::dependency::DependencyResolver;
use super::planner::Planner;
use super::pr_monitor::{ClosedFeedback, PrMonitor, ReviewFeedback};
use super::prompt::{ModeContext, branch_name, build_prompt};
use super::scanner::Scanner;
use super::watermark::{
    CARRIED_CLOSED_PRS, CARRIED_REVIEWS, LAST_BLOCKER_CHECK, LAST_CLOSED_PR_CHECK, LAST_PR_CHECK,
    Watermarks,
};
use super::{CoordinatorSettings, Services};
use crate::errors::GridError;
use crate::grid::{ExecutionConfig, GridExecution, LaunchRequest};
use crate::tracker::LabelManager;
use crate::tracker::metadata::{CommentKind, CommentMeta, embed_metadata};

const NUDGE_BATCH: u32 = 50;

// ── Phases and reports ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// Scan, classify and act on new issues.
    Intake,
    /// Time out executions that stopped reporting.
    Executions,
    Reviews,
    ClosedPullRequests,
    Blockers,
    /// Release waiting sub-issues and close finished epics.
    Dependencies,
}

impl CyclePhase {
    pub const ALL: [CyclePhase; 6] = [
        CyclePhase::Intake,
        CyclePhase::Executions,
        CyclePhase::Reviews,
        CyclePhase::ClosedPullRequests,
        CyclePhase::Blockers,
        CyclePhase::Dependencies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Executions => "executions",
            Self::Reviews => "reviews",
            Self::ClosedPullRequests => "closed_pull_requests",
            Self::Blockers => "blockers",
            Self::Dependencies => "dependencies",
        }
    }

    /// The phase a GitHub webhook should trigger, if any.
    pub fn for_github_event(event: &str, action: Option<&str>) -> Option<Self> {
        match (event, action) {
            ("issues", Some("closed")) => Some(Self::Dependencies),
            ("issues", _) => Some(Self::Intake),
            ("issue_comment", _) => Some(Self::Blockers),
            ("pull_request_review" | "pull_request_review_comment", _) => Some(Self::Reviews),
            ("pull_request", Some("closed")) => Some(Self::ClosedPullRequests),
            _ => None,
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CyclePhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("Invalid cycle phase: {}", s))
    }
}

/// What one cycle (or one phase) did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub phases: Vec<CyclePhase>,
    pub scanned: u32,
    pub classified: u32,
    pub launched: u32,
    pub planned: u32,
    pub blocked: u32,
    pub skipped: u32,
    /// Launches held back by the budget.
    pub deferred: u32,
    pub timed_out: u32,
    pub reviews_addressed: u32,
    pub retries_launched: u32,
    pub escalated: u32,
    pub unblocked: u32,
    pub released: u32,
    pub epics_closed: u32,
    pub errors: Vec<String>,
    /// Set after the first budget denial; no further launches this tick.
    pub budget_exhausted: bool,
}

impl CycleReport {
    fn error(&mut self, phase: CyclePhase, issue: Option<u64>, err: &anyhow::Error) {
        tracing::warn!(phase = %phase, issue = ?issue, error = %format!("{:#}", err), "cycle step failed");
        let message = match issue {
            Some(n) => format!("{} #{}: {:#}", phase, n, err),
            None => format!("{}: {:#}", phase, err),
        };
        self.errors.push(message);
    }
}

enum LaunchOutcome {
    Launched,
    Deferred,
    AlreadyActive,
}

// ── Coordinator ──────────────────────────────────────────────────────

/// Owns every pipeline component. Driven by the actor, one command at a time.
pub struct Coordinator {
    services: Services,
    settings: CoordinatorSettings,
    budget: BudgetManager,
    labels: LabelManager,
    scanner: Scanner,
    classifier: Classifier,
    planner: Planner,
    pr_monitor: PrMonitor,
    blockers: BlockerResolver,
    deps: DependencyResolver,
    watermarks: Watermarks,
    checkpoints: CheckpointStore,
}

impl Coordinator {
    pub fn new(services: Services, settings: CoordinatorSettings) -> Self {
        let labels = LabelManager::new(services.tracker.clone());
        Self {
            budget: BudgetManager::new(services.db.clone(), settings.budget.clone()),
            scanner: Scanner::new(services.tracker.clone()),
            classifier: Classifier::new(services.completion.clone()),
            planner: Planner::new(
                services.tracker.clone(),
                services.completion.clone(),
                services.db.clone(),
            ),
            pr_monitor: PrMonitor::new(
                services.code_host.clone(),
                settings.agent_branch_prefix.clone(),
            ),
            blockers: BlockerResolver::new(services.tracker.clone(), labels.clone()),
            deps: DependencyResolver::new(services.tracker.clone(), labels.clone()),
            watermarks: Watermarks::new(services.db.clone()),
            checkpoints: CheckpointStore::new(services.db.clone()),
            labels,
            services,
            settings,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn budget(&self) -> &BudgetManager {
        &self.budget
    }

    pub fn labels(&self) -> &LabelManager {
        &self.labels
    }

    /// Hand executions left active by a previous process back to the grid so
    /// cancels and timeouts can still reach them.
    pub async fn adopt_active_executions(&self) -> Result<usize> {
        let active = self.services.db.call(|db| db.active_executions()).await?;
        for exec in &active {
            self.services.grid.adopt(GridExecution {
                execution_id: exec.id.clone(),
                issue_number: exec.issue_number,
                mode: exec.mode,
                external_run_id: exec.external_run_id.clone(),
                launched_at: exec.started_at.unwrap_or(exec.created_at),
            });
        }
        Ok(active.len())
    }

    /// Every phase in order. Failures are recorded, never propagated.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        tracing::info!(repo = %self.settings.repo, "cycle started");
        for phase in CyclePhase::ALL {
            self.run_phase_into(phase, &mut report).await;
        }
        tracing::info!(
            launched = report.launched,
            planned = report.planned,
            timed_out = report.timed_out,
            errors = report.errors.len(),
            "cycle finished"
        );
        report
    }

    pub async fn run_phase(&self, phase: CyclePhase) -> CycleReport {
        let mut report = CycleReport::default();
        self.run_phase_into(phase, &mut report).await;
        report
    }

    async fn run_phase_into(&self, phase: CyclePhase, report: &mut CycleReport) {
        report.phases.push(phase);
        let result = match phase {
            CyclePhase::Intake => self.intake(report).await,
            CyclePhase::Executions => self.check_timeouts(report).await,
            CyclePhase::Reviews => self.handle_reviews(report).await,
            CyclePhase::ClosedPullRequests => self.handle_closed_prs(report).await,
            CyclePhase::Blockers => self.resolve_blockers(report).await,
            CyclePhase::Dependencies => self.resolve_dependencies(report).await,
        };
        if let Err(e) = result {
            report.error(phase, None, &e);
        }
    }

    // ── Phases 1-3: intake ───────────────────────────────────────────

    async fn intake(&self, report: &mut CycleReport) -> Result<()> {
        let repo = self.settings.repo.clone();
        let nudge_repo = repo.clone();
        let nudges = self
            .services
            .db
            .call(move |db| db.pending_nudges(&nudge_repo, NUDGE_BATCH))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to read nudges");
                Vec::new()
            });

        let mut candidates = self.scanner.scan(&repo).await?;
        report.scanned = candidates.len() as u32;

        // Nudged issues first, in nudge order; the rest keep issue order.
        let rank = |n: u64| nudges.iter().position(|x| x.issue_number == n).unwrap_or(usize::MAX);
        candidates.sort_by_key(|i| rank(i.number));

        let mut deferred = HashSet::new();
        for issue in &candidates {
            match self.intake_issue(issue, report).await {
                Ok(false) => {
                    deferred.insert(issue.number);
                }
                Ok(true) => {}
                Err(e) => report.error(CyclePhase::Intake, Some(issue.number), &e),
            }
        }

        for nudge in nudges.into_iter().filter(|n| !deferred.contains(&n.issue_number)) {
            let id = nudge.id.clone();
            if let Err(e) = self
                .services
                .db
                .call(move |db| db.mark_nudge_processed(&id))
                .await
            {
                tracing::warn!(nudge = %nudge.id, error = %e, "failed to mark nudge processed");
            }
        }
        Ok(())
    }

    /// Classify and act. `Ok(false)` when the action was held back by budget.
    async fn intake_issue(&self, issue: &Issue, report: &mut CycleReport) -> Result<bool> {
        let classification = self.classifier.classify(issue).await;
        report.classified += 1;
        self.record_classification(issue, &classification).await?;

        match classification.category {
            Category::Simple => match self.launch(issue, ModeContext::Implement, None, report).await? {
                LaunchOutcome::Deferred => return Ok(false),
                LaunchOutcome::Launched => {}
                // The label add after the earlier launch may have failed.
                LaunchOutcome::AlreadyActive => {
                    if let Err(e) = self.labels.transition(issue, Label::InProgress).await {
                        tracing::warn!(issue = issue.number, error = %e, "failed to restore in-progress label");
                    }
                }
            },
            Category::Complex => {
                let plan = self.planner.decompose(issue).await?;
                tracing::info!(issue = issue.number, sub_issues = plan.sub_issues.len(), "issue decomposed");
                report.planned += 1;
            }
            Category::Blocked => {
                let question = classification
                    .blocking_question
                    .as_deref()
                    .unwrap_or(classification.reason.as_str());
                let body = embed_metadata(
                    &format!(
                        "Before an agent can start on this I need an answer:\n\n> {}\n\nReply here and the issue will be picked up again.",
                        question
                    ),
                    &CommentMeta::new(CommentKind::BlockingQuestion),
                );
                self.services
                    .tracker
                    .add_comment(&issue.repo, issue.number, &body)
                    .await
                    .context("Failed to post blocking question")?;
                self.labels.transition(issue, Label::Blocked).await?;
                report.blocked += 1;
            }
            Category::Skip => {
                self.labels.transition(issue, Label::Skipped).await?;
                tracing::info!(issue = issue.number, reason = %classification.reason, "issue skipped");
                report.skipped += 1;
            }
        }
        Ok(true)
    }

    async fn record_classification(&self, issue: &Issue, c: &Classification) -> Result<()> {
        let repo = issue.repo.clone();
        let number = issue.number;
        let category = c.category;
        let metadata = json!({
            "reason": c.reason,
            "estimated_complexity": c.estimated_complexity,
            "dependencies": c.dependencies,
        });
        self.services
            .db
            .call(move |db| {
                let mut state = db
                    .get_issue_state(&repo, number)?
                    .unwrap_or_else(|| IssueState::new(number, &repo));
                state.classification = Some(category);
                state.last_checked_at = Some(Utc::now());
                state.metadata = metadata;
                db.upsert_issue_state(&state)
            })
            .await
    }

    /// Budget check, pending row, prompt, backend launch, then labels.
    async fn launch(
        &self,
        issue: &Issue,
        context: ModeContext,
        checkpoint: Option<Checkpoint>,
        report: &mut CycleReport,
    ) -> Result<LaunchOutcome> {
        if report.budget_exhausted {
            report.deferred += 1;
            return Ok(LaunchOutcome::Deferred);
        }
        let decision = self.budget.may_launch().await;
        if !decision.allowed {
            tracing::info!(issue = issue.number, reason = ?decision.reason, "launches paused by budget");
            report.budget_exhausted = true;
            report.deferred += 1;
            return Ok(LaunchOutcome::Deferred);
        }

        let repo = self.settings.repo.as_str();
        let prefix = self.settings.agent_branch_prefix.as_str();
        let prompt = build_prompt(issue, repo, prefix, &context, checkpoint.as_ref());
        let new = NewExecution {
            id: Execution::new_id(),
            issue_number: issue.number,
            repo: repo.to_string(),
            repo_url: self.settings.repo_url.clone(),
            mode: context.mode(),
            prompt: prompt.clone(),
            branch: Some(branch_name(prefix, issue.number, &context)),
            pr_number: context.pr_number(),
        };
        let execution_id = new.id.clone();
        let created = self
            .services
            .db
            .call(move |db| db.create_execution(&new))
            .await?;
        if created.is_none() {
            tracing::info!(issue = issue.number, "issue already has an active execution");
            return Ok(LaunchOutcome::AlreadyActive);
        }

        let mut launch_context = serde_json::to_value(&context)?;
        if let (Some(obj), Some(cp)) = (launch_context.as_object_mut(), checkpoint) {
            obj.insert("checkpoint".into(), serde_json::to_value(cp)?);
        }
        let request = LaunchRequest {
            execution_id: execution_id.clone(),
            issue_number: issue.number,
            mode: context.mode(),
            config: ExecutionConfig {
                repo_url: self.settings.repo_url.clone(),
                prompt,
            },
            context: launch_context,
        };

        let receipt = match self.services.grid.launch(request).await {
            Ok(r) => r,
            Err(source) => {
                let err = GridError::Launch {
                    issue: issue.number,
                    source,
                };
                self.fail_launch(&execution_id, &err).await;
                return Err(err.into());
            }
        };

        let run_id = receipt.external_run_id.clone();
        let id = execution_id.clone();
        self.services
            .db
            .call(move |db| db.mark_running(&id, run_id.as_deref()))
            .await?;

        if let Err(e) = self.labels.transition(issue, Label::InProgress).await {
            tracing::warn!(issue = issue.number, error = %e, "launched but failed to label in-progress");
        }
        tracing::info!(
            issue = issue.number,
            execution_id = %execution_id,
            mode = context.mode().as_str(),
            external_run_id = ?receipt.external_run_id,
            "execution launched"
        );
        report.launched += 1;
        Ok(LaunchOutcome::Launched)
    }

    async fn fail_launch(&self, execution_id: &str, err: &GridError) {
        let update = super::db::TerminalUpdate {
            id: execution_id.to_string(),
            status: grid_common::ExecutionStatus::Failed,
            result: Some(err.to_string()),
            pr_number: None,
            branch: None,
            checkpoint: None,
            cost_usd: None,
        };
        let failed = self
            .services
            .db
            .call(move |db| {
                db.complete_execution(&update)?;
                db.get_execution(&update.id)
            })
            .await;
        match failed {
            Ok(Some(execution)) => {
                self.report_failure(&execution, CommentKind::Failure, &format!("Could not start an agent: {}", err))
                    .await;
            }
            Ok(None) => {}
            Err(e) => tracing::error!(execution_id, error = %e, "failed to record launch failure"),
        }
    }

    // ── Phase 4: executions ──────────────────────────────────────────

    async fn check_timeouts(&self, report: &mut CycleReport) -> Result<()> {
        let active = self.services.db.call(|db| db.active_executions()).await?;
        let now = Utc::now();
        for exec in active {
            let since = exec.started_at.unwrap_or(exec.created_at);
            if now - since <= self.settings.execution_timeout {
                continue;
            }
            match self.time_out(&exec).await {
                Ok(true) => report.timed_out += 1,
                Ok(false) => {}
                Err(e) => report.error(CyclePhase::Executions, Some(exec.issue_number), &e.into()),
            }
        }
        Ok(())
    }

    // ── Phases 5-6: pull requests ────────────────────────────────────

    /// Feedback that could not be launched this tick (budget, or the issue
    /// still has a run going) is carried to the next one instead of being
    /// left behind the watermark.
    async fn handle_reviews(&self, report: &mut CycleReport) -> Result<()> {
        let started = Utc::now();
        let since = self
            .watermarks
            .since_or(LAST_PR_CHECK, started, self.settings.initial_lookback)
            .await?;
        if self.launches_held(report).await {
            tracing::info!("review handling deferred by budget");
            return Ok(());
        }

        let carried: Vec<ReviewFeedback> = self.watermarks.carried(CARRIED_REVIEWS).await?;
        let found = self
            .pr_monitor
            .check_reviews(&self.settings.repo, since, &carried)
            .await?;
        let mut pending = Vec::new();
        for feedback in found {
            match self.address_review(&feedback, report).await {
                Ok(true) => {}
                Ok(false) => pending.push(feedback),
                Err(e) => {
                    report.error(CyclePhase::Reviews, Some(feedback.issue_number), &e);
                    if !is_launch_failure(&e) {
                        pending.push(feedback);
                    }
                }
            }
        }
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "review feedback carried to next cycle");
        }
        self.watermarks.set_carried(CARRIED_REVIEWS, &pending).await?;
        self.watermarks.set(LAST_PR_CHECK, started).await
    }

    /// `Ok(false)` when the feedback is still waiting for a launch.
    async fn address_review(&self, feedback: &ReviewFeedback, report: &mut CycleReport) -> Result<bool> {
        let issue = self
            .services
            .tracker
            .get_issue(&self.settings.repo, feedback.issue_number)
            .await?;
        let checkpoint = self
            .checkpoints
            .latest(&self.settings.repo, feedback.issue_number)
            .await?;
        let context = ModeContext::AddressReview {
            pr_number: feedback.pr_number,
            existing_branch: feedback.branch.clone(),
            review_comments: feedback.feedback.clone(),
        };
        match self.launch(&issue, context, checkpoint, report).await? {
            LaunchOutcome::Launched => {
                report.reviews_addressed += 1;
                Ok(true)
            }
            LaunchOutcome::Deferred | LaunchOutcome::AlreadyActive => Ok(false),
        }
    }

    async fn handle_closed_prs(&self, report: &mut CycleReport) -> Result<()> {
        let started = Utc::now();
        let since = self
            .watermarks
            .since_or(LAST_CLOSED_PR_CHECK, started, self.settings.initial_lookback)
            .await?;
        if self.launches_held(report).await {
            tracing::info!("closed PR handling deferred by budget");
            return Ok(());
        }

        let mut queue: Vec<ClosedFeedback> = self.watermarks.carried(CARRIED_CLOSED_PRS).await?;
        for feedback in self.pr_monitor.check_closed(&self.settings.repo, since).await? {
            queue.retain(|c| c.pr_number != feedback.pr_number);
            queue.push(feedback);
        }

        let mut pending = Vec::new();
        for feedback in queue {
            match self.retry_rejected(&feedback, report).await {
                Ok(true) => {}
                Ok(false) => pending.push(feedback),
                Err(e) => {
                    report.error(CyclePhase::ClosedPullRequests, Some(feedback.issue_number), &e);
                    if !is_launch_failure(&e) {
                        pending.push(feedback);
                    }
                }
            }
        }
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "rejected PRs carried to next cycle");
        }
        self.watermarks.set_carried(CARRIED_CLOSED_PRS, &pending).await?;
        self.watermarks.set(LAST_CLOSED_PR_CHECK, started).await
    }

    /// `Ok(false)` when the retry is still waiting for a launch.
    async fn retry_rejected(&self, feedback: &ClosedFeedback, report: &mut CycleReport) -> Result<bool> {
        let repo = self.settings.repo.clone();
        let number = feedback.issue_number;

        let state_repo = repo.clone();
        let retry_count = self
            .services
            .db
            .call(move |db| db.get_issue_state(&state_repo, number))
            .await?
            .map(|s| s.retry_count)
            .unwrap_or(0);

        if !self.budget.retry_allowed(retry_count) {
            let body = embed_metadata(
                &format!(
                    "PR #{} was closed without merging and this issue has used all {} automatic retries. A human needs to take it from here.\n\nLatest feedback:\n\n{}",
                    feedback.pr_number,
                    self.budget.max_retries(),
                    feedback.feedback
                ),
                &CommentMeta::new(CommentKind::Escalation),
            );
            self.services.tracker.add_comment(&repo, number, &body).await?;
            self.labels.transition_number(&repo, number, Label::Failed).await?;
            tracing::warn!(issue = number, retries = retry_count, "retry limit reached, escalated");
            report.escalated += 1;
            return Ok(true);
        }

        let issue = self.services.tracker.get_issue(&repo, number).await?;
        let checkpoint = self.checkpoints.latest(&repo, number).await?;
        let what_not_to_do = match checkpoint
            .as_ref()
            .and_then(|cp| cp.get_str(Checkpoint::WHAT_NOT_TO_DO))
        {
            Some(text) => text,
            None => {
                let last_repo = repo.clone();
                self.services
                    .db
                    .call(move |db| db.latest_execution_for_issue(&last_repo, number))
                    .await?
                    .and_then(|e| e.result)
                    .unwrap_or_default()
            }
        };

        let context = ModeContext::RetryWithFeedback {
            closed_pr_number: feedback.pr_number,
            attempt: retry_count + 1,
            human_feedback: feedback.feedback.clone(),
            what_not_to_do,
        };
        match self.launch(&issue, context, checkpoint, report).await? {
            LaunchOutcome::Launched => {
                let retry_repo = repo.clone();
                let count = self
                    .services
                    .db
                    .call(move |db| db.increment_retry(&retry_repo, number))
                    .await?;
                tracing::info!(issue = number, attempt = count, pr = feedback.pr_number, "retry launched");
                report.retries_launched += 1;
                Ok(true)
            }
            LaunchOutcome::Deferred | LaunchOutcome::AlreadyActive => Ok(false),
        }
    }

    /// Budget gate for phases that exist to launch. Leaves their watermark
    /// untouched so the same feedback is seen again next tick.
    async fn launches_held(&self, report: &mut CycleReport) -> bool {
        if report.budget_exhausted {
            return true;
        }
        if self.budget.may_launch().await.allowed {
            return false;
        }
        report.budget_exhausted = true;
        true
    }

    // ── Phase 7: blockers and dependencies ───────────────────────────

    async fn resolve_blockers(&self, report: &mut CycleReport) -> Result<()> {
        let started: DateTime<Utc> = Utc::now();
        let since = self.watermarks.get(LAST_BLOCKER_CHECK).await?;
        let unblocked = self.blockers.resolve(&self.settings.repo, since).await?;
        report.unblocked += unblocked.len() as u32;
        self.watermarks.set(LAST_BLOCKER_CHECK, started).await
    }

    async fn resolve_dependencies(&self, report: &mut CycleReport) -> Result<()> {
        let repo = self.settings.repo.as_str();
        match self.deps.release_waiting(repo).await {
            Ok(released) => report.released += released.len() as u32,
            Err(e) => report.error(CyclePhase::Dependencies, None, &e),
        }
        let closed = self.deps.close_finished_epics(repo).await?;
        report.epics_closed += closed.len() as u32;
        Ok(())
    }
}

/// A launch the grid refused has already failed the issue; retrying the same
/// feedback would only fail it again.
fn is_launch_failure(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<GridError>(), Some(GridError::Launch { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names_round_trip() {
        for phase in CyclePhase::ALL {
            assert_eq!(CyclePhase::from_str(phase.as_str()), Ok(phase));
        }
        assert!(CyclePhase::from_str("nope").is_err());
    }

    #[test]
    fn test_github_event_mapping() {
        assert_eq!(
            CyclePhase::for_github_event("issues", Some("opened")),
            Some(CyclePhase::Intake)
        );
        assert_eq!(
            CyclePhase::for_github_event("issues", Some("closed")),
            Some(CyclePhase::Dependencies)
        );
        assert_eq!(
            CyclePhase::for_github_event("issue_comment", Some("created")),
            Some(CyclePhase::Blockers)
        );
        assert_eq!(
            CyclePhase::for_github_event("pull_request_review", None),
            Some(CyclePhase::Reviews)
        );
        assert_eq!(
            CyclePhase::for_github_event("pull_request", Some("closed")),
            Some(CyclePhase::ClosedPullRequests)
        );
        assert_eq!(CyclePhase::for_github_event("pull_request", Some("opened")), None);
        assert_eq!(CyclePhase::for_github_event("push", None), None);
    }

    #[test]
    fn test_report_collects_errors_with_context() {
        let mut report = CycleReport::default();
        report.error(CyclePhase::Intake, Some(42), &anyhow::anyhow!("boom"));
        report.error(CyclePhase::Blockers, None, &anyhow::anyhow!("down"));
        assert_eq!(report.errors, vec!["intake #42: boom", "blockers: down"]);
    }
}
