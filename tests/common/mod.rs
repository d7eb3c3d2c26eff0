//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use grid_common::{Comment, Issue, IssueStatus, Label};
use regex::Regex;
use tokio::sync::broadcast;

use forge_grid::config::BudgetSection;
use forge_grid::coordinator::{Coordinator, CoordinatorSettings, DbHandle, GridDb, Services};
use forge_grid::grid::{
    EventBus, ExecutionGrid, GridEvent, GridExecution, LaunchReceipt, LaunchRequest, RunRegistry,
};
use forge_grid::llm::{CompletionRequest, CompletionService, ModelTier};
use forge_grid::tracker::{
    CodeHost, IssueFilter, IssueTracker, PrState, PullRequest, Review, ReviewComment,
    StateFilter, SubIssueDraft, format_linkage, parse_linkage,
};

pub const REPO: &str = "acme/widgets";
pub const BOT: &str = "forge-grid";

// ── Tracker + code host ─────────────────────────────────────────────

#[derive(Default)]
struct TrackerState {
    issues: BTreeMap<u64, Issue>,
    next_comment_id: u64,
    pull_requests: Vec<PullRequest>,
    reviews: HashMap<u64, Vec<Review>>,
    review_comments: HashMap<u64, Vec<ReviewComment>>,
    unreadable: HashSet<u64>,
    ensured_labels: Vec<Label>,
}

/// Issues, labels, comments and pull requests held in memory. Comments the
/// coordinator posts are authored by [`BOT`].
pub struct FakeTracker {
    state: Mutex<TrackerState>,
}

impl FakeTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState::default()),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_issue(&self, number: u64, title: &str, body: &str, labels: &[Label]) {
        let (parent, blocked_by) = parse_linkage(body);
        let issue = Issue {
            number,
            repo: REPO.into(),
            title: title.into(),
            body: body.into(),
            comments: vec![],
            labels: labels.iter().map(|l| l.as_str().to_string()).collect(),
            status: IssueStatus::Open,
            parent,
            blocked_by,
            sub_issues: vec![],
        };
        self.with(|s| s.issues.insert(number, issue));
    }

    pub fn issue(&self, number: u64) -> Issue {
        self.with(|s| s.issues.get(&number).cloned().expect("issue exists"))
    }

    pub fn labels(&self, number: u64) -> Vec<String> {
        self.issue(number).labels
    }

    pub fn has_label(&self, number: u64, label: Label) -> bool {
        self.issue(number).has_label(label)
    }

    pub fn comments(&self, number: u64) -> Vec<Comment> {
        self.issue(number).comments
    }

    pub fn set_status(&self, number: u64, status: IssueStatus) {
        self.with(|s| {
            if let Some(issue) = s.issues.get_mut(&number) {
                issue.status = status;
            }
        });
    }

    pub fn close(&self, number: u64) {
        self.set_status(number, IssueStatus::Closed);
    }

    /// `get_issue` fails for this number from now on.
    pub fn make_unreadable(&self, number: u64) {
        self.with(|s| s.unreadable.insert(number));
    }

    pub fn human_comment(&self, number: u64, author: &str, body: &str, at: DateTime<Utc>) {
        self.push_comment(number, author, body, at);
    }

    fn push_comment(&self, number: u64, author: &str, body: &str, at: DateTime<Utc>) {
        self.with(|s| {
            s.next_comment_id += 1;
            let id = s.next_comment_id;
            if let Some(issue) = s.issues.get_mut(&number) {
                issue.comments.push(Comment {
                    id,
                    author: author.into(),
                    author_is_bot: false,
                    body: body.into(),
                    created_at: at,
                });
            }
        });
    }

    /// Issues created under `parent`, in creation order.
    pub fn sub_issues_of(&self, parent: u64) -> Vec<Issue> {
        self.with(|s| {
            s.issues
                .values()
                .filter(|i| i.parent == Some(parent))
                .cloned()
                .collect()
        })
    }

    pub fn ensured_labels(&self) -> Vec<Label> {
        self.with(|s| s.ensured_labels.clone())
    }

    // Code host side

    pub fn open_pr(&self, number: u64, issue: u64, head_ref: &str) {
        self.with(|s| {
            s.pull_requests.push(PullRequest {
                number,
                title: format!("Fix #{}", issue),
                body: format!("Agent change.\n\nCloses #{}", issue),
                head_ref: head_ref.into(),
                merged: false,
                closed_at: None,
            })
        });
    }

    pub fn close_pr(&self, number: u64, at: DateTime<Utc>) {
        self.with(|s| {
            if let Some(pr) = s.pull_requests.iter_mut().find(|p| p.number == number) {
                pr.closed_at = Some(at);
            }
        });
    }

    /// Comment on a pull request's conversation. Pull requests share the
    /// issue number space, so the comment lives on a hidden issue entry.
    pub fn pr_comment(&self, pr: u64, author: &str, body: &str, at: DateTime<Utc>) {
        self.with(|s| {
            s.issues.entry(pr).or_insert_with(|| Issue {
                number: pr,
                repo: REPO.into(),
                title: format!("PR #{}", pr),
                body: String::new(),
                comments: vec![],
                labels: vec![],
                status: IssueStatus::Closed,
                parent: None,
                blocked_by: vec![],
                sub_issues: vec![],
            });
        });
        self.push_comment(pr, author, body, at);
    }

    pub fn add_review(&self, pr: u64, author: &str, state: &str, body: &str, at: DateTime<Utc>) {
        self.with(|s| {
            let reviews = s.reviews.entry(pr).or_default();
            let id = reviews.len() as u64 + 1;
            reviews.push(Review {
                id,
                author: author.into(),
                state: state.into(),
                body: body.into(),
                submitted_at: Some(at),
            });
        });
    }

    pub fn add_review_comment(&self, pr: u64, path: &str, body: &str, at: DateTime<Utc>) {
        self.with(|s| {
            let comments = s.review_comments.entry(pr).or_default();
            let id = comments.len() as u64 + 1;
            comments.push(ReviewComment {
                id,
                author: "reviewer".into(),
                path: path.into(),
                body: body.into(),
                created_at: at,
            });
        });
    }
}

fn matches_filter(issue: &Issue, filter: &IssueFilter) -> bool {
    let state_ok = match filter.state {
        StateFilter::Open => issue.status == IssueStatus::Open,
        StateFilter::Closed => issue.status == IssueStatus::Closed,
        StateFilter::All => true,
    };
    state_ok && filter.labels.iter().all(|l| issue.has_label(*l))
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn list_issues(&self, _repo: &str, filter: &IssueFilter) -> Result<Vec<Issue>> {
        let prs: HashSet<u64> = self.with(|s| s.pull_requests.iter().map(|p| p.number).collect());
        Ok(self.with(|s| {
            s.issues
                .values()
                .filter(|i| !prs.contains(&i.number))
                .filter(|i| matches_filter(i, filter))
                .map(|i| Issue {
                    comments: vec![],
                    ..i.clone()
                })
                .collect()
        }))
    }

    async fn get_issue(&self, _repo: &str, number: u64) -> Result<Issue> {
        self.with(|s| {
            if s.unreadable.contains(&number) {
                return Err(anyhow!("GitHub API error 502 for get issue #{}", number));
            }
            s.issues
                .get(&number)
                .cloned()
                .ok_or_else(|| anyhow!("issue #{} not found", number))
        })
    }

    async fn list_sub_issues(&self, _repo: &str, parent: u64) -> Result<Vec<Issue>> {
        Ok(self.sub_issues_of(parent))
    }

    async fn create_sub_issue(
        &self,
        _repo: &str,
        parent: u64,
        draft: &SubIssueDraft,
    ) -> Result<Issue> {
        let body = format!("{}\n{}", format_linkage(parent, &draft.blocked_by), draft.body);
        let number = self.with(|s| {
            let number = s.issues.keys().max().copied().unwrap_or(0).max(100) + 1;
            if let Some(p) = s.issues.get_mut(&parent) {
                p.sub_issues.push(number);
            }
            number
        });
        self.add_issue(number, &draft.title, &body, &draft.labels);
        Ok(self.issue(number))
    }

    async fn add_comment(&self, _repo: &str, number: u64, body: &str) -> Result<()> {
        if self.with(|s| !s.issues.contains_key(&number)) {
            return Err(anyhow!("issue #{} not found", number));
        }
        self.push_comment(number, BOT, body, Utc::now());
        Ok(())
    }

    async fn update_status(&self, _repo: &str, number: u64, status: IssueStatus) -> Result<()> {
        self.set_status(number, status);
        Ok(())
    }

    async fn add_label(&self, _repo: &str, number: u64, label: Label) -> Result<()> {
        self.with(|s| {
            let issue = s
                .issues
                .get_mut(&number)
                .ok_or_else(|| anyhow!("issue #{} not found", number))?;
            if !issue.has_label(label) {
                issue.labels.push(label.as_str().to_string());
            }
            Ok(())
        })
    }

    async fn remove_label(&self, _repo: &str, number: u64, label: Label) -> Result<()> {
        self.with(|s| {
            if let Some(issue) = s.issues.get_mut(&number) {
                issue.labels.retain(|l| l != label.as_str());
            }
        });
        Ok(())
    }

    async fn ensure_label(&self, _repo: &str, label: Label) -> Result<()> {
        self.with(|s| {
            if !s.ensured_labels.contains(&label) {
                s.ensured_labels.push(label);
            }
        });
        Ok(())
    }
}

#[async_trait]
impl CodeHost for FakeTracker {
    async fn list_pull_requests(&self, _repo: &str, state: PrState) -> Result<Vec<PullRequest>> {
        Ok(self.with(|s| {
            s.pull_requests
                .iter()
                .filter(|p| match state {
                    PrState::Open => p.closed_at.is_none(),
                    PrState::Closed => p.closed_at.is_some(),
                })
                .cloned()
                .collect()
        }))
    }

    async fn list_reviews(&self, _repo: &str, pr: u64) -> Result<Vec<Review>> {
        Ok(self.with(|s| s.reviews.get(&pr).cloned().unwrap_or_default()))
    }

    async fn list_review_comments(&self, _repo: &str, pr: u64) -> Result<Vec<ReviewComment>> {
        Ok(self.with(|s| s.review_comments.get(&pr).cloned().unwrap_or_default()))
    }

    async fn list_comments_since(
        &self,
        _repo: &str,
        number: u64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Comment>> {
        Ok(self.with(|s| {
            s.issues
                .get(&number)
                .map(|i| {
                    i.comments
                        .iter()
                        .filter(|c| c.created_at > since)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        }))
    }
}

// ── Grid ────────────────────────────────────────────────────────────

/// Records launches and cancels; never runs anything.
#[derive(Default)]
pub struct FakeGrid {
    registry: RunRegistry,
    events: EventBus,
    launches: Mutex<Vec<LaunchRequest>>,
    cancels: Mutex<Vec<String>>,
    fail_launches: AtomicBool,
}

impl FakeGrid {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionGrid for FakeGrid {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchReceipt> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(anyhow!("machine API returned 503"));
        }
        let run = GridExecution {
            execution_id: request.execution_id.clone(),
            issue_number: request.issue_number,
            mode: request.mode,
            external_run_id: Some(format!("m-{}", request.issue_number)),
            launched_at: Utc::now(),
        };
        self.registry.insert(run.clone());
        self.events.publish(GridEvent::Started {
            execution_id: run.execution_id.clone(),
            issue_number: run.issue_number,
        });
        self.launches.lock().unwrap().push(request);
        Ok(LaunchReceipt {
            execution_id: run.execution_id,
            external_run_id: run.external_run_id,
        })
    }

    async fn status(&self, execution_id: &str) -> Option<GridExecution> {
        self.registry.get(execution_id)
    }

    async fn cancel(&self, execution_id: &str) -> Result<bool> {
        self.cancels.lock().unwrap().push(execution_id.to_string());
        Ok(self.registry.get(execution_id).is_some())
    }

    async fn list_active(&self) -> Vec<GridExecution> {
        self.registry.list()
    }

    fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.events.subscribe()
    }

    fn adopt(&self, run: GridExecution) {
        self.registry.insert(run);
    }

    async fn finish(&self, execution_id: &str, event: GridEvent) {
        self.registry.remove(execution_id);
        self.events.publish(event);
    }
}

// ── Completion service ──────────────────────────────────────────────

static ISSUE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\d+)").unwrap());

/// Answers by model tier and the first `#N` in the prompt: fast-tier calls
/// are classifications, strong-tier calls are plans. Unscripted calls fail.
#[derive(Default)]
pub struct ScriptedCompletion {
    classifications: Mutex<HashMap<u64, String>>,
    plans: Mutex<HashMap<u64, String>>,
    calls: Mutex<VecDeque<(ModelTier, u64)>>,
}

impl ScriptedCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn classify(&self, issue: u64, response: &str) {
        self.classifications
            .lock()
            .unwrap()
            .insert(issue, response.to_string());
    }

    pub fn plan(&self, issue: u64, response: &str) {
        self.plans.lock().unwrap().insert(issue, response.to_string());
    }

    pub fn calls(&self) -> Vec<(ModelTier, u64)> {
        self.calls.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let issue = ISSUE_NUMBER
            .captures(&request.prompt)
            .and_then(|c| c[1].parse::<u64>().ok())
            .ok_or_else(|| anyhow!("prompt names no issue"))?;
        self.calls.lock().unwrap().push_back((request.tier, issue));
        let scripted = match request.tier {
            ModelTier::Fast => self.classifications.lock().unwrap().get(&issue).cloned(),
            ModelTier::Strong => self.plans.lock().unwrap().get(&issue).cloned(),
        };
        scripted.ok_or_else(|| anyhow!("completion service unavailable"))
    }
}

pub fn simple(reason: &str) -> String {
    format!(r#"{{"category": "SIMPLE", "reason": "{}", "estimated_complexity": 2}}"#, reason)
}

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub coordinator: Coordinator,
    pub tracker: Arc<FakeTracker>,
    pub grid: Arc<FakeGrid>,
    pub completion: Arc<ScriptedCompletion>,
    pub db: DbHandle,
}

pub fn settings(budget: BudgetSection) -> CoordinatorSettings {
    CoordinatorSettings {
        repo: REPO.into(),
        repo_url: format!("https://github.com/{}.git", REPO),
        agent_branch_prefix: "agent/".into(),
        execution_timeout: Duration::minutes(60),
        initial_lookback: Duration::hours(24),
        budget,
    }
}

pub fn harness() -> Harness {
    harness_with(BudgetSection::default())
}

pub fn harness_with(budget: BudgetSection) -> Harness {
    harness_with_settings(settings(budget))
}

pub fn harness_with_settings(settings: CoordinatorSettings) -> Harness {
    let tracker = FakeTracker::new();
    let grid = FakeGrid::new();
    let completion = ScriptedCompletion::new();
    let db = DbHandle::new(GridDb::new_in_memory().unwrap());
    let services = Services {
        tracker: tracker.clone(),
        code_host: tracker.clone(),
        grid: grid.clone(),
        completion: completion.clone(),
        db: db.clone(),
    };
    Harness {
        coordinator: Coordinator::new(services, settings),
        tracker,
        grid,
        completion,
        db,
    }
}
