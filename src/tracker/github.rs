//! GitHub REST implementation of [`IssueTracker`] and [`CodeHost`].

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grid_common::{Comment, Issue, IssueStatus, Label};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{
    CodeHost, IssueFilter, IssueTracker, PrState, PullRequest, Review, ReviewComment,
    SubIssueDraft, format_linkage, parse_linkage,
};
use crate::config::GithubSection;

const PER_PAGE: usize = 100;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    /// Pull requests also come through the issues endpoint; filter them out.
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    id: u64,
    user: Option<GhUser>,
    body: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GhRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    number: u64,
    title: String,
    body: Option<String>,
    head: GhRef,
    merged_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GhReview {
    id: u64,
    user: Option<GhUser>,
    state: String,
    body: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GhReviewComment {
    id: u64,
    user: Option<GhUser>,
    path: String,
    body: String,
    created_at: DateTime<Utc>,
}

fn login(user: &Option<GhUser>) -> String {
    user.as_ref()
        .map(|u| u.login.clone())
        .unwrap_or_else(|| "ghost".to_string())
}

impl GhIssue {
    fn into_issue(self, repo: &str) -> Issue {
        let body = self.body.unwrap_or_default();
        let (parent, blocked_by) = parse_linkage(&body);
        Issue {
            number: self.number,
            repo: repo.to_string(),
            title: self.title,
            body,
            comments: Vec::new(),
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            status: if self.state == "closed" {
                IssueStatus::Closed
            } else {
                IssueStatus::Open
            },
            parent,
            blocked_by,
            sub_issues: Vec::new(),
        }
    }
}

impl From<GhComment> for Comment {
    fn from(c: GhComment) -> Self {
        let author_is_bot = c.user.as_ref().is_some_and(|u| u.kind == "Bot");
        Comment {
            id: c.id,
            author: login(&c.user),
            author_is_bot,
            body: c.body.unwrap_or_default(),
            created_at: c.created_at,
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
}

impl GitHubClient {
    pub fn new(config: &GithubSection) -> Result<Self> {
        let token = config
            .token
            .as_deref()
            .context("GITHUB_TOKEN is required")?;

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("forge-grid"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .context("Invalid GitHub authorization header")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create GitHub API client")?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Send with retries on 429/5xx and transport errors. Any other status is
    /// handed back to the caller.
    async fn send<F>(&self, operation: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if retryable && attempt < MAX_ATTEMPTS {
                        tracing::debug!(operation, %status, attempt, "retrying GitHub request");
                        tokio::time::sleep(retry_delay(attempt)).await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) if attempt < MAX_ATTEMPTS && (e.is_timeout() || e.is_connect()) => {
                    tracing::debug!(operation, error = %e, attempt, "retrying GitHub request");
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("GitHub {} request failed", operation));
                }
            }
        }
    }

    async fn request_json<T, F>(&self, operation: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let resp = self.send(operation, build).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GitHub {} failed with status {}: {}", operation, status, body);
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("Failed to decode GitHub {} response", operation))
    }

    async fn request_ok<F>(&self, operation: &str, build: F) -> Result<()>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let resp = self.send(operation, build).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GitHub {} failed with status {}: {}", operation, status, body);
        }
        Ok(())
    }

    /// Follow `page=N` until a short page comes back.
    async fn paginate<T>(&self, operation: &str, path: &str, query: &[(&str, String)]) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let mut rows = Vec::new();
        let mut page = 1u32;
        loop {
            let chunk: Vec<T> = self
                .request_json(operation, || {
                    self.http
                        .get(&url)
                        .query(query)
                        .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())])
                })
                .await?;
            let count = chunk.len();
            rows.extend(chunk);
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(rows)
    }

    async fn list_comments(&self, repo: &str, number: u64) -> Result<Vec<Comment>> {
        let comments: Vec<GhComment> = self
            .paginate(
                "list comments",
                &format!("/repos/{}/issues/{}/comments", repo, number),
                &[],
            )
            .await?;
        Ok(comments.into_iter().map(Comment::from).collect())
    }
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(RETRY_BASE_DELAY_MS * 2u64.pow(attempt.saturating_sub(1)))
}

#[async_trait]
impl IssueTracker for GitHubClient {
    async fn list_issues(&self, repo: &str, filter: &IssueFilter) -> Result<Vec<Issue>> {
        let mut query = vec![("state", filter.state.as_str().to_string())];
        if !filter.labels.is_empty() {
            let labels: Vec<&str> = filter.labels.iter().map(|l| l.as_str()).collect();
            query.push(("labels", labels.join(",")));
        }
        let issues: Vec<GhIssue> = self
            .paginate("list issues", &format!("/repos/{}/issues", repo), &query)
            .await?;
        Ok(issues
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .map(|i| i.into_issue(repo))
            .collect())
    }

    async fn get_issue(&self, repo: &str, number: u64) -> Result<Issue> {
        let url = self.url(&format!("/repos/{}/issues/{}", repo, number));
        let raw: GhIssue = self
            .request_json("get issue", || self.http.get(&url))
            .await?;
        let mut issue = raw.into_issue(repo);
        issue.comments = self.list_comments(repo, number).await?;
        Ok(issue)
    }

    async fn list_sub_issues(&self, repo: &str, parent: u64) -> Result<Vec<Issue>> {
        let filter = IssueFilter {
            state: super::StateFilter::All,
            labels: vec![Label::SubIssue],
        };
        let all = self.list_issues(repo, &filter).await?;
        Ok(all
            .into_iter()
            .filter(|i| i.parent == Some(parent))
            .collect())
    }

    async fn create_sub_issue(
        &self,
        repo: &str,
        parent: u64,
        draft: &SubIssueDraft,
    ) -> Result<Issue> {
        let url = self.url(&format!("/repos/{}/issues", repo));
        let body = format!("{}\n{}", format_linkage(parent, &draft.blocked_by), draft.body);
        let labels: Vec<&str> = draft.labels.iter().map(|l| l.as_str()).collect();
        let payload = json!({ "title": draft.title, "body": body, "labels": labels });
        let created: GhIssue = self
            .request_json("create issue", || self.http.post(&url).json(&payload))
            .await?;
        Ok(created.into_issue(repo))
    }

    async fn add_comment(&self, repo: &str, number: u64, body: &str) -> Result<()> {
        let url = self.url(&format!("/repos/{}/issues/{}/comments", repo, number));
        let payload = json!({ "body": body });
        self.request_ok("create comment", || self.http.post(&url).json(&payload))
            .await
    }

    async fn update_status(&self, repo: &str, number: u64, status: IssueStatus) -> Result<()> {
        let url = self.url(&format!("/repos/{}/issues/{}", repo, number));
        let payload = json!({ "state": status.as_str() });
        self.request_ok("update issue", || self.http.patch(&url).json(&payload))
            .await
    }

    async fn add_label(&self, repo: &str, number: u64, label: Label) -> Result<()> {
        let url = self.url(&format!("/repos/{}/issues/{}/labels", repo, number));
        let payload = json!({ "labels": [label.as_str()] });
        self.request_ok("add label", || self.http.post(&url).json(&payload))
            .await
    }

    async fn remove_label(&self, repo: &str, number: u64, label: Label) -> Result<()> {
        let url = self.url(&format!(
            "/repos/{}/issues/{}/labels/{}",
            repo,
            number,
            label.as_str()
        ));
        let resp = self.send("remove label", || self.http.delete(&url)).await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("GitHub remove label failed with status {}: {}", status, body)
    }

    async fn ensure_label(&self, repo: &str, label: Label) -> Result<()> {
        let url = self.url(&format!("/repos/{}/labels", repo));
        let payload = json!({
            "name": label.as_str(),
            "color": label.color(),
            "description": label.description(),
        });
        let resp = self
            .send("create label", || self.http.post(&url).json(&payload))
            .await?;
        let status = resp.status();
        // 422 means the label already exists.
        if status.is_success() || status == StatusCode::UNPROCESSABLE_ENTITY {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("GitHub create label failed with status {}: {}", status, body)
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    async fn list_pull_requests(&self, repo: &str, state: PrState) -> Result<Vec<PullRequest>> {
        let path = format!("/repos/{}/pulls", repo);
        let pulls: Vec<GhPull> = match state {
            PrState::Open => {
                self.paginate("list pull requests", &path, &[("state", "open".to_string())])
                    .await?
            }
            // Most recently updated first; the watermark filters older ones.
            PrState::Closed => {
                let url = self.url(&path);
                self.request_json("list closed pull requests", || {
                    self.http.get(&url).query(&[
                        ("state", "closed"),
                        ("sort", "updated"),
                        ("direction", "desc"),
                        ("per_page", "100"),
                    ])
                })
                .await?
            }
        };
        Ok(pulls
            .into_iter()
            .map(|p| PullRequest {
                number: p.number,
                title: p.title,
                body: p.body.unwrap_or_default(),
                head_ref: p.head.name,
                merged: p.merged_at.is_some(),
                closed_at: p.closed_at,
            })
            .collect())
    }

    async fn list_reviews(&self, repo: &str, pr: u64) -> Result<Vec<Review>> {
        let reviews: Vec<GhReview> = self
            .paginate(
                "list reviews",
                &format!("/repos/{}/pulls/{}/reviews", repo, pr),
                &[],
            )
            .await?;
        Ok(reviews
            .into_iter()
            .map(|r| Review {
                id: r.id,
                author: login(&r.user),
                state: r.state,
                body: r.body.unwrap_or_default(),
                submitted_at: r.submitted_at,
            })
            .collect())
    }

    async fn list_review_comments(&self, repo: &str, pr: u64) -> Result<Vec<ReviewComment>> {
        let comments: Vec<GhReviewComment> = self
            .paginate(
                "list review comments",
                &format!("/repos/{}/pulls/{}/comments", repo, pr),
                &[],
            )
            .await?;
        Ok(comments
            .into_iter()
            .map(|c| ReviewComment {
                id: c.id,
                author: login(&c.user),
                path: c.path,
                body: c.body,
                created_at: c.created_at,
            })
            .collect())
    }

    async fn list_comments_since(
        &self,
        repo: &str,
        number: u64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Comment>> {
        // `since` filters on updated_at server-side; tighten to created_at here.
        let comments: Vec<GhComment> = self
            .paginate(
                "list comments since",
                &format!("/repos/{}/issues/{}/comments", repo, number),
                &[("since", since.to_rfc3339())],
            )
            .await?;
        Ok(comments
            .into_iter()
            .map(Comment::from)
            .filter(|c| c.created_at > since)
            .collect())
    }
}
