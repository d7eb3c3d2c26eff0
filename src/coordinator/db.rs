use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use grid_common::{
    Category, Checkpoint, Execution, ExecutionMode, ExecutionStatus, IssueState,
};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::{Deserialize, Serialize};

/// Async-safe handle to the coordinator database.
///
/// Wraps `GridDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<GridDb>>,
}

impl DbHandle {
    pub fn new(db: GridDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&GridDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, GridDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

// ── Inputs and outcomes ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewExecution {
    pub id: String,
    pub issue_number: u64,
    pub repo: String,
    pub repo_url: String,
    pub mode: ExecutionMode,
    pub prompt: String,
    pub branch: Option<String>,
    pub pr_number: Option<u64>,
}

/// Fields written by a terminal transition. `None` leaves the stored value.
#[derive(Debug, Clone)]
pub struct TerminalUpdate {
    pub id: String,
    pub status: ExecutionStatus,
    pub result: Option<String>,
    pub pr_number: Option<u64>,
    pub branch: Option<String>,
    pub checkpoint: Option<Checkpoint>,
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// This call moved the execution out of an active status.
    Transitioned,
    /// Someone else already did; nothing was written.
    AlreadyTerminal,
    NotFound,
}

/// A request to pick up an issue ahead of the normal scan order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Nudge {
    pub id: String,
    pub repo: String,
    pub issue_number: u64,
    pub source_execution_id: Option<String>,
    pub priority: i64,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionQuery {
    pub status: Option<ExecutionStatus>,
    pub issue: Option<u64>,
    pub limit: Option<u32>,
}

pub struct GridDb {
    conn: Connection,
}

const EXECUTION_COLUMNS: &str = "id, issue_number, repo, repo_url, status, mode, prompt, result, \
     pr_number, branch, checkpoint, external_run_id, cost_usd, created_at, started_at, completed_at";

impl GridDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to configure SQLite")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS executions (
                    id TEXT PRIMARY KEY,
                    issue_number INTEGER NOT NULL,
                    repo TEXT NOT NULL,
                    repo_url TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    mode TEXT NOT NULL DEFAULT 'implement',
                    prompt TEXT NOT NULL DEFAULT '',
                    result TEXT,
                    pr_number INTEGER,
                    branch TEXT,
                    checkpoint TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS issue_state (
                    issue_number INTEGER NOT NULL,
                    repo TEXT NOT NULL,
                    classification TEXT,
                    parent_issue INTEGER,
                    sub_issues TEXT NOT NULL DEFAULT '[]',
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_checked_at TEXT,
                    metadata TEXT NOT NULL DEFAULT 'null',
                    PRIMARY KEY (issue_number, repo)
                );

                CREATE TABLE IF NOT EXISTS cron_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS budget_usage (
                    execution_id TEXT PRIMARY KEY,
                    issue_number INTEGER NOT NULL,
                    cost_usd REAL NOT NULL DEFAULT 0,
                    duration_secs INTEGER NOT NULL DEFAULT 0,
                    recorded_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    delivery_id TEXT PRIMARY KEY,
                    event TEXT NOT NULL,
                    received_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS nudges (
                    id TEXT PRIMARY KEY,
                    repo TEXT NOT NULL,
                    issue_number INTEGER NOT NULL,
                    source_execution_id TEXT,
                    priority INTEGER NOT NULL DEFAULT 0,
                    reason TEXT,
                    created_at TEXT NOT NULL,
                    processed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_executions_issue ON executions(repo, issue_number);
                CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
                CREATE INDEX IF NOT EXISTS idx_budget_usage_recorded ON budget_usage(recorded_at);
                CREATE INDEX IF NOT EXISTS idx_nudges_pending ON nudges(repo, processed_at);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (columns are nullable, safe to re-run).
        // Only "duplicate column" errors are ignored.
        for (column, ddl) in [
            ("external_run_id", "ALTER TABLE executions ADD COLUMN external_run_id TEXT"),
            ("cost_usd", "ALTER TABLE executions ADD COLUMN cost_usd REAL"),
        ] {
            match self.conn.execute(ddl, []) {
                Ok(_) => {}
                Err(e) if e.to_string().contains("duplicate column") => {}
                Err(e) => {
                    return Err(anyhow::anyhow!("Failed to add {} column: {}", column, e));
                }
            }
        }

        // At most one pending/running execution per issue.
        self.conn
            .execute_batch(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_one_active
                 ON executions(repo, issue_number)
                 WHERE status IN ('pending', 'running');",
            )
            .context("Failed to create active execution index")?;
        Ok(())
    }

    // ── Executions ───────────────────────────────────────────────────

    /// Insert a pending execution. `None` when the issue already has an
    /// active one.
    pub fn create_execution(&self, new: &NewExecution) -> Result<Option<Execution>> {
        let now = ts(Utc::now());
        let inserted = self.conn.execute(
            "INSERT INTO executions (id, issue_number, repo, repo_url, status, mode, prompt, branch, pr_number, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, ?9)",
            params![
                new.id,
                new.issue_number as i64,
                new.repo,
                new.repo_url,
                new.mode.as_str(),
                new.prompt,
                new.branch,
                new.pr_number.map(|n| n as i64),
                now,
            ],
        );
        match inserted {
            Ok(_) => self.get_execution(&new.id),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to insert execution"),
        }
    }

    /// pending → running. Returns false if the execution is no longer pending.
    pub fn mark_running(&self, id: &str, external_run_id: Option<&str>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE executions
                 SET status = 'running', started_at = ?2, external_run_id = COALESCE(?3, external_run_id)
                 WHERE id = ?1 AND status = 'pending'",
                params![id, ts(Utc::now()), external_run_id],
            )
            .context("Failed to mark execution running")?;
        Ok(changed == 1)
    }

    /// Conditional terminal transition. Only the first caller writes.
    pub fn complete_execution(&self, update: &TerminalUpdate) -> Result<TransitionOutcome> {
        anyhow::ensure!(
            update.status.is_terminal(),
            "complete_execution requires a terminal status, got {}",
            update.status.as_str()
        );
        let checkpoint = update
            .checkpoint
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize checkpoint")?;
        let changed = self
            .conn
            .execute(
                "UPDATE executions
                 SET status = ?2,
                     result = COALESCE(?3, result),
                     pr_number = COALESCE(?4, pr_number),
                     branch = COALESCE(?5, branch),
                     checkpoint = COALESCE(?6, checkpoint),
                     cost_usd = COALESCE(?7, cost_usd),
                     completed_at = ?8
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![
                    update.id,
                    update.status.as_str(),
                    update.result,
                    update.pr_number.map(|n| n as i64),
                    update.branch,
                    checkpoint,
                    update.cost_usd,
                    ts(Utc::now()),
                ],
            )
            .context("Failed to complete execution")?;
        if changed == 1 {
            return Ok(TransitionOutcome::Transitioned);
        }
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM executions WHERE id = ?1)",
            params![update.id],
            |row| row.get(0),
        )?;
        Ok(if exists {
            TransitionOutcome::AlreadyTerminal
        } else {
            TransitionOutcome::NotFound
        })
    }

    pub fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let sql = format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS);
        self.conn
            .query_row(&sql, params![id], ExecutionRow::from_row)
            .optional()
            .context("Failed to query execution")?
            .map(ExecutionRow::into_execution)
            .transpose()
    }

    pub fn list_executions(&self, query: &ExecutionQuery) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR issue_number = ?2)
             ORDER BY created_at DESC
             LIMIT ?3",
            EXECUTION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    query.status.map(|s| s.as_str()),
                    query.issue.map(|n| n as i64),
                    query.limit.unwrap_or(100),
                ],
                ExecutionRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list executions")?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    pub fn active_executions(&self) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions WHERE status IN ('pending', 'running') ORDER BY created_at",
            EXECUTION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], ExecutionRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list active executions")?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    pub fn count_active(&self) -> Result<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM executions WHERE status IN ('pending', 'running')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn active_execution_for_issue(&self, repo: &str, issue: u64) -> Result<Option<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions
             WHERE repo = ?1 AND issue_number = ?2 AND status IN ('pending', 'running')",
            EXECUTION_COLUMNS
        );
        self.conn
            .query_row(&sql, params![repo, issue as i64], ExecutionRow::from_row)
            .optional()?
            .map(ExecutionRow::into_execution)
            .transpose()
    }

    pub fn latest_execution_for_issue(&self, repo: &str, issue: u64) -> Result<Option<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions WHERE repo = ?1 AND issue_number = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            EXECUTION_COLUMNS
        );
        self.conn
            .query_row(&sql, params![repo, issue as i64], ExecutionRow::from_row)
            .optional()?
            .map(ExecutionRow::into_execution)
            .transpose()
    }

    // ── Checkpoints ──────────────────────────────────────────────────

    pub fn save_checkpoint(&self, execution_id: &str, checkpoint: &Checkpoint) -> Result<bool> {
        let json = serde_json::to_string(checkpoint).context("Failed to serialize checkpoint")?;
        let changed = self.conn.execute(
            "UPDATE executions SET checkpoint = ?2 WHERE id = ?1",
            params![execution_id, json],
        )?;
        Ok(changed == 1)
    }

    /// Checkpoint of the most recent execution for the issue that left one.
    pub fn latest_checkpoint(&self, repo: &str, issue: u64) -> Result<Option<Checkpoint>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT checkpoint FROM executions
                 WHERE repo = ?1 AND issue_number = ?2 AND checkpoint IS NOT NULL
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![repo, issue as i64],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).context("Failed to parse stored checkpoint"))
            .transpose()
    }

    // ── Issue state ──────────────────────────────────────────────────

    pub fn get_issue_state(&self, repo: &str, issue: u64) -> Result<Option<IssueState>> {
        self.conn
            .query_row(
                "SELECT issue_number, repo, classification, parent_issue, sub_issues, retry_count,
                        last_checked_at, metadata
                 FROM issue_state WHERE repo = ?1 AND issue_number = ?2",
                params![repo, issue as i64],
                |row| {
                    Ok(IssueStateRow {
                        issue_number: row.get(0)?,
                        repo: row.get(1)?,
                        classification: row.get(2)?,
                        parent_issue: row.get(3)?,
                        sub_issues: row.get(4)?,
                        retry_count: row.get(5)?,
                        last_checked_at: row.get(6)?,
                        metadata: row.get(7)?,
                    })
                },
            )
            .optional()?
            .map(IssueStateRow::into_issue_state)
            .transpose()
    }

    pub fn upsert_issue_state(&self, state: &IssueState) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO issue_state
                    (issue_number, repo, classification, parent_issue, sub_issues, retry_count, last_checked_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(issue_number, repo) DO UPDATE SET
                    classification = excluded.classification,
                    parent_issue = excluded.parent_issue,
                    sub_issues = excluded.sub_issues,
                    retry_count = excluded.retry_count,
                    last_checked_at = excluded.last_checked_at,
                    metadata = excluded.metadata",
                params![
                    state.issue_number as i64,
                    state.repo,
                    state.classification.map(|c| c.as_str()),
                    state.parent_issue.map(|n| n as i64),
                    serde_json::to_string(&state.sub_issues)?,
                    state.retry_count,
                    state.last_checked_at.map(ts),
                    serde_json::to_string(&state.metadata)?,
                ],
            )
            .context("Failed to upsert issue state")?;
        Ok(())
    }

    /// Increment and return the retry count, creating the row if needed.
    pub fn increment_retry(&self, repo: &str, issue: u64) -> Result<u32> {
        let count: u32 = self
            .conn
            .query_row(
                "INSERT INTO issue_state (issue_number, repo, retry_count) VALUES (?1, ?2, 1)
                 ON CONFLICT(issue_number, repo) DO UPDATE SET retry_count = retry_count + 1
                 RETURNING retry_count",
                params![issue as i64, repo],
                |row| row.get(0),
            )
            .context("Failed to increment retry count")?;
        Ok(count)
    }

    // ── Cron state (watermarks) ──────────────────────────────────────

    pub fn get_cron(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM cron_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).context("Failed to parse cron state value"))
            .transpose()
    }

    pub fn set_cron(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cron_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value.to_string(), ts(Utc::now())],
        )?;
        Ok(())
    }

    // ── Budget usage ─────────────────────────────────────────────────

    /// Record usage once per execution. Returns false for a replay.
    pub fn record_usage(
        &self,
        execution_id: &str,
        issue: u64,
        cost_usd: f64,
        duration_secs: i64,
    ) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO budget_usage (execution_id, issue_number, cost_usd, duration_secs, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                execution_id,
                issue as i64,
                cost_usd,
                duration_secs,
                ts(Utc::now())
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn cost_since(&self, since: DateTime<Utc>) -> Result<f64> {
        let total: f64 = self.conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM budget_usage WHERE recorded_at >= ?1",
            params![ts(since)],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn executions_since(&self, since: DateTime<Utc>) -> Result<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM executions WHERE created_at >= ?1",
            params![ts(since)],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // ── Webhook deliveries ───────────────────────────────────────────

    pub fn delivery_seen(&self, delivery_id: &str) -> Result<bool> {
        let seen: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM webhook_deliveries WHERE delivery_id = ?1",
                params![delivery_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seen.is_some())
    }

    /// Returns false when the delivery id has been seen before.
    pub fn record_delivery(&self, delivery_id: &str, event: &str) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO webhook_deliveries (delivery_id, event, received_at) VALUES (?1, ?2, ?3)",
            params![delivery_id, event, ts(Utc::now())],
        )?;
        Ok(inserted == 1)
    }

    // ── Nudges ───────────────────────────────────────────────────────

    pub fn create_nudge(
        &self,
        repo: &str,
        issue: u64,
        source_execution_id: Option<&str>,
        priority: i64,
        reason: Option<&str>,
    ) -> Result<Nudge> {
        let nudge = Nudge {
            id: uuid::Uuid::new_v4().to_string(),
            repo: repo.to_string(),
            issue_number: issue,
            source_execution_id: source_execution_id.map(String::from),
            priority,
            reason: reason.map(String::from),
            created_at: Utc::now(),
            processed_at: None,
        };
        self.conn.execute(
            "INSERT INTO nudges (id, repo, issue_number, source_execution_id, priority, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                nudge.id,
                nudge.repo,
                issue as i64,
                nudge.source_execution_id,
                priority,
                nudge.reason,
                ts(nudge.created_at)
            ],
        )?;
        Ok(nudge)
    }

    /// Unprocessed nudges, highest priority first, then oldest.
    pub fn pending_nudges(&self, repo: &str, limit: u32) -> Result<Vec<Nudge>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, repo, issue_number, source_execution_id, priority, reason, created_at, processed_at
             FROM nudges WHERE repo = ?1 AND processed_at IS NULL
             ORDER BY priority DESC, created_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![repo, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;
        let mut nudges = Vec::new();
        for row in rows {
            let (id, repo, issue, source, priority, reason, created_at, processed_at) = row?;
            nudges.push(Nudge {
                id,
                repo,
                issue_number: issue as u64,
                source_execution_id: source,
                priority,
                reason,
                created_at: parse_ts(&created_at)?,
                processed_at: parse_opt_ts(processed_at)?,
            });
        }
        Ok(nudges)
    }

    pub fn mark_nudge_processed(&self, id: &str) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE nudges SET processed_at = ?2 WHERE id = ?1 AND processed_at IS NULL",
            params![id, ts(Utc::now())],
        )?;
        Ok(updated == 1)
    }
}

// ── Row conversion ───────────────────────────────────────────────────

/// Fixed-width UTC timestamps so text comparison orders correctly.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {}", raw))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

/// Intermediate row struct for executions.
struct ExecutionRow {
    id: String,
    issue_number: i64,
    repo: String,
    repo_url: String,
    status: String,
    mode: String,
    prompt: String,
    result: Option<String>,
    pr_number: Option<i64>,
    branch: Option<String>,
    checkpoint: Option<String>,
    external_run_id: Option<String>,
    cost_usd: Option<f64>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            issue_number: row.get(1)?,
            repo: row.get(2)?,
            repo_url: row.get(3)?,
            status: row.get(4)?,
            mode: row.get(5)?,
            prompt: row.get(6)?,
            result: row.get(7)?,
            pr_number: row.get(8)?,
            branch: row.get(9)?,
            checkpoint: row.get(10)?,
            external_run_id: row.get(11)?,
            cost_usd: row.get(12)?,
            created_at: row.get(13)?,
            started_at: row.get(14)?,
            completed_at: row.get(15)?,
        })
    }

    fn into_execution(self) -> Result<Execution> {
        let status = ExecutionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse execution status")?;
        let mode = ExecutionMode::from_str(&self.mode)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse execution mode")?;
        let checkpoint = self
            .checkpoint
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .context("Failed to parse execution checkpoint")?;
        Ok(Execution {
            id: self.id,
            issue_number: self.issue_number as u64,
            repo: self.repo,
            repo_url: self.repo_url,
            status,
            mode,
            prompt: self.prompt,
            result: self.result,
            pr_number: self.pr_number.map(|n| n as u64),
            branch: self.branch,
            checkpoint,
            external_run_id: self.external_run_id,
            cost_usd: self.cost_usd,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

struct IssueStateRow {
    issue_number: i64,
    repo: String,
    classification: Option<String>,
    parent_issue: Option<i64>,
    sub_issues: String,
    retry_count: u32,
    last_checked_at: Option<String>,
    metadata: String,
}

impl IssueStateRow {
    fn into_issue_state(self) -> Result<IssueState> {
        let classification = self
            .classification
            .as_deref()
            .map(Category::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse stored classification")?;
        Ok(IssueState {
            issue_number: self.issue_number as u64,
            repo: self.repo,
            classification,
            parent_issue: self.parent_issue.map(|n| n as u64),
            sub_issues: serde_json::from_str(&self.sub_issues)
                .context("Failed to parse sub_issues JSON")?,
            retry_count: self.retry_count,
            last_checked_at: parse_opt_ts(self.last_checked_at)?,
            metadata: serde_json::from_str(&self.metadata)
                .context("Failed to parse issue metadata JSON")?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn new_exec(id: &str, issue: u64) -> NewExecution {
        NewExecution {
            id: id.to_string(),
            issue_number: issue,
            repo: "acme/widgets".into(),
            repo_url: "https://github.com/acme/widgets.git".into(),
            mode: ExecutionMode::Implement,
            prompt: "do the thing".into(),
            branch: Some(format!("agent/{}", issue)),
            pr_number: None,
        }
    }

    fn terminal(id: &str, status: ExecutionStatus) -> TerminalUpdate {
        TerminalUpdate {
            id: id.to_string(),
            status,
            result: Some("ok".into()),
            pr_number: Some(99),
            branch: None,
            checkpoint: None,
            cost_usd: Some(1.5),
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('executions', 'issue_state', 'cron_state', 'budget_usage', 'webhook_deliveries', 'nudges')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 6);
        // Migrations are re-runnable.
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_second_active_execution_for_issue_is_rejected() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        assert!(db.create_execution(&new_exec("a", 42))?.is_some());
        assert!(db.create_execution(&new_exec("b", 42))?.is_none());
        assert_eq!(db.count_active()?, 1);

        // Other issues are unaffected.
        assert!(db.create_execution(&new_exec("c", 43))?.is_some());
        Ok(())
    }

    #[test]
    fn test_new_execution_allowed_after_terminal() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        db.create_execution(&new_exec("a", 42))?;
        db.complete_execution(&terminal("a", ExecutionStatus::Failed))?;
        assert!(db.create_execution(&new_exec("b", 42))?.is_some());
        Ok(())
    }

    #[test]
    fn test_complete_execution_is_idempotent() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        db.create_execution(&new_exec("a", 42))?;
        assert!(db.mark_running("a", Some("machine-1"))?);

        let first = db.complete_execution(&terminal("a", ExecutionStatus::Completed))?;
        assert_eq!(first, TransitionOutcome::Transitioned);

        let mut late = terminal("a", ExecutionStatus::Failed);
        late.result = Some("timed out".into());
        let second = db.complete_execution(&late)?;
        assert_eq!(second, TransitionOutcome::AlreadyTerminal);

        let exec = db.get_execution("a")?.expect("execution exists");
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.result.as_deref(), Some("ok"));
        assert_eq!(exec.pr_number, Some(99));
        assert_eq!(exec.external_run_id.as_deref(), Some("machine-1"));
        assert!(exec.completed_at.is_some());

        let missing = db.complete_execution(&terminal("zzz", ExecutionStatus::Completed))?;
        assert_eq!(missing, TransitionOutcome::NotFound);
        Ok(())
    }

    #[test]
    fn test_complete_rejects_active_status() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        db.create_execution(&new_exec("a", 1))?;
        assert!(db.complete_execution(&terminal("a", ExecutionStatus::Running)).is_err());
        Ok(())
    }

    #[test]
    fn test_mark_running_only_from_pending() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        db.create_execution(&new_exec("a", 1))?;
        assert!(db.mark_running("a", None)?);
        assert!(!db.mark_running("a", None)?);
        Ok(())
    }

    #[test]
    fn test_latest_checkpoint_prefers_newest() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        db.create_execution(&new_exec("a", 7))?;
        let mut cp = Checkpoint::default();
        cp.insert("context_summary", serde_json::json!("first"));
        let mut update = terminal("a", ExecutionStatus::Completed);
        update.checkpoint = Some(cp);
        db.complete_execution(&update)?;

        db.create_execution(&new_exec("b", 7))?;
        let mut cp2 = Checkpoint::default();
        cp2.insert("context_summary", serde_json::json!("second"));
        db.save_checkpoint("b", &cp2)?;

        let latest = db.latest_checkpoint("acme/widgets", 7)?.expect("checkpoint");
        assert_eq!(latest.get_str("context_summary").as_deref(), Some("second"));
        assert!(db.latest_checkpoint("acme/widgets", 8)?.is_none());
        Ok(())
    }

    #[test]
    fn test_issue_state_upsert_and_retry() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        let mut state = IssueState::new(5, "acme/widgets");
        state.classification = Some(Category::Complex);
        state.sub_issues = vec![6, 7];
        state.last_checked_at = Some(Utc::now());
        db.upsert_issue_state(&state)?;

        assert_eq!(db.increment_retry("acme/widgets", 5)?, 1);
        assert_eq!(db.increment_retry("acme/widgets", 5)?, 2);
        assert_eq!(db.increment_retry("acme/widgets", 99)?, 1);

        let loaded = db.get_issue_state("acme/widgets", 5)?.expect("state");
        assert_eq!(loaded.classification, Some(Category::Complex));
        assert_eq!(loaded.sub_issues, vec![6, 7]);
        assert_eq!(loaded.retry_count, 2);
        Ok(())
    }

    #[test]
    fn test_cron_state_round_trip() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        assert!(db.get_cron("last_pr_check")?.is_none());
        db.set_cron("last_pr_check", &serde_json::json!({"timestamp": "t1"}))?;
        db.set_cron("last_pr_check", &serde_json::json!({"timestamp": "t2"}))?;
        assert_eq!(
            db.get_cron("last_pr_check")?,
            Some(serde_json::json!({"timestamp": "t2"}))
        );
        Ok(())
    }

    #[test]
    fn test_budget_usage_recorded_once() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        let start = Utc::now() - chrono::Duration::seconds(1);
        assert!(db.record_usage("a", 1, 2.5, 60)?);
        assert!(!db.record_usage("a", 1, 2.5, 60)?);
        assert!(db.record_usage("b", 2, 1.0, 30)?);
        assert!((db.cost_since(start)? - 3.5).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn test_webhook_delivery_dedup() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        assert!(!db.delivery_seen("d-1")?);
        assert!(db.record_delivery("d-1", "issues")?);
        assert!(db.delivery_seen("d-1")?);
        assert!(!db.record_delivery("d-1", "issues")?);
        Ok(())
    }

    #[test]
    fn test_list_executions_filters() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        db.create_execution(&new_exec("a", 1))?;
        db.create_execution(&new_exec("b", 2))?;
        db.complete_execution(&terminal("a", ExecutionStatus::Completed))?;

        let completed = db.list_executions(&ExecutionQuery {
            status: Some(ExecutionStatus::Completed),
            ..Default::default()
        })?;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, "a");

        let for_issue = db.list_executions(&ExecutionQuery {
            issue: Some(2),
            ..Default::default()
        })?;
        assert_eq!(for_issue.len(), 1);
        assert_eq!(db.list_executions(&ExecutionQuery::default())?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_nudges_ordered_and_processed_once() -> Result<()> {
        let db = GridDb::new_in_memory()?;
        let low = db.create_nudge("acme/widgets", 10, None, 0, None)?;
        let high = db.create_nudge("acme/widgets", 11, Some("exec-1"), 5, Some("unblocks #10"))?;
        db.create_nudge("acme/other", 12, None, 9, None)?;

        let pending = db.pending_nudges("acme/widgets", 10)?;
        let order: Vec<u64> = pending.iter().map(|n| n.issue_number).collect();
        assert_eq!(order, vec![11, 10]);
        assert_eq!(pending[0].reason.as_deref(), Some("unblocks #10"));

        assert!(db.mark_nudge_processed(&high.id)?);
        assert!(!db.mark_nudge_processed(&high.id)?);
        let pending = db.pending_nudges("acme/widgets", 10)?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, low.id);
        Ok(())
    }
}
