use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::db::DbHandle;
use crate::config::BudgetSection;

/// Whether a new execution may start right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl BudgetDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub active_executions: u32,
    pub max_concurrent: u32,
    pub cost_today_usd: f64,
    pub max_daily_cost_usd: f64,
    pub executions_today: u32,
    pub max_retries_per_issue: u32,
}

#[derive(Clone)]
pub struct BudgetManager {
    db: DbHandle,
    limits: BudgetSection,
}

fn start_of_today() -> DateTime<Utc> {
    let now = Utc::now();
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now)
}

impl BudgetManager {
    pub fn new(db: DbHandle, limits: BudgetSection) -> Self {
        Self { db, limits }
    }

    /// Concurrency and daily-cost check. Store errors deny.
    pub async fn may_launch(&self) -> BudgetDecision {
        let since = start_of_today();
        let snapshot = self
            .db
            .call(move |db| Ok((db.count_active()?, db.cost_since(since)?)))
            .await;
        let (active, cost_today) = match snapshot {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "budget check failed, denying launch");
                return BudgetDecision::deny(format!("budget check failed: {}", e));
            }
        };

        if active >= self.limits.max_concurrent {
            return BudgetDecision::deny(format!(
                "{} active executions (limit {})",
                active, self.limits.max_concurrent
            ));
        }
        if cost_today >= self.limits.max_daily_cost_usd {
            return BudgetDecision::deny(format!(
                "daily cost ${:.2} reached limit ${:.2}",
                cost_today, self.limits.max_daily_cost_usd
            ));
        }
        BudgetDecision::allow()
    }

    /// Whether an issue that has already been retried `retry_count` times may
    /// be retried again.
    pub fn retry_allowed(&self, retry_count: u32) -> bool {
        retry_count < self.limits.max_retries_per_issue
    }

    pub fn max_retries(&self) -> u32 {
        self.limits.max_retries_per_issue
    }

    /// Charge a finished execution once; replays are ignored.
    pub async fn record_usage(
        &self,
        execution_id: &str,
        issue: u64,
        cost_usd: Option<f64>,
        duration_secs: i64,
    ) -> Result<bool> {
        let id = execution_id.to_string();
        let cost = cost_usd.unwrap_or(self.limits.default_execution_cost_usd);
        self.db
            .call(move |db| db.record_usage(&id, issue, cost, duration_secs))
            .await
    }

    pub async fn status(&self) -> Result<BudgetStatus> {
        let since = start_of_today();
        let (active, cost, count) = self
            .db
            .call(move |db| {
                Ok((
                    db.count_active()?,
                    db.cost_since(since)?,
                    db.executions_since(since)?,
                ))
            })
            .await?;
        Ok(BudgetStatus {
            active_executions: active,
            max_concurrent: self.limits.max_concurrent,
            cost_today_usd: cost,
            max_daily_cost_usd: self.limits.max_daily_cost_usd,
            executions_today: count,
            max_retries_per_issue: self.limits.max_retries_per_issue,
        })
    }
}
