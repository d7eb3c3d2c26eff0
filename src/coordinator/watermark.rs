use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::db::DbHandle;

pub const LAST_PR_CHECK: &str = "last_pr_check";
pub const LAST_CLOSED_PR_CHECK: &str = "last_closed_pr_check";
pub const LAST_BLOCKER_CHECK: &str = "last_blocker_check";
pub const CARRIED_REVIEWS: &str = "carried_reviews";
pub const CARRIED_CLOSED_PRS: &str = "carried_closed_prs";

/// Per-phase "processed up to" timestamps stored in `cron_state`.
///
/// Phases record their own start time, not their finish time, so events that
/// land while a phase is running are seen again next cycle.
#[derive(Clone)]
pub struct Watermarks {
    db: DbHandle,
}

impl Watermarks {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &'static str) -> Result<Option<DateTime<Utc>>> {
        let value = self.db.call(move |db| db.get_cron(key)).await?;
        Ok(value
            .as_ref()
            .and_then(|v| v.get("timestamp"))
            .and_then(|t| t.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    /// The stored watermark, or `lookback` before `now` on a first run.
    pub async fn since_or(
        &self,
        key: &'static str,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<DateTime<Utc>> {
        Ok(self.get(key).await?.unwrap_or(now - lookback))
    }

    pub async fn set(&self, key: &'static str, at: DateTime<Utc>) -> Result<()> {
        let value = json!({ "timestamp": at.to_rfc3339() });
        self.db.call(move |db| db.set_cron(key, &value)).await
    }

    /// Feedback found behind a watermark that has not been acted on yet.
    pub async fn carried<T: DeserializeOwned>(&self, key: &'static str) -> Result<Vec<T>> {
        match self.db.call(move |db| db.get_cron(key)).await? {
            Some(value) => serde_json::from_value(value)
                .with_context(|| format!("Failed to parse carried feedback '{}'", key)),
            None => Ok(Vec::new()),
        }
    }

    pub async fn set_carried<T: Serialize>(&self, key: &'static str, items: &[T]) -> Result<()> {
        let value = serde_json::to_value(items)?;
        self.db.call(move |db| db.set_cron(key, &value)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::db::GridDb;

    #[tokio::test]
    async fn test_watermark_round_trip() -> Result<()> {
        let marks = Watermarks::new(DbHandle::new(GridDb::new_in_memory()?));
        assert!(marks.get(LAST_PR_CHECK).await?.is_none());

        let at = Utc::now();
        marks.set(LAST_PR_CHECK, at).await?;
        let loaded = marks.get(LAST_PR_CHECK).await?.expect("watermark");
        assert_eq!(loaded.timestamp_micros(), at.timestamp_micros());
        assert!(marks.get(LAST_CLOSED_PR_CHECK).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_watermark_falls_back_to_lookback() -> Result<()> {
        let marks = Watermarks::new(DbHandle::new(GridDb::new_in_memory()?));
        let now = Utc::now();
        let since = marks
            .since_or(LAST_CLOSED_PR_CHECK, now, Duration::hours(24))
            .await?;
        assert_eq!(since, now - Duration::hours(24));

        marks.set(LAST_CLOSED_PR_CHECK, now).await?;
        let since = marks
            .since_or(LAST_CLOSED_PR_CHECK, now, Duration::hours(24))
            .await?;
        assert_eq!(since.timestamp_micros(), now.timestamp_micros());
        Ok(())
    }

    #[tokio::test]
    async fn test_carried_feedback_round_trip() -> Result<()> {
        let marks = Watermarks::new(DbHandle::new(GridDb::new_in_memory()?));
        let empty: Vec<u64> = marks.carried(CARRIED_REVIEWS).await?;
        assert!(empty.is_empty());

        marks.set_carried(CARRIED_REVIEWS, &[31u64, 32]).await?;
        let loaded: Vec<u64> = marks.carried(CARRIED_REVIEWS).await?;
        assert_eq!(loaded, vec![31, 32]);

        marks.set_carried::<u64>(CARRIED_REVIEWS, &[]).await?;
        let cleared: Vec<u64> = marks.carried(CARRIED_REVIEWS).await?;
        assert!(cleared.is_empty());
        Ok(())
    }
}
