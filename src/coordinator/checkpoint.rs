use anyhow::Result;
use grid_common::Checkpoint;

use super::db::DbHandle;

/// Per-issue context persisted on the execution that produced it.
#[derive(Clone)]
pub struct CheckpointStore {
    db: DbHandle,
}

impl CheckpointStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Returns false when the execution does not exist.
    pub async fn save(&self, execution_id: &str, checkpoint: Checkpoint) -> Result<bool> {
        let id = execution_id.to_string();
        self.db
            .call(move |db| db.save_checkpoint(&id, &checkpoint))
            .await
    }

    /// The most recent checkpoint any execution left for the issue.
    pub async fn latest(&self, repo: &str, issue: u64) -> Result<Option<Checkpoint>> {
        let repo = repo.to_string();
        self.db
            .call(move |db| db.latest_checkpoint(&repo, issue))
            .await
    }
}
