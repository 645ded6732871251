use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::warn;

use super::kv::KvBackend;
use crate::pipeline::task::ScrapeTask;

const KEY_PREFIX: &str = "task:";

/// Persistent home of every task record. Workers never hold a task across
/// a suspension point; all mutations go through `update`, which re-reads
/// the stored record first.
pub struct TaskStore {
    kv: Arc<dyn KvBackend>,
    ttl_secs: u64,
}

impl TaskStore {
    pub fn new(kv: Arc<dyn KvBackend>, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    fn key(task_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, task_id)
    }

    pub async fn load(&self, task_id: &str) -> Result<Option<ScrapeTask>> {
        let Some(raw) = self.kv.get(&Self::key(task_id)).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                warn!(task_id, "Discarding unreadable task record: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn save(&self, task: &ScrapeTask) -> Result<()> {
        let raw = serde_json::to_string(task).context("Failed to serialize task")?;
        self.kv
            .set(&Self::key(&task.id), &raw, Some(self.ttl_secs))
            .await
    }

    /// Load-mutate-save in one step. The closure sees the current stored
    /// record; `updated_at` is stamped after it runs.
    pub async fn update<F>(&self, task_id: &str, mutate: F) -> Result<Option<ScrapeTask>>
    where
        F: FnOnce(&mut ScrapeTask),
    {
        let Some(mut task) = self.load(task_id).await? else {
            return Ok(None);
        };

        mutate(&mut task);
        task.updated_at = Utc::now();
        self.save(&task).await?;
        Ok(Some(task))
    }

    /// Request cancellation of a non-terminal task. Returns the stored
    /// record, untouched when it is already terminal.
    pub async fn request_cancel(&self, task_id: &str) -> Result<Option<ScrapeTask>> {
        let Some(task) = self.load(task_id).await? else {
            return Ok(None);
        };

        if task.status.is_terminal() {
            return Ok(Some(task));
        }

        self.update(task_id, |task| {
            task.cancel_requested = true;
        })
        .await
    }

    pub async fn delete(&self, task_id: &str) -> Result<()> {
        self.kv.delete(&Self::key(task_id)).await
    }

    /// Ids of every stored task, for the cleanup sweep
    pub async fn all_ids(&self) -> Result<Vec<String>> {
        let keys = self.kv.keys(&format!("{}*", KEY_PREFIX)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(|id| id.to_string()))
            .collect())
    }
}
