use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::cli::config::PipelineSettings;
use crate::storage::TaskStore;

/// One pass over the task store: drop terminal tasks past the retention
/// window and abandoned non-terminal tasks past the stall window.
/// Abandoned tasks are logged, never retried. Every candidate is
/// re-loaded right before deletion so a record a worker just touched
/// survives (last write on `updated_at` wins).
pub async fn sweep_once(
    tasks: &TaskStore,
    now: DateTime<Utc>,
    retention_hours: i64,
    stall_hours: i64,
) -> Result<usize> {
    let retention = Duration::hours(retention_hours);
    let stall = Duration::hours(stall_hours);
    let mut removed = 0usize;

    for task_id in tasks.all_ids().await? {
        // fresh read; the snapshot from all_ids may already be stale
        let Some(task) = tasks.load(&task_id).await? else {
            continue;
        };

        let expired = if task.status.is_terminal() {
            let settled = task.completed_at.unwrap_or(task.updated_at);
            now - settled >= retention
        } else if now - task.updated_at >= stall {
            warn!(
                task_id = task_id.as_str(),
                status = %task.status,
                url = task.url.as_str(),
                "Removing abandoned task"
            );
            true
        } else {
            false
        };

        if !expired {
            continue;
        }

        // re-check against the cutoff on the current record before the
        // delete; a concurrent worker update moves updated_at forward
        let Some(current) = tasks.load(&task_id).await? else {
            continue;
        };
        let still_expired = if current.status.is_terminal() {
            now - current.completed_at.unwrap_or(current.updated_at) >= retention
        } else {
            now - current.updated_at >= stall
        };

        if still_expired {
            tasks.delete(&task_id).await?;
            removed += 1;
            debug!(task_id = task_id.as_str(), "Swept task");
        }
    }

    if removed > 0 {
        info!(removed, "Cleaned up old tasks");
    }
    Ok(removed)
}

/// Run the sweep on its own interval, independent of task processing
pub fn spawn_sweeper(tasks: Arc<TaskStore>, settings: &PipelineSettings) {
    let interval = StdDuration::from_secs(settings.sweep_interval_secs.max(1));
    let retention_hours = settings.retention_hours;
    let stall_hours = settings.stall_hours;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick fires immediately; skip it so startup stays quiet
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_once(&tasks, Utc::now(), retention_hours, stall_hours).await {
                error!("Task sweep failed: {:#}", e);
            }
        }
    });
}
