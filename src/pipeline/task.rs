use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::extract::ScrapedContent;

/// Task lifecycle. Transitions only run
/// Queued -> Processing -> {Completed, Failed}; terminal states are
/// never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Request-specific settings applied to a copy of the domain recipe for
/// every attempt of this task; the stored recipe is never mutated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestOverrides {
    pub headers: HashMap<String, String>,
    pub timeout: Option<u64>,
}

/// One scraping request, persisted in the task store for its whole life
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeTask {
    pub id: String,
    pub url: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Scraping attempts made so far; incremented before each attempt
    #[serde(default)]
    pub attempt: u32,

    /// True once recipe regeneration has been tried for this task;
    /// regeneration happens at most once per task lifetime
    #[serde(default)]
    pub recipe_regenerated: bool,

    #[serde(default)]
    pub cancel_requested: bool,

    #[serde(default)]
    pub overrides: RequestOverrides,

    #[serde(default)]
    pub result: Option<ScrapedContent>,

    #[serde(default)]
    pub error: Option<String>,
}

impl ScrapeTask {
    pub fn new(url: &str, overrides: RequestOverrides) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            status: TaskStatus::Queued,
            created_at: now,
            updated_at: now,
            completed_at: None,
            attempt: 0,
            recipe_regenerated: false,
            cancel_requested: false,
            overrides,
            result: None,
            error: None,
        }
    }

    pub fn complete(&mut self, result: ScrapedContent) {
        let now = Utc::now();
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.result = Some(result);
        self.error = None;
    }

    pub fn fail(&mut self, error: &str) {
        let now = Utc::now();
        self.status = TaskStatus::Failed;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.error = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_queued_with_zero_attempts() {
        let task = ScrapeTask::new("https://example.com/a", RequestOverrides::default());
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt, 0);
        assert!(!task.recipe_regenerated);
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn status_serializes_as_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Processing).unwrap(),
            "\"processing\""
        );
        let status: TaskStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(status, TaskStatus::Failed);
    }

    #[test]
    fn task_wire_layout_is_camel_case() {
        let task = ScrapeTask::new("https://example.com/a", RequestOverrides::default());
        let value = serde_json::to_value(&task).unwrap();
        let obj = value.as_object().unwrap();
        for key in ["createdAt", "updatedAt", "recipeRegenerated", "cancelRequested"] {
            assert!(obj.contains_key(key), "missing key {}", key);
        }
    }

    #[test]
    fn fail_is_terminal_and_records_the_error() {
        let mut task = ScrapeTask::new("https://example.com/a", RequestOverrides::default());
        task.fail("connection reset");
        assert!(task.status.is_terminal());
        assert_eq!(task.error.as_deref(), Some("connection reset"));
        assert!(task.completed_at.is_some());
    }
}
