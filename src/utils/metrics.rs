use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Pipeline counters exposed on the metrics endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineMetrics {
    /// Start time of the metrics collection
    pub started_at: DateTime<Utc>,

    /// Tasks accepted through submit
    pub tasks_submitted: u64,

    /// Tasks that reached Completed
    pub tasks_completed: u64,

    /// Tasks that reached Failed
    pub tasks_failed: u64,

    /// Backoff retries scheduled
    pub retries_scheduled: u64,

    /// First-time recipe generations
    pub recipes_generated: u64,

    /// Recipe regenerations triggered by degraded extractions
    pub recipes_regenerated: u64,

    /// Successful attempt durations per domain, in milliseconds
    pub attempt_durations_ms: HashMap<String, Vec<u64>>,
}

/// Shared collector the pipeline reports into
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<PipelineMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let metrics = PipelineMetrics {
            started_at: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    pub async fn record_submitted(&self) {
        self.metrics.lock().await.tasks_submitted += 1;
    }

    pub async fn record_completed(&self, domain: &str, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;
        metrics.tasks_completed += 1;
        metrics
            .attempt_durations_ms
            .entry(domain.to_string())
            .or_default()
            .push(duration_ms);
    }

    pub async fn record_failed(&self) {
        self.metrics.lock().await.tasks_failed += 1;
    }

    pub async fn record_retry(&self) {
        self.metrics.lock().await.retries_scheduled += 1;
    }

    pub async fn record_generation(&self) {
        self.metrics.lock().await.recipes_generated += 1;
    }

    pub async fn record_regeneration(&self) {
        self.metrics.lock().await.recipes_regenerated += 1;
    }

    /// Snapshot of the current counters
    pub async fn snapshot(&self) -> PipelineMetrics {
        self.metrics.lock().await.clone()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
