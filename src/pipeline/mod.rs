pub mod cleanup;
pub mod task;

// Re-export common types
pub use task::{RequestOverrides, ScrapeTask, TaskStatus};

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cli::config::PipelineSettings;
use crate::extract::{self, Extraction, Outcome, ScrapedContent};
use crate::fetch::{FetchError, FetchPlan, PageFetcher};
use crate::recipe::{domain_of, AnalysisError, Recipe, RecipeGenerator, RecipeStore};
use crate::storage::{TaskQueue, TaskStore};
use crate::utils::MetricsCollector;

const CANCELLED_REASON: &str = "cancelled by client";

/// Error surfaced to callers of `submit`
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Failure of a single scraping attempt; every variant is recoverable
/// until the retry budget runs out
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("recipe generation failed: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("extraction degraded: {0}")]
    Degraded(&'static str),

    #[error("cancelled by client")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn degraded_reason(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Partial => "title or content came back empty",
        _ => "no fields matched; recipe looks stale",
    }
}

/// What happened to one pass over a task
#[derive(Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    Failed,
    Retry { delay: Duration },

    /// Task was gone or already terminal; nothing to do
    Skipped,
}

/// The task pipeline: owns the state machine, the retry/backoff policy
/// and the regenerate-and-retry failure path. Collaborators are injected
/// so tests can swap the network edges out.
pub struct TaskPipeline {
    tasks: Arc<TaskStore>,
    recipes: Arc<RecipeStore>,
    queue: Arc<dyn TaskQueue>,
    fetcher: Arc<dyn PageFetcher>,
    generator: Arc<RecipeGenerator>,
    metrics: Arc<MetricsCollector>,
    worker_count: usize,
    max_retries: u32,
    base_delay: Duration,
    poll_interval: Duration,
}

impl TaskPipeline {
    pub fn new(
        tasks: Arc<TaskStore>,
        recipes: Arc<RecipeStore>,
        queue: Arc<dyn TaskQueue>,
        fetcher: Arc<dyn PageFetcher>,
        generator: Arc<RecipeGenerator>,
        metrics: Arc<MetricsCollector>,
        settings: &PipelineSettings,
    ) -> Self {
        Self {
            tasks,
            recipes,
            queue,
            fetcher,
            generator,
            metrics,
            worker_count: settings.worker_count,
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        }
    }

    /// Create a task and queue it for asynchronous processing. Returns
    /// the task id immediately; scrape failures are only ever observable
    /// through the task record.
    pub async fn submit(
        &self,
        url: &str,
        overrides: RequestOverrides,
    ) -> Result<String, SubmitError> {
        let parsed = Url::parse(url).map_err(|_| SubmitError::InvalidUrl(url.to_string()))?;
        if parsed.host_str().is_none() || !matches!(parsed.scheme(), "http" | "https") {
            return Err(SubmitError::InvalidUrl(url.to_string()));
        }

        let task = ScrapeTask::new(url, overrides);
        self.tasks.save(&task).await?;
        self.queue.push(&task.id).await?;
        self.metrics.record_submitted().await;

        info!(task_id = task.id.as_str(), url, "Task submitted");
        Ok(task.id)
    }

    /// Request cancellation; the owning worker honors it before the next
    /// attempt. Terminal tasks are left untouched.
    pub async fn cancel(&self, task_id: &str) -> Result<Option<ScrapeTask>> {
        self.tasks.request_cancel(task_id).await
    }

    /// Start the bounded worker pool
    pub fn spawn_workers(self: &Arc<Self>) {
        for worker in 0..self.worker_count {
            let pipeline = Arc::clone(self);
            tokio::spawn(async move {
                info!(worker, "Scrape worker started");
                loop {
                    match pipeline.queue.pop().await {
                        Ok(Some(task_id)) => {
                            if let Err(e) = pipeline.process_task(&task_id).await {
                                error!(
                                    worker,
                                    task_id = task_id.as_str(),
                                    "Task processing error: {:#}",
                                    e
                                );
                            }
                        }
                        Ok(None) => tokio::time::sleep(pipeline.poll_interval).await,
                        Err(e) => {
                            error!(worker, "Queue error: {:#}", e);
                            tokio::time::sleep(pipeline.poll_interval).await;
                        }
                    }
                }
            });
        }
    }

    /// Run one attempt of a queued task through fetch and extraction,
    /// then settle it: complete, reschedule with backoff, or fail.
    pub async fn process_task(&self, task_id: &str) -> Result<AttemptOutcome> {
        let Some(task) = self.tasks.load(task_id).await? else {
            warn!(task_id, "Popped a task id with no stored record");
            return Ok(AttemptOutcome::Skipped);
        };
        if task.status.is_terminal() {
            debug!(task_id, status = %task.status, "Task already settled");
            return Ok(AttemptOutcome::Skipped);
        }
        if task.cancel_requested {
            self.tasks
                .update(task_id, |t| t.fail(CANCELLED_REASON))
                .await?;
            self.metrics.record_failed().await;
            info!(task_id, "Task cancelled before processing");
            return Ok(AttemptOutcome::Failed);
        }

        let Some(task) = self
            .tasks
            .update(task_id, |t| {
                t.status = TaskStatus::Processing;
                t.attempt += 1;
            })
            .await?
        else {
            return Ok(AttemptOutcome::Skipped);
        };

        let attempt = task.attempt;
        let domain = domain_of(&task.url).unwrap_or_else(|| "unknown".to_string());
        let started = Instant::now();

        match self.run_attempt(&task).await {
            Ok(content) => {
                self.tasks.update(task_id, |t| t.complete(content)).await?;
                self.metrics
                    .record_completed(&domain, started.elapsed().as_millis() as u64)
                    .await;
                info!(task_id, url = task.url.as_str(), attempt, "Task completed");
                Ok(AttemptOutcome::Completed)
            }
            Err(AttemptError::Cancelled) => {
                self.tasks
                    .update(task_id, |t| t.fail(CANCELLED_REASON))
                    .await?;
                self.metrics.record_failed().await;
                info!(task_id, "Task cancelled mid-attempt");
                Ok(AttemptOutcome::Failed)
            }
            Err(error) => {
                let message = error.to_string();
                warn!(
                    task_id,
                    url = task.url.as_str(),
                    attempt,
                    "Attempt failed: {}",
                    message
                );

                if attempt < self.max_retries {
                    self.tasks
                        .update(task_id, |t| t.error = Some(message))
                        .await?;
                    let delay = self.backoff_delay(attempt);
                    self.schedule_retry(task_id, delay);
                    self.metrics.record_retry().await;
                    Ok(AttemptOutcome::Retry { delay })
                } else {
                    self.tasks.update(task_id, |t| t.fail(&message)).await?;
                    self.metrics.record_failed().await;
                    Ok(AttemptOutcome::Failed)
                }
            }
        }
    }

    async fn run_attempt(&self, task: &ScrapeTask) -> Result<ScrapedContent, AttemptError> {
        let domain = domain_of(&task.url)
            .ok_or_else(|| anyhow!("task url lost its host: {}", task.url))?;

        // resolve the domain recipe; a cached one is never regenerated here
        let recipe = match self.recipes.load(&domain).await? {
            Some(recipe) => recipe,
            None => {
                let recipe = self.generator.generate(&task.url).await?;
                self.recipes.save(&recipe).await?;
                self.metrics.record_generation().await;
                info!(domain = domain.as_str(), "Generated and cached new recipe");
                recipe
            }
        };

        let effective = apply_overrides(&recipe, &task.overrides);
        let extraction = self.fetch_and_extract(&task.url, &effective).await?;

        match extraction.outcome {
            Outcome::Complete => Ok(extraction.content),
            outcome if !task.recipe_regenerated => {
                // the gate is persisted before the expensive analysis call
                // so regeneration can never run twice for one task
                self.tasks
                    .update(&task.id, |t| t.recipe_regenerated = true)
                    .await?;
                info!(
                    task_id = task.id.as_str(),
                    domain = domain.as_str(),
                    "Extraction degraded, regenerating recipe"
                );

                match self.generator.generate(&task.url).await {
                    Ok(new_recipe) => {
                        self.recipes.save(&new_recipe).await?;
                        self.metrics.record_regeneration().await;

                        if self.is_cancelled(&task.id).await? {
                            return Err(AttemptError::Cancelled);
                        }

                        let effective = apply_overrides(&new_recipe, &task.overrides);
                        let retry = self.fetch_and_extract(&task.url, &effective).await?;
                        match retry.outcome {
                            Outcome::Complete => Ok(retry.content),
                            retry_outcome => {
                                Err(AttemptError::Degraded(degraded_reason(retry_outcome)))
                            }
                        }
                    }
                    Err(e) => {
                        // a failed regeneration ends the regeneration path
                        // without failing the task; the attempt settles as a
                        // normal degradation and retries with backoff
                        warn!(
                            task_id = task.id.as_str(),
                            domain = domain.as_str(),
                            "Recipe regeneration failed: {}",
                            e
                        );
                        Err(AttemptError::Degraded(degraded_reason(outcome)))
                    }
                }
            }
            outcome => Err(AttemptError::Degraded(degraded_reason(outcome))),
        }
    }

    async fn fetch_and_extract(
        &self,
        url: &str,
        recipe: &Recipe,
    ) -> Result<Extraction, FetchError> {
        let plan = FetchPlan::from_recipe(recipe);
        let html = self.fetcher.fetch(url, &plan).await?;
        let extraction = extract::extract(&html, recipe);
        for warning in &extraction.warnings {
            debug!(url, warning = warning.as_str(), "Extraction warning");
        }
        Ok(extraction)
    }

    async fn is_cancelled(&self, task_id: &str) -> Result<bool> {
        Ok(self
            .tasks
            .load(task_id)
            .await?
            .map(|t| t.cancel_requested)
            .unwrap_or(false))
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }

    /// Re-enqueue the task after the backoff delay. The sleep runs on the
    /// timer, off the worker pool, so a pending retry never occupies a
    /// worker slot.
    fn schedule_retry(&self, task_id: &str, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        let task_id = task_id.to_string();
        debug!(
            task_id = task_id.as_str(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.push(&task_id).await {
                error!(task_id = task_id.as_str(), "Failed to re-enqueue task: {:#}", e);
            }
        });
    }
}

/// Apply request-specific settings to a copy of the stored recipe.
/// Request headers win over recipe headers; the override timeout is
/// clamped like any other recipe timeout.
pub fn apply_overrides(recipe: &Recipe, overrides: &RequestOverrides) -> Recipe {
    let mut copy = recipe.clone();
    if let Some(timeout) = overrides.timeout {
        copy.timeout = timeout;
        copy.clamp_tunables();
    }
    for (name, value) in &overrides.headers {
        copy.headers.insert(name.clone(), value.clone());
    }
    copy
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::storage::TaskQueue;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn submit_rejects_invalid_urls() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::always(good_analysis()));
        for bad in ["not a url", "ftp://files.example.com/x", "http://"] {
            let err = h
                .pipeline
                .submit(bad, RequestOverrides::default())
                .await
                .unwrap_err();
            assert!(matches!(err, SubmitError::InvalidUrl(_)), "{}", bad);
        }
    }

    #[tokio::test]
    async fn submit_is_non_blocking_and_queues_the_task() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::always(good_analysis()));
        let id = h
            .pipeline
            .submit("https://example.com/article", RequestOverrides::default())
            .await
            .unwrap();

        let stored = h.tasks.load(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(h.queue.pop().await.unwrap().as_deref(), Some(id.as_str()));
        // fetch has not run yet
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_domain_generates_recipe_once_and_completes() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::always(good_analysis()));
        let id = h
            .pipeline
            .submit("https://example.com/article", RequestOverrides::default())
            .await
            .unwrap();
        h.queue.pop().await.unwrap();

        let outcome = h.pipeline.process_task(&id).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Completed);

        let task = h.tasks.load(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt, 1);
        let result = task.result.unwrap();
        assert_eq!(result.title.as_deref(), Some("A working headline"));
        assert_eq!(result.media_files.images, vec!["/img/1.png", "/img/2.png"]);

        assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 1);
        assert!(h.recipes.load("example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_recipe_is_regenerated_once_then_completes() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::always(good_analysis()));
        h.recipes.save(&stale_recipe("example.com")).await.unwrap();

        let id = h
            .pipeline
            .submit("https://example.com/changed", RequestOverrides::default())
            .await
            .unwrap();
        let outcome = h.pipeline.process_task(&id).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Completed);

        let task = h.tasks.load(&id).await.unwrap().unwrap();
        assert!(task.recipe_regenerated);
        assert_eq!(task.result.unwrap().title.as_deref(), Some("A working headline"));

        // exactly one analysis: the regeneration
        assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 1);
        let recipe = h.recipes.load("example.com").await.unwrap().unwrap();
        assert_eq!(
            recipe.extraction_rules["title"].selector,
            "h1.headline"
        );
    }

    #[tokio::test]
    async fn regeneration_happens_once_across_all_retries() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::always(stale_analysis()));
        h.recipes.save(&stale_recipe("example.com")).await.unwrap();

        let id = h
            .pipeline
            .submit("https://example.com/changed", RequestOverrides::default())
            .await
            .unwrap();

        let first = h.pipeline.process_task(&id).await.unwrap();
        assert!(matches!(first, AttemptOutcome::Retry { .. }));
        let second = h.pipeline.process_task(&id).await.unwrap();
        assert!(matches!(second, AttemptOutcome::Retry { .. }));
        let third = h.pipeline.process_task(&id).await.unwrap();
        assert_eq!(third, AttemptOutcome::Failed);

        let task = h.tasks.load(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt, 3);
        assert!(task.recipe_regenerated);
        assert!(task.error.is_some());
        // the regeneration gate held across every backoff retry
        assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_exhaust_the_retry_budget_with_exponential_backoff() {
        let h = harness(
            ScriptedFetcher::sequence(vec![
                Err(FetchError::Timeout(30)),
                Err(FetchError::Timeout(30)),
                Err(FetchError::Timeout(30)),
            ]),
            ScriptedAnalyzer::always(good_analysis()),
        );
        h.recipes.save(&stale_recipe("example.com")).await.unwrap();

        let id = h
            .pipeline
            .submit("https://example.com/slow", RequestOverrides::default())
            .await
            .unwrap();

        let base = Duration::from_millis(test_settings().base_delay_ms);
        match h.pipeline.process_task(&id).await.unwrap() {
            AttemptOutcome::Retry { delay } => assert_eq!(delay, base * 2),
            other => panic!("expected retry, got {:?}", other),
        }
        match h.pipeline.process_task(&id).await.unwrap() {
            AttemptOutcome::Retry { delay } => assert_eq!(delay, base * 4),
            other => panic!("expected retry, got {:?}", other),
        }
        assert_eq!(
            h.pipeline.process_task(&id).await.unwrap(),
            AttemptOutcome::Failed
        );

        let task = h.tasks.load(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt, 3);
        assert!(task.error.unwrap().contains("timed out"));
        // a timeout never triggers regeneration
        assert!(!task.recipe_regenerated);
    }

    #[tokio::test]
    async fn concurrent_submissions_for_a_new_domain_both_complete() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::always(good_analysis()));

        let a = h
            .pipeline
            .submit("https://example.com/a", RequestOverrides::default())
            .await
            .unwrap();
        let b = h
            .pipeline
            .submit("https://example.com/b", RequestOverrides::default())
            .await
            .unwrap();

        let (ra, rb) = tokio::join!(h.pipeline.process_task(&a), h.pipeline.process_task(&b));
        assert_eq!(ra.unwrap(), AttemptOutcome::Completed);
        assert_eq!(rb.unwrap(), AttemptOutcome::Completed);

        // the race permits one or two generations, never zero
        let calls = h.analyzer.calls.load(Ordering::SeqCst);
        assert!((1..=2).contains(&calls), "calls = {}", calls);

        // whichever save won, the stored recipe is well-formed
        let recipe = h.recipes.load("example.com").await.unwrap().unwrap();
        assert!(recipe.validate().is_ok());
    }

    #[tokio::test]
    async fn regeneration_failure_does_not_fail_the_task_directly() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::failing());
        h.recipes.save(&stale_recipe("example.com")).await.unwrap();

        let id = h
            .pipeline
            .submit("https://example.com/x", RequestOverrides::default())
            .await
            .unwrap();
        let outcome = h.pipeline.process_task(&id).await.unwrap();

        // the attempt degrades and goes to backoff, not straight to Failed
        assert!(matches!(outcome, AttemptOutcome::Retry { .. }));

        let task = h.tasks.load(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.recipe_regenerated);
        assert!(task.error.unwrap().contains("degraded"));

        // the stale recipe was not replaced by a partial write
        let recipe = h.recipes.load("example.com").await.unwrap().unwrap();
        assert_eq!(recipe.extraction_rules["title"].selector, ".legacy-title");
    }

    #[tokio::test]
    async fn initial_generation_failure_counts_toward_the_retry_budget() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::failing());

        let id = h
            .pipeline
            .submit("https://fresh.example.com/x", RequestOverrides::default())
            .await
            .unwrap();
        let outcome = h.pipeline.process_task(&id).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Retry { .. }));

        let task = h.tasks.load(&id).await.unwrap().unwrap();
        assert_eq!(task.attempt, 1);
        assert!(task.error.unwrap().contains("recipe generation failed"));
        assert!(h.recipes.load("fresh.example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_task_fails_with_the_cancellation_reason() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::always(good_analysis()));
        let id = h
            .pipeline
            .submit("https://example.com/x", RequestOverrides::default())
            .await
            .unwrap();

        h.pipeline.cancel(&id).await.unwrap();
        let outcome = h.pipeline.process_task(&id).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Failed);

        let task = h.tasks.load(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("cancelled"));
        // no fetch ever ran
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn terminal_tasks_are_never_resurrected() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::always(good_analysis()));
        let id = h
            .pipeline
            .submit("https://example.com/x", RequestOverrides::default())
            .await
            .unwrap();
        assert_eq!(
            h.pipeline.process_task(&id).await.unwrap(),
            AttemptOutcome::Completed
        );

        // a stale queue entry for a settled task is a no-op
        assert_eq!(
            h.pipeline.process_task(&id).await.unwrap(),
            AttemptOutcome::Skipped
        );
        let task = h.tasks.load(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt, 1);
    }

    #[tokio::test]
    async fn overrides_apply_to_a_copy_and_never_mutate_the_stored_recipe() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::always(good_analysis()));
        let mut recipe = stale_recipe("example.com");
        recipe.extraction_rules.insert(
            "title".to_string(),
            crate::recipe::ExtractionRule::css("h1.headline"),
        );
        recipe.extraction_rules.insert(
            "content".to_string(),
            crate::recipe::ExtractionRule::css("article.body"),
        );
        h.recipes.save(&recipe).await.unwrap();

        let overrides = RequestOverrides {
            headers: [("x-req".to_string(), "1".to_string())].into(),
            timeout: Some(9999),
        };
        let effective = apply_overrides(&recipe, &overrides);
        assert_eq!(effective.timeout, 300);
        assert_eq!(effective.headers.get("x-req").map(String::as_str), Some("1"));

        let id = h
            .pipeline
            .submit("https://example.com/x", overrides)
            .await
            .unwrap();
        h.pipeline.process_task(&id).await.unwrap();

        let stored = h.recipes.load("example.com").await.unwrap().unwrap();
        assert!(stored.headers.is_empty());
        assert_eq!(stored.timeout, 30);
    }

    #[tokio::test]
    async fn workers_drain_the_queue_end_to_end() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::always(good_analysis()));
        h.pipeline.spawn_workers();

        let id = h
            .pipeline
            .submit("https://example.com/worker", RequestOverrides::default())
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let task = h.tasks.load(&id).await.unwrap().unwrap();
            if task.status == TaskStatus::Completed {
                assert!(task.result.unwrap().title.is_some());
                break;
            }
            assert!(Instant::now() < deadline, "task never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn backoff_delays_double_per_attempt() {
        let h = harness(ScriptedFetcher::always(PAGE), ScriptedAnalyzer::always(good_analysis()));
        let base = Duration::from_millis(test_settings().base_delay_ms);
        assert_eq!(h.pipeline.backoff_delay(1), base * 2);
        assert_eq!(h.pipeline.backoff_delay(2), base * 4);
        assert_eq!(h.pipeline.backoff_delay(3), base * 8);
    }
}
