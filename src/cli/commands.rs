use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::cli::config::ScraperConfig;
use crate::extract;
use crate::fetch::{FetchPlan, HttpFetcher, PageFetcher};
use crate::pipeline::{apply_overrides, cleanup, RequestOverrides, TaskPipeline};
use crate::recipe::{domain_of, HttpAnalyzer, RecipeGenerator, RecipeStore};
use crate::storage::{self, TaskQueue, TaskStore};
use crate::utils::MetricsCollector;

/// Everything a command needs, wired from the configuration
struct Components {
    tasks: Arc<TaskStore>,
    recipes: Arc<RecipeStore>,
    queue: Arc<dyn TaskQueue>,
    fetcher: Arc<dyn PageFetcher>,
    generator: Arc<RecipeGenerator>,
    metrics: Arc<MetricsCollector>,
}

async fn build_components(config: &ScraperConfig) -> Result<Components> {
    let kv = storage::create_backend(&config.storage).await?;
    let queue = storage::create_queue(&config.storage).await?;

    let tasks = Arc::new(TaskStore::new(kv.clone(), config.storage.task_ttl_secs));
    let recipes = Arc::new(RecipeStore::new(kv));

    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(
        &config.fetch.webdriver_url,
        &config.fetch.user_agent,
    ));

    let analyzer = Arc::new(HttpAnalyzer::new(
        &config.analyzer.url,
        config.analyzer.api_key.clone(),
        config.analyzer.timeout_secs,
    ));
    let generator = Arc::new(RecipeGenerator::new(
        analyzer,
        config.fetch.default_timeout_secs,
        config.pipeline.max_retries,
    ));

    Ok(Components {
        tasks,
        recipes,
        queue,
        fetcher,
        generator,
        metrics: Arc::new(MetricsCollector::new()),
    })
}

/// Run the submission API, the worker pool and the cleanup sweep
pub async fn serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = ScraperConfig::load_default()?;
    let c = build_components(&config).await?;

    let pipeline = Arc::new(TaskPipeline::new(
        c.tasks.clone(),
        c.recipes.clone(),
        c.queue.clone(),
        c.fetcher.clone(),
        c.generator.clone(),
        c.metrics.clone(),
        &config.pipeline,
    ));

    pipeline.spawn_workers();
    cleanup::spawn_sweeper(c.tasks.clone(), &config.pipeline);

    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    let state = Arc::new(AppState {
        pipeline,
        tasks: c.tasks,
        queue: c.queue,
        metrics: c.metrics,
        backend: config.storage.backend.clone(),
    });

    api::serve(&format!("{}:{}", host, port), state).await
}

/// One-shot scrape: resolve or generate the recipe, fetch, extract,
/// print the structured content as JSON
pub async fn scrape(url: String, timeout: Option<u64>, rendered: bool) -> Result<()> {
    let config = ScraperConfig::load_default()?;
    let c = build_components(&config).await?;

    let domain = domain_of(&url).context(format!("URL has no host: {}", url))?;

    let recipe = match c.recipes.load(&domain).await? {
        Some(recipe) => recipe,
        None => {
            info!(domain = domain.as_str(), "No cached recipe, generating one");
            let recipe = c.generator.generate(&url).await?;
            c.recipes.save(&recipe).await?;
            recipe
        }
    };

    let overrides = RequestOverrides {
        headers: Default::default(),
        timeout,
    };
    let mut effective = apply_overrides(&recipe, &overrides);
    if rendered {
        effective.use_headless = true;
    }

    let plan = FetchPlan::from_recipe(&effective);
    let html = c.fetcher.fetch(&url, &plan).await?;
    let extraction = extract::extract(&html, &effective);

    for warning in &extraction.warnings {
        warn!("{}", warning);
    }

    println!("{}", serde_json::to_string_pretty(&extraction.content)?);
    Ok(())
}

/// Print the stored state of a task
pub async fn status(task_id: String) -> Result<()> {
    let config = ScraperConfig::load_default()?;
    let c = build_components(&config).await?;

    let Some(task) = c.tasks.load(&task_id).await? else {
        bail!("Task not found: {}", task_id);
    };

    println!("Task ID: {}", task.id);
    println!("URL: {}", task.url);
    println!("Status: {}", task.status);
    println!("Attempts: {}", task.attempt);
    println!("Created: {}", task.created_at);
    println!("Last Updated: {}", task.updated_at);

    if let Some(completed_at) = task.completed_at {
        println!("Settled: {}", completed_at);
    }
    if task.recipe_regenerated {
        println!("Recipe was regenerated for this task");
    }
    if let Some(error) = &task.error {
        println!("Last Error: {}", error);
    }
    if let Some(result) = &task.result {
        println!("Result:");
        println!("{}", serde_json::to_string_pretty(result)?);
    }

    Ok(())
}

/// Ask the pipeline to cancel a task before its next attempt
pub async fn cancel(task_id: String) -> Result<()> {
    let config = ScraperConfig::load_default()?;
    let c = build_components(&config).await?;

    let Some(task) = c.tasks.request_cancel(&task_id).await? else {
        bail!("Task not found: {}", task_id);
    };

    if task.status.is_terminal() {
        println!("Task {} already {}, nothing to cancel", task.id, task.status);
    } else {
        println!("Cancellation requested for task {}", task.id);
    }

    Ok(())
}

/// Show, list or delete cached recipes
pub async fn recipe(domain: Option<String>, list: bool, delete: bool) -> Result<()> {
    let config = ScraperConfig::load_default()?;
    let c = build_components(&config).await?;

    if list {
        let mut domains = c.recipes.domains().await?;
        domains.sort();
        println!("Cached recipes:");
        for domain in domains {
            println!("  - {}", domain);
        }
        return Ok(());
    }

    let Some(domain) = domain else {
        bail!("Provide a domain, or use --list");
    };

    if delete {
        c.recipes.delete(&domain).await?;
        println!("Deleted recipe for {}", domain);
        return Ok(());
    }

    match c.recipes.load(&domain).await? {
        Some(recipe) => println!("{}", serde_json::to_string_pretty(&recipe)?),
        None => bail!("No cached recipe for {}", domain),
    }

    Ok(())
}
