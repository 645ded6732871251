use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScraperConfig {
    pub server: ServerSettings,
    pub pipeline: PipelineSettings,
    pub fetch: FetchSettings,
    pub analyzer: AnalyzerSettings,
    pub storage: StorageSettings,
}

/// Submission API settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Task pipeline settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineSettings {
    /// Concurrent scrape workers
    pub worker_count: usize,

    /// Attempts per task before it fails for good
    pub max_retries: u32,

    /// Base of the exponential backoff, in milliseconds
    pub base_delay_ms: u64,

    /// How long an idle worker sleeps before polling the queue again
    pub poll_interval_ms: u64,

    /// Terminal tasks older than this are swept
    pub retention_hours: i64,

    /// Non-terminal tasks untouched for this long count as abandoned
    pub stall_hours: i64,

    pub sweep_interval_secs: u64,
}

/// Page fetch settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FetchSettings {
    /// Timeout applied to generated recipes, in seconds
    pub default_timeout_secs: u64,

    /// User agent sent when a recipe does not override it
    pub user_agent: String,

    /// WebDriver endpoint for rendered fetches
    pub webdriver_url: String,
}

/// Page analysis service settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalyzerSettings {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

/// Storage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageSettings {
    /// "redis" or "memory"
    pub backend: String,
    pub redis_url: String,

    /// Time to live for task records in seconds
    pub task_ttl_secs: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            pipeline: PipelineSettings {
                worker_count: 4,
                max_retries: 3,
                base_delay_ms: 60_000,
                poll_interval_ms: 500,
                retention_hours: 24,
                stall_hours: 6,
                sweep_interval_secs: 3600,
            },
            fetch: FetchSettings {
                default_timeout_secs: 30,
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".to_string(),
                webdriver_url: "http://localhost:4444".to_string(),
            },
            analyzer: AnalyzerSettings {
                url: "http://localhost:9400/analyze".to_string(),
                api_key: None,
                timeout_secs: 120,
            },
            storage: StorageSettings {
                backend: "redis".to_string(),
                redis_url: "redis://localhost:6379".to_string(),
                task_ttl_secs: 86_400,
            },
        }
    }
}

impl ScraperConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        if let Some(proj_dirs) =
            directories::ProjectDirs::from("com", "adaptive-scraper", "adaptive-scraper")
        {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    /// Load the default configuration, creating it on first run
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            if let Err(e) = config.save_as_default() {
                error!("Failed to save default configuration: {}", e);
            }
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        self.save_to_file(&config_path)
    }

    /// Save the configuration to a file
    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}
