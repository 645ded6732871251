pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the submission API with the scrape worker pool
    Serve {
        /// Bind address, overrides the configuration
        #[arg(long)]
        host: Option<String>,

        /// Bind port, overrides the configuration
        #[arg(long)]
        port: Option<u16>,
    },

    /// Scrape a single URL synchronously and print the result
    Scrape {
        /// URL to scrape
        #[arg(required = true)]
        url: String,

        /// Fetch timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Force a rendered fetch regardless of the recipe
        #[arg(long)]
        rendered: bool,
    },

    /// Check the status of a submitted task
    Status {
        /// Task ID to check
        #[arg(required = true)]
        task_id: String,
    },

    /// Request cancellation of a task
    Cancel {
        /// Task ID to cancel
        #[arg(required = true)]
        task_id: String,
    },

    /// Inspect cached domain recipes
    Recipe {
        /// Domain whose recipe to show or delete
        domain: Option<String>,

        /// List all domains with a cached recipe
        #[arg(short, long)]
        list: bool,

        /// Delete the recipe for the given domain
        #[arg(long)]
        delete: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve { host, port } => {
            info!("Starting API server and worker pool");
            commands::serve(host, port).await
        }
        Commands::Scrape {
            url,
            timeout,
            rendered,
        } => {
            info!("Scraping {} synchronously", url);
            commands::scrape(url, timeout, rendered).await
        }
        Commands::Status { task_id } => {
            info!("Checking status for task {}", task_id);
            commands::status(task_id).await
        }
        Commands::Cancel { task_id } => {
            info!("Requesting cancellation of task {}", task_id);
            commands::cancel(task_id).await
        }
        Commands::Recipe {
            domain,
            list,
            delete,
        } => commands::recipe(domain, list, delete).await,
    }
}
