//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific
//! modules.

mod fetch;
mod maintain;
mod show;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::cache::{CacheConfig, CacheStore};
use crate::config::{load_settings_with_options, LoadOptions, Settings};
use crate::models::{AssetCategory, Priority};

#[derive(Parser)]
#[command(name = "fieldcache")]
#[command(about = "Local asset cache and concurrent download manager")]
#[command(version)]
pub struct Cli {
    /// Data directory (overrides config file)
    #[arg(long, global = true, env = "FIELDCACHE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// User/session namespace; selects a subdirectory of the data directory
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the cache directory and index
    Init,

    /// Fetch one or more URLs into the cache
    Fetch {
        /// Asset URLs to fetch
        urls: Vec<String>,
        /// Number of download workers (default from config)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Scheduling priority
        #[arg(short, long, value_enum, default_value = "medium")]
        priority: Priority,
        /// Project to associate the assets with
        #[arg(long)]
        project: Option<String>,
        /// Retry limit per task
        #[arg(long)]
        retries: Option<u32>,
        /// Per-attempt fetch timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List cached assets
    Ls {
        /// Only assets for this project
        #[arg(long)]
        project: Option<String>,
        /// Only assets of this category
        #[arg(long, value_enum)]
        category: Option<AssetCategory>,
    },

    /// Show cache statistics
    Stats,

    /// Remove entries not accessed within the age window
    Cleanup {
        /// Age threshold in days
        #[arg(long, default_value = "30")]
        max_age_days: u64,
    },

    /// Remove a cached asset by id
    Rm {
        /// Asset id (as shown by `ls`)
        id: String,
    },

    /// Check index/blob consistency and sweep orphans
    Verify,
}

/// Open the cache store at the configured root.
fn open_store(settings: &Settings) -> anyhow::Result<Arc<CacheStore>> {
    let root = settings.cache_root();
    let store = CacheStore::open(
        &root,
        CacheConfig {
            max_cache_bytes: settings.max_cache_bytes,
        },
    )?;
    Ok(Arc::new(store))
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (settings, _config) = load_settings_with_options(LoadOptions {
        config_path: cli.config.clone(),
        data_dir: cli.data_dir.clone(),
        namespace: cli.namespace.clone(),
    })
    .await;

    match cli.command {
        Commands::Init => maintain::init(&settings),
        Commands::Fetch {
            urls,
            workers,
            priority,
            project,
            retries,
            timeout,
        } => {
            fetch::execute(
                &settings,
                fetch::FetchArgs {
                    urls,
                    workers,
                    priority,
                    project,
                    retries,
                    timeout,
                },
            )
            .await
        }
        Commands::Ls { project, category } => show::ls(&settings, project, category),
        Commands::Stats => show::stats(&settings),
        Commands::Cleanup { max_age_days } => maintain::cleanup(&settings, max_age_days),
        Commands::Rm { id } => maintain::rm(&settings, &id),
        Commands::Verify => maintain::verify(&settings),
    }
}
