//! Configuration management for fieldcache.
//!
//! Resolved settings come from, in order of precedence: CLI flags, the
//! `FIELDCACHE_DATA_DIR` environment variable, a config file (explicit path
//! or auto-discovered `fieldcache.toml`), and built-in defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default worker pool size.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Default per-attempt fetch timeout in seconds.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default retry limit per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default cache quota in bytes (2 GB).
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 2_000_000_000;

/// Resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Optional user/session namespace; selects a subdirectory of data_dir.
    pub namespace: Option<String>,
    /// Cache quota estimate in bytes.
    pub max_cache_bytes: u64,
    /// Worker pool size for concurrent downloads.
    pub max_concurrent_downloads: usize,
    /// Per-attempt fetch timeout in seconds.
    pub fetch_timeout_secs: u64,
    /// Base retry delay in milliseconds (doubled per retry).
    pub retry_base_delay_ms: u64,
    /// Default retry limit for submitted tasks.
    pub default_max_retries: u32,
}

impl Settings {
    /// Directory the cache store opens: `data_dir` or `data_dir/<namespace>`.
    pub fn cache_root(&self) -> PathBuf {
        match &self.namespace {
            Some(ns) => self.data_dir.join(ns),
            None => self.data_dir.clone(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            namespace: None,
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            retry_base_delay_ms: 1000,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// On-disk configuration file contents. All fields optional; unset fields
/// fall through to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: Option<PathBuf>,
    pub namespace: Option<String>,
    pub max_cache_bytes: Option<u64>,
    pub max_concurrent_downloads: Option<usize>,
    pub fetch_timeout_secs: Option<u64>,
    pub retry_base_delay_ms: Option<u64>,
    pub default_max_retries: Option<u32>,
    /// Path this config was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load a config file, dispatching on extension (TOML or JSON).
    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

        let mut config: Config = match ext {
            "json" => serde_json::from_str(&contents)
                .map_err(|e| format!("Failed to parse JSON config: {}", e))?,
            _ => toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse TOML config: {}", e))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }
}

/// Options influencing settings resolution, from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
    /// Data directory override (--data-dir flag).
    pub data_dir: Option<PathBuf>,
    /// Namespace override (--namespace flag).
    pub namespace: Option<String>,
}

/// Default data directory: `$FIELDCACHE_DATA_DIR` or the platform data dir.
fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FIELDCACHE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldcache")
}

/// Discover a config file: explicit path, then `fieldcache.toml` in the
/// current directory, then in the data directory.
async fn load_file_config(options: &LoadOptions, data_dir: &Path) -> Config {
    if let Some(config_path) = &options.config_path {
        return Config::load_from_path(config_path).await.unwrap_or_else(|e| {
            tracing::warn!("Failed to load config {}: {}", config_path.display(), e);
            Config::default()
        });
    }

    for candidate in [
        PathBuf::from("fieldcache.toml"),
        data_dir.join("fieldcache.toml"),
    ] {
        if candidate.is_file() {
            match Config::load_from_path(&candidate).await {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to load config {}: {}", candidate.display(), e);
                }
            }
        }
    }

    Config::default()
}

/// Resolve settings from CLI options, environment, and config file.
pub async fn load_settings_with_options(options: LoadOptions) -> (Settings, Config) {
    let defaults = Settings::default();
    let data_dir = options
        .data_dir
        .clone()
        .unwrap_or_else(|| defaults.data_dir.clone());

    let config = load_file_config(&options, &data_dir).await;

    let settings = Settings {
        data_dir: options
            .data_dir
            .or_else(|| config.data_dir.clone())
            .unwrap_or(defaults.data_dir),
        namespace: options.namespace.or_else(|| config.namespace.clone()),
        max_cache_bytes: config.max_cache_bytes.unwrap_or(defaults.max_cache_bytes),
        max_concurrent_downloads: config
            .max_concurrent_downloads
            .unwrap_or(defaults.max_concurrent_downloads),
        fetch_timeout_secs: config
            .fetch_timeout_secs
            .unwrap_or(defaults.fetch_timeout_secs),
        retry_base_delay_ms: config
            .retry_base_delay_ms
            .unwrap_or(defaults.retry_base_delay_ms),
        default_max_retries: config
            .default_max_retries
            .unwrap_or(defaults.default_max_retries),
    };

    (settings, config)
}
