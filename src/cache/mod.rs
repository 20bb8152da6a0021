//! Persistent local asset cache.
//!
//! A SQLite index (`cache.db`) over content-addressed blobs on the
//! filesystem. The index row is the sole commit point: blobs are staged to a
//! `.tmp` file and renamed before the row is inserted, so a crash can strand
//! only an unreferenced blob (reclaimed by [`CacheStore::verify`] or the
//! open-time sweep), never a dangling index entry.

mod paths;
mod store;

pub use paths::{blob_storage_path, sanitize_filename, thumbnail_storage_path};
pub use store::{CacheConfig, CacheStore};

use thiserror::Error;

use crate::models::CachedAsset;

/// Cache store errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("asset not found")]
    NotFound,
    #[error("cache quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result of a `write` call.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub asset: CachedAsset,
    /// True when the URL was already cached and no bytes were persisted.
    pub deduplicated: bool,
}

/// Aggregated cache statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub total_files: u64,
    pub total_size: u64,
    /// Remaining room under the configured quota.
    pub available_space: u64,
    /// Read hits / (hits + misses) since this store was opened.
    pub hit_rate: f64,
}

/// Result of an integrity pass over the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Index rows purged because their blob was missing.
    pub purged_entries: usize,
    /// Blob files deleted because no row referenced them.
    pub removed_blobs: usize,
    /// Thumbnail files deleted because no row referenced them.
    pub removed_thumbnails: usize,
    /// Leftover `.tmp` staging files deleted.
    pub removed_staging: usize,
}
