//! fieldcache - local asset cache and concurrent download manager.
//!
//! Keeps local copies of remote project photos and documents for fast and
//! offline access. A bounded worker pool fetches assets over plain HTTP(S)
//! with priority ordering and retry/backoff; a SQLite-indexed blob store
//! owns deduplication, thumbnailing, and age-based cleanup.

pub mod cache;
pub mod cli;
pub mod config;
pub mod fetch;
pub mod models;
pub mod scheduler;
pub mod thumbs;
pub mod utils;
