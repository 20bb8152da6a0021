//! Persistent cached asset metadata.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse asset category derived from the MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AssetCategory {
    Image,
    Document,
    Video,
    Audio,
    Other,
}

impl AssetCategory {
    /// Get the category ID as a string.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Document => "document",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Other => "other",
        }
    }

    /// Parse a category from its string ID.
    pub fn from_id(id: &str) -> Option<Self> {
        match id.to_lowercase().as_str() {
            "image" => Some(Self::Image),
            "document" => Some(Self::Document),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Categorize a MIME type.
    pub fn from_mime(mime: &str) -> Self {
        let mime_lower = mime.to_lowercase();

        if mime_lower.starts_with("image/") {
            Self::Image
        } else if mime_lower.starts_with("video/") {
            Self::Video
        } else if mime_lower.starts_with("audio/") {
            Self::Audio
        } else if mime_lower == "application/pdf"
            || mime_lower.contains("word")
            || mime_lower == "application/msword"
            || mime_lower.contains("spreadsheet")
            || mime_lower.contains("excel")
            || mime_lower.starts_with("text/")
        {
            Self::Document
        } else {
            Self::Other
        }
    }
}

/// Metadata for a new asset handed to the cache store for persistence.
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub original_url: String,
    pub file_name: String,
    pub mime_type: String,
    pub project_id: Option<String>,
    pub metadata: serde_json::Value,
}

/// Persisted local copy of a remote asset plus its metadata.
///
/// At most one record exists per `original_url`. `last_accessed` is bumped
/// on creation and on every read hit, and drives age-based cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAsset {
    pub id: String,
    pub original_url: String,
    pub local_path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub mime_type: String,
    pub project_id: Option<String>,
    pub category: AssetCategory,
    /// SHA-256 of the blob contents, hex encoded.
    pub content_hash: String,
    pub cached_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub thumbnail_path: Option<PathBuf>,
    pub metadata: serde_json::Value,
}
