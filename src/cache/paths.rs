//! On-disk layout helpers for cached blobs.

use std::path::{Path, PathBuf};

/// Construct the storage path for a cached blob.
///
/// Uses a two-level directory structure based on hash prefix for filesystem
/// efficiency: `{blobs_dir}/{hash[0..2]}/{sanitized_stem}-{hash[0..8]}.{extension}`
pub fn blob_storage_path(
    blobs_dir: &Path,
    content_hash: &str,
    file_name: &str,
    extension: &str,
) -> PathBuf {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);
    let filename = format!(
        "{}-{}.{}",
        sanitize_filename(stem),
        &content_hash[..8],
        extension
    );
    blobs_dir.join(&content_hash[..2]).join(filename)
}

/// Construct the storage path for a thumbnail: `{thumbs_dir}/{hash[0..16]}.jpg`
pub fn thumbnail_storage_path(thumbs_dir: &Path, content_hash: &str) -> PathBuf {
    thumbs_dir.join(format!("{}.jpg", &content_hash[..16]))
}

/// Sanitize a filename for safe storage on common filesystems.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    // Trim and limit length
    let trimmed = sanitized.trim().trim_matches('_');
    if trimmed.chars().count() > 100 {
        trimmed.chars().take(100).collect()
    } else if trimmed.is_empty() {
        "asset".to_string()
    } else {
        trimmed.to_string()
    }
}
