//! Best-effort thumbnail generation for cached images.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use tracing::warn;

use crate::cache::thumbnail_storage_path;

/// Longest edge of a generated thumbnail, in pixels.
const THUMBNAIL_MAX_DIM: u32 = 150;

/// JPEG quality for re-encoded thumbnails.
const THUMBNAIL_QUALITY: u8 = 80;

/// Generates bounded-dimension JPEG derivatives for image assets.
///
/// Non-image MIME types are skipped. Failures are logged and swallowed;
/// thumbnailing must never fail the enclosing cache write.
pub struct ThumbnailGenerator {
    dir: PathBuf,
}

impl ThumbnailGenerator {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generate a thumbnail for an image blob, keyed by content hash.
    ///
    /// Returns the thumbnail path, or `None` for non-image MIME types and
    /// on any decode/encode/IO failure.
    pub fn generate(&self, mime_type: &str, bytes: &[u8], content_hash: &str) -> Option<PathBuf> {
        if !mime_type.to_lowercase().starts_with("image/") {
            return None;
        }

        let path = thumbnail_storage_path(&self.dir, content_hash);
        if path.exists() {
            return Some(path);
        }

        match self.encode(bytes, &path) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Thumbnail generation failed for {}: {}", content_hash, e);
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    fn encode(&self, bytes: &[u8], path: &Path) -> anyhow::Result<()> {
        let img = image::load_from_memory(bytes)?;
        // JPEG has no alpha channel
        let thumb = img.thumbnail(THUMBNAIL_MAX_DIM, THUMBNAIL_MAX_DIM).to_rgb8();

        let file = fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        let encoder = JpegEncoder::new_with_quality(&mut writer, THUMBNAIL_QUALITY);
        thumb.write_with_encoder(encoder)?;
        Ok(())
    }
}
