//! SQLite-indexed blob store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::paths::blob_storage_path;
use super::{CacheError, CacheStats, VerifyReport, WriteOutcome};
use crate::models::{AssetCategory, CachedAsset, NewAsset};
use crate::thumbs::ThumbnailGenerator;
use crate::utils::mime_to_extension;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS assets (
    id TEXT PRIMARY KEY,
    original_url TEXT NOT NULL UNIQUE,
    local_path TEXT NOT NULL,
    file_name TEXT NOT NULL,
    size INTEGER NOT NULL,
    mime_type TEXT NOT NULL,
    project_id TEXT,
    category TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    thumbnail_path TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_assets_project ON assets(project_id);
CREATE INDEX IF NOT EXISTS idx_assets_category ON assets(category);
CREATE INDEX IF NOT EXISTS idx_assets_last_accessed ON assets(last_accessed);
CREATE INDEX IF NOT EXISTS idx_assets_content_hash ON assets(content_hash);
";

const ASSET_COLUMNS: &str = "id, original_url, local_path, file_name, size, mime_type, \
     project_id, category, content_hash, cached_at, last_accessed, thumbnail_path, metadata";

/// Cache store configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Quota estimate in bytes; writes that would exceed it are rejected.
    pub max_cache_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: crate::config::DEFAULT_MAX_CACHE_BYTES,
        }
    }
}

/// Persistent key-value index (keyed by origin URL) plus blob storage.
///
/// Operations are synchronous (rusqlite + std::fs); async callers go through
/// `spawn_blocking`. Constructed explicitly and passed around by `Arc`.
pub struct CacheStore {
    db_path: PathBuf,
    blobs_dir: PathBuf,
    config: CacheConfig,
    thumbs: ThumbnailGenerator,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    /// Open (or create) a cache store rooted at `root`.
    ///
    /// Creates `blobs/`, `thumbs/`, and `cache.db`, then sweeps leftover
    /// `.tmp` staging files from a previous crash.
    pub fn open(root: &Path, config: CacheConfig) -> Result<Self, CacheError> {
        let blobs_dir = root.join("blobs");
        let thumbs_dir = root.join("thumbs");
        fs::create_dir_all(&blobs_dir)?;
        fs::create_dir_all(&thumbs_dir)?;

        let store = Self {
            db_path: root.join("cache.db"),
            blobs_dir,
            config,
            thumbs: ThumbnailGenerator::new(thumbs_dir),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };

        let conn = store.connect()?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        let swept = store.sweep_staging()?;
        if swept > 0 {
            info!("Swept {} leftover staging file(s)", swept);
        }

        Ok(store)
    }

    /// Persist an asset, deduplicating by origin URL.
    ///
    /// If the URL is already indexed this is a hit: `last_accessed` is
    /// bumped and the existing entry returned without re-persisting bytes.
    /// Otherwise the blob is staged, renamed into place, a thumbnail is
    /// attempted (best-effort), and the index row inserted as the commit
    /// point.
    pub fn write(&self, meta: &NewAsset, bytes: &[u8]) -> Result<WriteOutcome, CacheError> {
        let conn = self.connect()?;

        if let Some(mut asset) = lookup_by_url(&conn, &meta.original_url)? {
            let now = Utc::now();
            touch(&conn, &asset.id, now)?;
            asset.last_accessed = now;
            debug!("Cache write dedup hit for {}", meta.original_url);
            return Ok(WriteOutcome {
                asset,
                deduplicated: true,
            });
        }

        let needed = bytes.len() as u64;
        let total = total_size(&conn)?;
        if total.saturating_add(needed) > self.config.max_cache_bytes {
            return Err(CacheError::QuotaExceeded {
                needed,
                available: self.config.max_cache_bytes.saturating_sub(total),
            });
        }

        let content_hash = hex::encode(Sha256::digest(bytes));
        let extension = mime_to_extension(&meta.mime_type);
        let local_path =
            blob_storage_path(&self.blobs_dir, &content_hash, &meta.file_name, extension);

        if local_path.exists() {
            // Same content under the same name cached for a different URL
            debug!("Reusing existing blob {}", local_path.display());
        } else {
            if let Some(parent) = local_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let staging = staging_path(&local_path);
            fs::write(&staging, bytes)?;
            fs::rename(&staging, &local_path)?;
        }

        let thumbnail_path = self.thumbs.generate(&meta.mime_type, bytes, &content_hash);
        let category = AssetCategory::from_mime(&meta.mime_type);
        let now = Utc::now();

        let asset = CachedAsset {
            id: uuid::Uuid::new_v4().to_string(),
            original_url: meta.original_url.clone(),
            local_path,
            file_name: meta.file_name.clone(),
            size: needed,
            mime_type: meta.mime_type.clone(),
            project_id: meta.project_id.clone(),
            category,
            content_hash,
            cached_at: now,
            last_accessed: now,
            thumbnail_path,
            metadata: meta.metadata.clone(),
        };

        // Two writers can race past the lookup above with the same URL; the
        // UNIQUE constraint arbitrates and the loser converges on the winner's
        // entry instead of surfacing a constraint error.
        loop {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO assets (id, original_url, local_path, file_name, size, \
                 mime_type, project_id, category, content_hash, cached_at, last_accessed, \
                 thumbnail_path, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    asset.id,
                    asset.original_url,
                    path_str(&asset.local_path),
                    asset.file_name,
                    asset.size as i64,
                    asset.mime_type,
                    asset.project_id,
                    asset.category.id(),
                    asset.content_hash,
                    timestamp(asset.cached_at),
                    timestamp(asset.last_accessed),
                    asset.thumbnail_path.as_deref().map(path_str),
                    serde_json::to_string(&asset.metadata)?,
                ],
            )?;
            if inserted == 1 {
                break;
            }

            let Some(mut existing) = lookup_by_url(&conn, &meta.original_url)? else {
                // The winner's row was removed before we could read it; the
                // URL is free again, so insert our own row after all
                continue;
            };

            // Reclaim what we staged for the losing row
            if existing.local_path != asset.local_path {
                remove_unreferenced_file(&conn, "local_path", &asset.local_path)?;
            }
            if let Some(thumb) = &asset.thumbnail_path {
                if existing.thumbnail_path.as_deref() != Some(thumb.as_path()) {
                    remove_unreferenced_file(&conn, "thumbnail_path", thumb)?;
                }
            }

            let now = Utc::now();
            touch(&conn, &existing.id, now)?;
            existing.last_accessed = now;
            debug!("Cache write lost insert race for {}", meta.original_url);
            return Ok(WriteOutcome {
                asset: existing,
                deduplicated: true,
            });
        }

        info!(
            "Cached {} ({} bytes) from {}",
            asset.file_name, asset.size, asset.original_url
        );

        Ok(WriteOutcome {
            asset,
            deduplicated: false,
        })
    }

    /// Look up an asset by origin URL, bumping `last_accessed` on a hit.
    ///
    /// Verifies the blob still exists; a row whose blob has gone missing is
    /// purged and reported as a miss (self-healing against external
    /// tampering).
    pub fn read(&self, url: &str) -> Result<CachedAsset, CacheError> {
        let conn = self.connect()?;

        let Some(mut asset) = lookup_by_url(&conn, url)? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::NotFound);
        };

        if !asset.local_path.exists() {
            warn!(
                "Blob missing for {}, purging index entry",
                asset.original_url
            );
            self.delete_entry(&conn, &asset)?;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::NotFound);
        }

        let now = Utc::now();
        touch(&conn, &asset.id, now)?;
        asset.last_accessed = now;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(asset)
    }

    /// Remove an asset by id, deleting its row, blob, and thumbnail.
    /// Idempotent: returns `Ok(false)` when no such asset exists.
    pub fn remove(&self, id: &str) -> Result<bool, CacheError> {
        let conn = self.connect()?;
        let Some(asset) = lookup_by_id(&conn, id)? else {
            return Ok(false);
        };
        self.delete_entry(&conn, &asset)?;
        Ok(true)
    }

    /// Aggregate statistics over the index.
    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let conn = self.connect()?;
        let (total_files, total_size): (u64, u64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM assets",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                ))
            },
        )?;

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        Ok(CacheStats {
            total_files,
            total_size,
            available_space: self.config.max_cache_bytes.saturating_sub(total_size),
            hit_rate,
        })
    }

    /// Remove every entry whose `last_accessed` is older than `max_age`.
    ///
    /// More recently accessed entries are left untouched regardless of total
    /// size. Returns the number of removed entries.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize, CacheError> {
        let conn = self.connect()?;
        let age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ASSET_COLUMNS} FROM assets WHERE last_accessed < ?1"
            ))?;
            let rows = stmt.query_map(params![timestamp(cutoff)], row_to_asset)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for asset in &stale {
            self.delete_entry(&conn, asset)?;
        }

        if !stale.is_empty() {
            info!("Cleanup removed {} stale cache entr(ies)", stale.len());
        }
        Ok(stale.len())
    }

    /// Integrity pass: purge rows whose blob is gone, delete orphaned blobs
    /// and thumbnails, and sweep leftover staging files.
    pub fn verify(&self) -> Result<VerifyReport, CacheError> {
        let conn = self.connect()?;
        let mut report = VerifyReport::default();

        for asset in self.list_all()? {
            if !asset.local_path.exists() {
                self.delete_entry(&conn, &asset)?;
                report.purged_entries += 1;
            }
        }

        let referenced_blobs: Vec<PathBuf> = {
            let mut stmt = conn.prepare("SELECT local_path FROM assets")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.map(|r| r.map(PathBuf::from))
                .collect::<Result<Vec<_>, _>>()?
        };
        let referenced_thumbs: Vec<PathBuf> = {
            let mut stmt =
                conn.prepare("SELECT thumbnail_path FROM assets WHERE thumbnail_path IS NOT NULL")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.map(|r| r.map(PathBuf::from))
                .collect::<Result<Vec<_>, _>>()?
        };

        report.removed_staging = self.sweep_staging()?;
        report.removed_blobs = remove_orphans(&self.blobs_dir, &referenced_blobs)?;
        report.removed_thumbnails = remove_orphans(self.thumbs.dir(), &referenced_thumbs)?;

        Ok(report)
    }

    /// All cached assets, newest first.
    pub fn list_all(&self) -> Result<Vec<CachedAsset>, CacheError> {
        self.list_where("1=1", &[])
    }

    /// Cached assets for a project, newest first.
    pub fn list_by_project(&self, project_id: &str) -> Result<Vec<CachedAsset>, CacheError> {
        self.list_where("project_id = ?1", &[&project_id])
    }

    /// Cached assets of a category, newest first.
    pub fn list_by_category(
        &self,
        category: AssetCategory,
    ) -> Result<Vec<CachedAsset>, CacheError> {
        self.list_where("category = ?1", &[&category.id()])
    }

    fn list_where(
        &self,
        predicate: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<CachedAsset>, CacheError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets WHERE {predicate} ORDER BY cached_at DESC"
        ))?;
        let rows = stmt.query_map(params, row_to_asset)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete an index row plus its blob and thumbnail when no other row
    /// references them.
    fn delete_entry(&self, conn: &Connection, asset: &CachedAsset) -> Result<(), CacheError> {
        conn.execute("DELETE FROM assets WHERE id = ?1", params![asset.id])?;
        remove_unreferenced_file(conn, "local_path", &asset.local_path)?;
        if let Some(thumb) = &asset.thumbnail_path {
            remove_unreferenced_file(conn, "thumbnail_path", thumb)?;
        }
        Ok(())
    }

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Delete `.tmp` staging files under the blobs directory.
    fn sweep_staging(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for path in walk_files(&self.blobs_dir)? {
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Per-writer staging name next to the final path, so concurrent writers of
/// the same blob never rename each other's staging file out from under them.
fn staging_path(final_path: &Path) -> PathBuf {
    let mut os = final_path.as_os_str().to_owned();
    os.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    PathBuf::from(os)
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn timestamp(t: DateTime<Utc>) -> String {
    // Fixed-width so string comparison in SQL matches time ordering
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Delete a blob or thumbnail file once no index row references it.
fn remove_unreferenced_file(
    conn: &Connection,
    column: &str,
    path: &Path,
) -> Result<(), CacheError> {
    let refs: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM assets WHERE {column} = ?1"),
        params![path_str(path)],
        |row| row.get(0),
    )?;
    if refs == 0 && path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

fn touch(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE assets SET last_accessed = ?1 WHERE id = ?2",
        params![timestamp(now), id],
    )?;
    Ok(())
}

fn total_size(conn: &Connection) -> Result<u64, rusqlite::Error> {
    conn.query_row(
        "SELECT COALESCE(SUM(size), 0) FROM assets",
        [],
        |row| row.get::<_, i64>(0).map(|v| v as u64),
    )
}

fn lookup_by_url(conn: &Connection, url: &str) -> Result<Option<CachedAsset>, CacheError> {
    lookup(conn, "original_url", url)
}

fn lookup_by_id(conn: &Connection, id: &str) -> Result<Option<CachedAsset>, CacheError> {
    lookup(conn, "id", id)
}

fn lookup(conn: &Connection, column: &str, value: &str) -> Result<Option<CachedAsset>, CacheError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ASSET_COLUMNS} FROM assets WHERE {column} = ?1"
    ))?;
    Ok(stmt
        .query_row(params![value], row_to_asset)
        .optional()?)
}

fn row_to_asset(row: &Row<'_>) -> Result<CachedAsset, rusqlite::Error> {
    let category: String = row.get(7)?;
    let metadata: String = row.get(12)?;
    Ok(CachedAsset {
        id: row.get(0)?,
        original_url: row.get(1)?,
        local_path: PathBuf::from(row.get::<_, String>(2)?),
        file_name: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        mime_type: row.get(5)?,
        project_id: row.get(6)?,
        category: AssetCategory::from_id(&category).unwrap_or(AssetCategory::Other),
        content_hash: row.get(8)?,
        cached_at: parse_timestamp(&row.get::<_, String>(9)?),
        last_accessed: parse_timestamp(&row.get::<_, String>(10)?),
        thumbnail_path: row.get::<_, Option<String>>(11)?.map(PathBuf::from),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

/// Recursively collect regular files under a directory.
fn walk_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// Delete files under `dir` that are not in `referenced`.
fn remove_orphans(dir: &Path, referenced: &[PathBuf]) -> Result<usize, CacheError> {
    let mut removed = 0;
    for path in walk_files(dir)? {
        if !referenced.contains(&path) {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::CacheError;

    fn open_store(root: &Path) -> CacheStore {
        CacheStore::open(root, CacheConfig::default()).unwrap()
    }

    fn new_asset(url: &str, name: &str, mime: &str) -> NewAsset {
        NewAsset {
            original_url: url.to_string(),
            file_name: name.to_string(),
            mime_type: mime.to_string(),
            project_id: None,
            metadata: serde_json::json!({}),
        }
    }

    /// A tiny valid JPEG, produced by the image crate itself.
    fn jpeg_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([120, 80, 40]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let outcome = store
            .write(
                &new_asset("https://assets.example/p/door.pdf", "door.pdf", "application/pdf"),
                b"%PDF-1.4 fake",
            )
            .unwrap();
        assert!(!outcome.deduplicated);
        assert!(outcome.asset.local_path.exists());
        assert_eq!(outcome.asset.category, AssetCategory::Document);

        let read = store.read("https://assets.example/p/door.pdf").unwrap();
        assert_eq!(read.id, outcome.asset.id);
        assert_eq!(read.local_path, outcome.asset.local_path);
        assert!(read.last_accessed >= outcome.asset.last_accessed);
    }

    #[test]
    fn write_same_url_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let meta = new_asset("https://assets.example/a.txt", "a.txt", "text/plain");

        let first = store.write(&meta, b"hello").unwrap();
        let second = store.write(&meta, b"different bytes entirely").unwrap();

        assert!(second.deduplicated);
        assert_eq!(second.asset.id, first.asset.id);
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn read_miss_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(matches!(
            store.read("https://assets.example/missing"),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn read_self_heals_when_blob_deleted_externally() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let asset = store
            .write(
                &new_asset("https://assets.example/gone.txt", "gone.txt", "text/plain"),
                b"bytes",
            )
            .unwrap()
            .asset;

        fs::remove_file(&asset.local_path).unwrap();

        assert!(matches!(
            store.read("https://assets.example/gone.txt"),
            Err(CacheError::NotFound)
        ));
        // Entry purged, not just missed
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn quota_exceeded_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), CacheConfig { max_cache_bytes: 10 }).unwrap();

        let err = store
            .write(
                &new_asset("https://assets.example/big.bin", "big.bin", "application/octet-stream"),
                &[0u8; 32],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::QuotaExceeded { needed: 32, available: 10 }
        ));
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn concurrent_writes_for_one_url_converge_on_a_single_entry() {
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(dir.path()));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .write(
                            &new_asset(
                                "https://assets.example/racy.pdf",
                                "racy.pdf",
                                "application/pdf",
                            ),
                            b"identical bytes",
                        )
                        .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        // Every writer converges on the same entry; exactly one actually
        // persisted it
        let entries = store.list_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].local_path.exists());
        assert!(outcomes.iter().all(|o| o.asset.id == entries[0].id));
        assert_eq!(outcomes.iter().filter(|o| !o.deduplicated).count(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let asset = store
            .write(
                &new_asset("https://assets.example/r.txt", "r.txt", "text/plain"),
                b"bytes",
            )
            .unwrap()
            .asset;

        assert!(store.remove(&asset.id).unwrap());
        assert!(!asset.local_path.exists());
        assert!(!store.remove(&asset.id).unwrap());
    }

    #[test]
    fn cleanup_removes_exactly_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let stale = store
            .write(
                &new_asset("https://assets.example/old.txt", "old.txt", "text/plain"),
                b"old",
            )
            .unwrap()
            .asset;
        let fresh = store
            .write(
                &new_asset("https://assets.example/new.txt", "new.txt", "text/plain"),
                b"new",
            )
            .unwrap()
            .asset;

        // Backdate the stale entry's last_accessed
        let conn = store.connect().unwrap();
        let old = Utc::now() - chrono::Duration::days(30);
        conn.execute(
            "UPDATE assets SET last_accessed = ?1 WHERE id = ?2",
            params![timestamp(old), stale.id],
        )
        .unwrap();
        drop(conn);

        let removed = store.cleanup(Duration::from_secs(7 * 24 * 3600)).unwrap();
        assert_eq!(removed, 1);

        let remaining = store.list_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh.id);
        assert!(!stale.local_path.exists());
        assert!(fresh.local_path.exists());
    }

    #[test]
    fn stats_reflect_contents_and_hit_rate() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            CacheStore::open(dir.path(), CacheConfig { max_cache_bytes: 1000 }).unwrap();

        store
            .write(
                &new_asset("https://assets.example/s.txt", "s.txt", "text/plain"),
                b"0123456789",
            )
            .unwrap();

        store.read("https://assets.example/s.txt").unwrap();
        let _ = store.read("https://assets.example/nope");

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.total_size, 10);
        assert_eq!(stats.available_space, 990);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn jpeg_write_generates_thumbnail_pdf_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let image_asset = store
            .write(
                &new_asset("https://assets.example/site.jpg", "site.jpg", "image/jpeg"),
                &jpeg_bytes(),
            )
            .unwrap()
            .asset;
        assert!(image_asset.thumbnail_path.is_some());
        assert!(image_asset.thumbnail_path.as_ref().unwrap().exists());

        let pdf_asset = store
            .write(
                &new_asset("https://assets.example/doc.pdf", "doc.pdf", "application/pdf"),
                b"%PDF-1.4 fake",
            )
            .unwrap()
            .asset;
        assert!(pdf_asset.thumbnail_path.is_none());
    }

    #[test]
    fn corrupt_image_bytes_still_cache_without_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let asset = store
            .write(
                &new_asset("https://assets.example/bad.jpg", "bad.jpg", "image/jpeg"),
                b"not actually a jpeg",
            )
            .unwrap()
            .asset;
        assert!(asset.thumbnail_path.is_none());
        assert!(asset.local_path.exists());
    }

    #[test]
    fn list_filters_by_project_and_category() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut meta = new_asset("https://assets.example/p1.jpg", "p1.jpg", "image/jpeg");
        meta.project_id = Some("proj-1".to_string());
        store.write(&meta, &jpeg_bytes()).unwrap();

        let mut meta = new_asset("https://assets.example/p2.pdf", "p2.pdf", "application/pdf");
        meta.project_id = Some("proj-2".to_string());
        store.write(&meta, b"%PDF").unwrap();

        let proj1 = store.list_by_project("proj-1").unwrap();
        assert_eq!(proj1.len(), 1);
        assert_eq!(proj1[0].file_name, "p1.jpg");

        let docs = store.list_by_category(AssetCategory::Document).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].file_name, "p2.pdf");
    }

    #[test]
    fn verify_purges_and_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let asset = store
            .write(
                &new_asset("https://assets.example/v.txt", "v.txt", "text/plain"),
                b"bytes",
            )
            .unwrap()
            .asset;

        // Simulate a crash: missing blob, a stray staging file, an orphan blob
        fs::remove_file(&asset.local_path).unwrap();
        let stray_dir = dir.path().join("blobs/zz");
        fs::create_dir_all(&stray_dir).unwrap();
        fs::write(stray_dir.join("half-written.bin.tmp"), b"partial").unwrap();
        fs::write(stray_dir.join("orphan-zz00aa11.bin"), b"orphan").unwrap();

        let report = store.verify().unwrap();
        assert_eq!(report.purged_entries, 1);
        assert_eq!(report.removed_staging, 1);
        assert_eq!(report.removed_blobs, 1);
        assert!(store.list_all().unwrap().is_empty());
    }
}
