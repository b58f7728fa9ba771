//! Local media cache.
//!
//! Files are stored content-keyed (hash of the source URL plus its original
//! extension) so re-polling the same manifest never re-downloads unchanged
//! media. Downloads stream to a `.tmp` sibling and are renamed into place
//! only when complete; a crash can therefore never leave a half-written
//! file masquerading as cached media.

pub mod error;
pub mod index;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SharedConfig};
use crate::playlist::store::PlaylistStore;
use crate::playlist::SharedPlaylist;
use crate::retry::{retry_with_backoff, RetryAction, RetryConfig};
use crate::status::StatusState;

pub use error::CacheError;
pub use index::CacheIndex;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "m4v", "mov", "mkv", "webm", "avi", "mpeg", "mpg"];

fn extension_lower(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// Still images never report a moving `time-pos`, so stall detection must
/// skip them.
pub fn is_image_path(path: &Path) -> bool {
    extension_lower(path).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Whether a cached file looks like something the renderer can display.
/// `.bin` (extension-less URL) is accepted only when the file's origin URL
/// is known, i.e. it came through the manifest rather than a stray write.
pub fn is_supported_media_path(path: &Path, allow_bin: bool) -> bool {
    match extension_lower(path) {
        Some(ext) => {
            IMAGE_EXTENSIONS.contains(&ext.as_str())
                || VIDEO_EXTENSIONS.contains(&ext.as_str())
                || (allow_bin && ext == "bin")
        }
        None => false,
    }
}

/// One cached file as reported by [`CacheStore::list`].
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size: u64,
    pub last_used: DateTime<Utc>,
    pub meta: Option<index::IndexEntry>,
}

pub struct CacheStore {
    dir: PathBuf,
    index: CacheIndex,
}

impl CacheStore {
    pub fn open(config: &Config) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&config.cache_dir)?;
        let index = CacheIndex::load(config.state_dir.join("cache_index.json"));
        index.remove_missing();
        Ok(Self {
            dir: config.cache_dir.clone(),
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    /// Deterministic cache path for a URL: truncated SHA-256 of the URL
    /// plus the URL's own extension (`.bin` when it has none).
    pub fn path_for(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        let mut key = String::with_capacity(40);
        for byte in digest.iter().take(20) {
            key.push_str(&format!("{:02x}", byte));
        }
        let ext = url
            .split(['?', '#'])
            .next()
            .and_then(|p| p.rsplit('/').next())
            .and_then(|name| name.rsplit_once('.').map(|(_, e)| e.to_lowercase()))
            .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "bin".into());
        self.dir.join(format!("{}.{}", key, ext))
    }

    /// Write bytes directly into the cache (atomic temp-then-rename).
    /// The source URL is recorded in the index; exposure metadata is left
    /// for the caller's own `touch`.
    pub fn put(&self, url: &str, bytes: &[u8]) -> Result<PathBuf, CacheError> {
        let dest = self.path_for(url);
        let tmp = tmp_path(&dest);
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &dest)?;
        self.index.touch(&dest, url, 0, ("", ""));
        Ok(dest)
    }

    /// Download `url` into the cache, streaming through a temp file.
    ///
    /// An already-cached file short-circuits. When every retry fails but a
    /// stale cached copy exists, the stale copy is returned so degraded
    /// networks reuse what is on disk.
    pub async fn download(
        &self,
        client: &Client,
        url: &str,
        retry: &RetryConfig,
    ) -> Result<PathBuf, CacheError> {
        let dest = self.path_for(url);
        if dest.exists() {
            return Ok(dest);
        }

        let result = retry_with_backoff(
            retry,
            |e: &CacheError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || self.download_once(client, url, &dest),
        )
        .await;

        match result {
            Ok(()) => {
                // Seed the index with the origin URL; manifest metadata
                // lands with the caller's follow-up touch.
                self.index.touch(&dest, url, 0, ("", ""));
                Ok(dest)
            }
            Err(e) if dest.exists() => {
                tracing::info!("Using cached copy of {} after failed refresh: {}", url, e);
                Ok(dest)
            }
            Err(e) => Err(e),
        }
    }

    async fn download_once(&self, client: &Client, url: &str, dest: &Path) -> Result<(), CacheError> {
        tracing::info!("Downloading {}", url);
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|source| CacheError::Network {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let expected = response.content_length();

        let tmp = tmp_path(dest);
        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            let mut received = 0u64;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|source| CacheError::Network {
                    url: url.to_string(),
                    source,
                })?;
                received += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            if let Some(expected) = expected {
                if received < expected {
                    return Err(CacheError::Incomplete {
                        url: url.to_string(),
                        received,
                        expected,
                    });
                }
            }
            Ok(())
        }
        .await;

        match write_result {
            Ok(()) => {
                tokio::fs::rename(&tmp, dest).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    /// Remove a cached file. Removing an absent file is not an error.
    pub fn remove(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to delete {}: {}", path.display(), e),
        }
    }

    /// All cached files with size and last-access time, `.tmp` excluded.
    /// Last-access falls back to mtime for files the index has never seen.
    pub fn list(&self) -> Vec<CacheEntry> {
        let index = self.index.snapshot();
        self.scan_files()
            .into_iter()
            .filter(|(path, _)| extension_lower(path).map_or(true, |e| e != "tmp"))
            .map(|(path, size)| {
                let meta = index.get(&path).cloned();
                let last_used = entry_last_used(&path, &index);
                CacheEntry {
                    path,
                    size,
                    last_used,
                    meta,
                }
            })
            .collect()
    }

    /// Quota pass: while over `cache_max_bytes` / `cache_max_files`, delete
    /// the least-recently-used file not in `keep`. Files in `keep` (the
    /// active playlist and anything on screen) are never quota-evicted.
    /// Idempotent: once under quota, further calls delete nothing.
    pub fn evict_if_needed(&self, config: &Config, keep: &HashSet<PathBuf>) -> usize {
        if config.cache_max_files == 0 && config.cache_max_bytes == 0 {
            return 0;
        }
        let index = self.index.snapshot();
        let mut total_count = 0u64;
        let mut total_bytes = 0u64;
        let mut candidates: Vec<(PathBuf, u64, DateTime<Utc>)> = Vec::new();
        for (path, size) in self.scan_files() {
            if extension_lower(&path).is_some_and(|e| e == "tmp") {
                continue; // in-flight download, handled by cleanup_temp
            }
            total_count += 1;
            total_bytes += size;
            if keep.contains(&path) {
                continue;
            }
            candidates.push((path.clone(), size, entry_last_used(&path, &index)));
        }
        candidates.sort_by_key(|(_, _, last_used)| *last_used);

        let mut removed = 0;
        let mut candidates = candidates.into_iter();
        while (config.cache_max_files > 0 && total_count > config.cache_max_files)
            || (config.cache_max_bytes > 0 && total_bytes > config.cache_max_bytes)
        {
            let Some((path, size, _)) = candidates.next() else {
                break;
            };
            self.remove(&path);
            removed += 1;
            total_count -= 1;
            total_bytes -= size;
        }
        if removed > 0 {
            self.index.remove_missing();
        }
        removed
    }

    /// Interval pass: delete files absent from `keep` whose last use is
    /// older than the orphan grace period.
    pub fn remove_stale_orphans(&self, config: &Config, keep: &HashSet<PathBuf>) -> usize {
        let grace = chrono::Duration::seconds(config.cache_orphan_grace_sec as i64);
        let cutoff = Utc::now() - grace;
        let index = self.index.snapshot();
        let mut removed = 0;
        for (path, _) in self.scan_files() {
            if keep.contains(&path) {
                continue;
            }
            if extension_lower(&path).is_some_and(|e| e == "tmp") {
                continue; // handled by cleanup_temp on its own clock
            }
            if entry_last_used(&path, &index) < cutoff {
                self.remove(&path);
                removed += 1;
            }
        }
        if removed > 0 {
            self.index.remove_missing();
        }
        removed
    }

    /// Delete stale partial downloads, regardless of playlist membership.
    pub fn cleanup_temp(&self, config: &Config) -> usize {
        if config.tmp_max_age_sec == 0 {
            return 0;
        }
        let max_age = Duration::from_secs(config.tmp_max_age_sec);
        let mut removed = 0;
        for (path, _) in self.scan_files() {
            if extension_lower(&path).map_or(true, |e| e != "tmp") {
                continue;
            }
            let stale = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .map_or(true, |age| age >= max_age);
            if stale {
                self.remove(&path);
                removed += 1;
            }
        }
        removed
    }

    fn scan_files(&self) -> Vec<(PathBuf, u64)> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                meta.is_file().then(|| (entry.path(), meta.len()))
            })
            .collect()
    }
}

fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}

fn entry_last_used(path: &Path, index: &HashMap<PathBuf, index::IndexEntry>) -> DateTime<Utc> {
    if let Some(meta) = index.get(path) {
        return meta.last_used;
    }
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

/// Periodic cache maintenance: temp-file cleanup every pass, quota and
/// orphan eviction only while the API is reachable (when configured to
/// hold off offline, the cached copies may be the only content left).
pub async fn run_cleanup_worker(
    config: SharedConfig,
    playlist: SharedPlaylist,
    store: PlaylistStore,
    status: std::sync::Arc<StatusState>,
    cache: std::sync::Arc<CacheStore>,
    token: CancellationToken,
) {
    loop {
        let cfg = config.snapshot();
        let interval = Duration::from_secs(cfg.cleanup_interval_sec.max(1));

        let mut removed = cache.cleanup_temp(&cfg);

        let offline = {
            let snapshot = status.snapshot();
            snapshot.consecutive_failures > 0 || snapshot.last_poll_success.is_none()
        };
        if !(cfg.disable_cleanup_when_offline && offline) {
            let mut keep: HashSet<PathBuf> = playlist
                .snapshot()
                .0
                .items
                .iter()
                .map(|item| item.path.clone())
                .collect();
            keep.extend(store.saved_playlist_paths());
            let snapshot = status.snapshot();
            if let Some(item) = snapshot.current_item {
                keep.insert(item.path);
            }
            if let Some(item) = snapshot.next_item {
                keep.insert(item.path);
            }
            removed += cache.evict_if_needed(&cfg, &keep);
            removed += cache.remove_stale_orphans(&cfg, &keep);
        }

        status.modify(|s| {
            s.last_cleanup = Some(Utc::now());
            s.last_cleanup_removed = Some(removed);
        });

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = token.cancelled() => return,
        }
    }
}
