//! Persistent cache index: per-file metadata (source URL, exposure time,
//! last-used instant) keyed by cached path.
//!
//! The index is what makes LRU eviction and offline playlist
//! reconstruction possible after a restart. Saves are throttled so a busy
//! playback loop touching items every few seconds does not hammer the
//! disk; anything that removes files forces a save.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fsutil;

const SAVE_THROTTLE: Duration = Duration::from_secs(5);

/// Metadata recorded for one cached file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub url: String,
    pub exposure_ms: i64,
    #[serde(default)]
    pub campaign_id: String,
    #[serde(default)]
    pub campaign_name: String,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexDocument {
    version: u32,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    items: HashMap<PathBuf, IndexEntry>,
}

struct IndexInner {
    items: HashMap<PathBuf, IndexEntry>,
    last_save: Option<Instant>,
}

pub struct CacheIndex {
    path: PathBuf,
    inner: Mutex<IndexInner>,
}

impl CacheIndex {
    pub fn load(path: PathBuf) -> Self {
        let items = fsutil::read_json::<IndexDocument>(&path)
            .map(|doc| doc.items)
            .unwrap_or_default();
        Self {
            path,
            inner: Mutex::new(IndexInner {
                items,
                last_save: None,
            }),
        }
    }

    /// Record or refresh an entry, stamping the last-used instant.
    pub fn touch(&self, path: &Path, url: &str, exposure_ms: i64, campaign: (&str, &str)) {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let mut inner = self.inner.lock().expect("cache index lock poisoned");
        inner.items.insert(
            path.to_path_buf(),
            IndexEntry {
                url: url.to_string(),
                exposure_ms,
                campaign_id: campaign.0.to_string(),
                campaign_name: campaign.1.to_string(),
                last_used: Utc::now(),
                size,
            },
        );
        self.save_locked(&mut inner, false);
    }

    /// Drop entries whose files no longer exist on disk.
    pub fn remove_missing(&self) {
        let mut inner = self.inner.lock().expect("cache index lock poisoned");
        let before = inner.items.len();
        inner.items.retain(|path, _| path.exists());
        if inner.items.len() != before {
            self.save_locked(&mut inner, true);
        }
    }

    pub fn snapshot(&self) -> HashMap<PathBuf, IndexEntry> {
        self.inner
            .lock()
            .expect("cache index lock poisoned")
            .items
            .clone()
    }

    pub fn get(&self, path: &Path) -> Option<IndexEntry> {
        self.inner
            .lock()
            .expect("cache index lock poisoned")
            .items
            .get(path)
            .cloned()
    }

    /// Flush unconditionally; called from the shutdown sequence.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().expect("cache index lock poisoned");
        self.save_locked(&mut inner, true);
    }

    fn save_locked(&self, inner: &mut IndexInner, force: bool) {
        if !force {
            if let Some(last) = inner.last_save {
                if last.elapsed() < SAVE_THROTTLE {
                    return;
                }
            }
        }
        let doc = IndexDocument {
            version: 1,
            updated_at: Some(Utc::now()),
            items: inner.items.clone(),
        };
        if let Err(e) = fsutil::write_json_atomic(&self.path, &doc) {
            tracing::warn!("Failed to save cache index: {}", e);
        }
        inner.last_save = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("a.mp4");
        std::fs::write(&media, b"12345").unwrap();
        let index_path = dir.path().join("cache_index.json");

        let index = CacheIndex::load(index_path.clone());
        index.touch(&media, "https://cdn/a.mp4", 8000, ("c1", "spring"));
        index.flush();

        let reloaded = CacheIndex::load(index_path);
        let entry = reloaded.get(&media).unwrap();
        assert_eq!(entry.url, "https://cdn/a.mp4");
        assert_eq!(entry.exposure_ms, 8000);
        assert_eq!(entry.size, 5);
    }

    #[test]
    fn remove_missing_prunes_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("gone.mp4");
        std::fs::write(&media, b"x").unwrap();

        let index = CacheIndex::load(dir.path().join("cache_index.json"));
        index.touch(&media, "https://cdn/gone.mp4", 5000, ("", ""));
        std::fs::remove_file(&media).unwrap();
        index.remove_missing();
        assert!(index.get(&media).is_none());
    }
}
