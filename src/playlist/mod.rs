//! Playlist data model and the atomically swapped shared snapshot.
//!
//! A `Playlist` is immutable once built: any membership or ordering change
//! produces a new value with a new fingerprint, published through
//! [`SharedPlaylist`] so readers (supervisor, status, telemetry) never see
//! a half-updated list.

pub mod resolver;
pub mod store;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Download progress of a manifest entry within one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Missing,
    Downloading,
    Cached,
    Failed,
}

/// One playable entry: a media file on disk plus its display duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub url: String,
    pub path: PathBuf,
    pub exposure_ms: i64,
    #[serde(default)]
    pub campaign_id: String,
    #[serde(default)]
    pub campaign_name: String,
}

impl MediaItem {
    /// Display duration with a floor of one second, so a malformed
    /// manifest can never produce a zero-length (busy-looping) item.
    pub fn effective_exposure_ms(&self) -> i64 {
        self.exposure_ms.max(1000)
    }
}

/// Where the active playlist came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistSource {
    /// Built from a successful manifest poll.
    Live,
    /// Restored from persisted state or reconstructed from the cache.
    Offline,
}

#[derive(Debug, Clone)]
pub struct Playlist {
    pub items: Vec<MediaItem>,
    pub source: PlaylistSource,
    pub fingerprint: String,
    pub saved_at: DateTime<Utc>,
    /// Sum of all effective exposures; zero only for an empty playlist.
    pub cycle_total_ms: i64,
}

impl Playlist {
    pub fn new(items: Vec<MediaItem>, source: PlaylistSource, fingerprint: String) -> Self {
        let cycle_total_ms = items.iter().map(MediaItem::effective_exposure_ms).sum();
        Self {
            items,
            source,
            fingerprint,
            saved_at: Utc::now(),
            cycle_total_ms,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), PlaylistSource::Offline, String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Effective per-item durations in playback order, as consumed by the
    /// sync timeline math.
    pub fn durations_ms(&self) -> Vec<i64> {
        self.items
            .iter()
            .map(MediaItem::effective_exposure_ms)
            .collect()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Fingerprint of manifest content: URL + exposure in order. Detects
/// remote changes without touching file contents.
pub fn fingerprint_entries<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, i64)>,
{
    let payload: Vec<serde_json::Value> = entries
        .into_iter()
        .map(|(url, exposure_ms)| {
            serde_json::json!({"url": url, "exposure_ms": exposure_ms})
        })
        .collect();
    sha256_hex(
        serde_json::to_string(&payload)
            .expect("fingerprint payload serializes")
            .as_bytes(),
    )
}

/// Signature over resolved local paths + exposures; distinguishes playlists
/// whose manifests agree but whose on-disk resolution differs.
pub fn items_signature(items: &[MediaItem]) -> String {
    let payload: Vec<serde_json::Value> = items
        .iter()
        .map(|item| serde_json::json!({"path": item.path, "exposure_ms": item.exposure_ms}))
        .collect();
    sha256_hex(
        serde_json::to_string(&payload)
            .expect("signature payload serializes")
            .as_bytes(),
    )
}

struct SharedInner {
    playlist: Arc<Playlist>,
    version: u64,
    signature: String,
}

/// Atomically swapped playlist snapshot with a version counter.
///
/// Consumers compare the version they last saw to detect changes; the
/// resolver is the only writer.
#[derive(Clone)]
pub struct SharedPlaylist {
    inner: Arc<RwLock<SharedInner>>,
}

impl SharedPlaylist {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SharedInner {
                playlist: Arc::new(Playlist::empty()),
                version: 0,
                signature: String::new(),
            })),
        }
    }

    pub fn snapshot(&self) -> (Arc<Playlist>, u64) {
        let inner = self.inner.read().expect("playlist lock poisoned");
        (inner.playlist.clone(), inner.version)
    }

    /// Publish a new playlist. Returns `false` (and leaves the version
    /// untouched) when fingerprint and resolved signature both match the
    /// current snapshot.
    pub fn publish(&self, playlist: Playlist) -> bool {
        let signature = items_signature(&playlist.items);
        let mut inner = self.inner.write().expect("playlist lock poisoned");
        if playlist.fingerprint == inner.playlist.fingerprint && signature == inner.signature {
            return false;
        }
        inner.playlist = Arc::new(playlist);
        inner.version += 1;
        inner.signature = signature;
        true
    }
}

impl Default for SharedPlaylist {
    fn default() -> Self {
        Self::new()
    }
}
