//! Persisted playlist state under the state directory.
//!
//! Two documents: `playlist_last.json` (the last playlist the daemon
//! committed to, replayed on offline boot) and `last_success.json` (the
//! instant of the last successful manifest poll, used to age-gate the
//! offline fallback).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fsutil;
use crate::playlist::{MediaItem, Playlist, PlaylistSource};

const PLAYLIST_FILE: &str = "playlist_last.json";
const LAST_SUCCESS_FILE: &str = "last_success.json";

#[derive(Debug, Serialize, Deserialize)]
pub struct SavedPlaylist {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub source: PlaylistSource,
    pub fingerprint: String,
    pub items: Vec<MediaItem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LastSuccess {
    at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PlaylistStore {
    state_dir: PathBuf,
}

impl PlaylistStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
        }
    }

    fn playlist_path(&self) -> PathBuf {
        self.state_dir.join(PLAYLIST_FILE)
    }

    fn last_success_path(&self) -> PathBuf {
        self.state_dir.join(LAST_SUCCESS_FILE)
    }

    pub fn save(&self, playlist: &Playlist) -> std::io::Result<()> {
        let doc = SavedPlaylist {
            version: 1,
            saved_at: playlist.saved_at,
            source: playlist.source,
            fingerprint: playlist.fingerprint.clone(),
            items: playlist.items.clone(),
        };
        fsutil::write_json_atomic(&self.playlist_path(), &doc)
    }

    pub fn load(&self) -> Option<SavedPlaylist> {
        fsutil::read_json(&self.playlist_path())
    }

    pub fn record_success(&self, at: DateTime<Utc>) {
        if let Err(e) = fsutil::write_json_atomic(&self.last_success_path(), &LastSuccess { at }) {
            tracing::warn!("Failed to persist last poll success: {}", e);
        }
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        fsutil::read_json::<LastSuccess>(&self.last_success_path())
            .map(|doc| doc.at)
    }

    /// Paths named by the persisted playlist that still exist on disk.
    /// Cleanup treats these as protected even when the in-memory playlist
    /// has moved on, so an offline reboot still finds its media.
    pub fn saved_playlist_paths(&self) -> HashSet<PathBuf> {
        self.load()
            .map(|doc| {
                doc.items
                    .into_iter()
                    .map(|item| item.path)
                    .filter(|path| path.exists())
                    .collect()
            })
            .unwrap_or_default()
    }
}
