//! Playlist resolution: manifest poll, media download, switch policy and
//! the offline fallback chain.
//!
//! The resolver is the only writer of the shared playlist. A poll cycle
//! either commits a fully resolved playlist, keeps the current one, or
//! records a failure; it never publishes a list referencing media that is
//! not on disk.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cache::{self, CacheStore};
use crate::config::SharedConfig;
use crate::manifest::{self, ManifestClient, ManifestEntry};
use crate::playlist::store::PlaylistStore;
use crate::playlist::{
    fingerprint_entries, DownloadState, MediaItem, Playlist, PlaylistSource, SharedPlaylist,
};
use crate::retry::{Backoff, RetryConfig};
use crate::status::StatusState;
use crate::telemetry::Telemetry;

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("no usable offline media (persisted playlist absent or expired, cache empty)")]
    NoOfflineData,
}

/// Result of one poll cycle.
#[derive(Debug)]
pub enum PollOutcome {
    /// A new playlist was committed and published.
    Updated(Arc<Playlist>),
    /// Manifest fetched fine; current playlist stands.
    Unchanged,
    Failed(String),
}

pub struct Resolver {
    config: SharedConfig,
    manifest: ManifestClient,
    http: reqwest::Client,
    cache: Arc<CacheStore>,
    store: PlaylistStore,
    playlist: SharedPlaylist,
    status: Arc<StatusState>,
    retry: RetryConfig,
}

impl Resolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SharedConfig,
        manifest: ManifestClient,
        http: reqwest::Client,
        cache: Arc<CacheStore>,
        store: PlaylistStore,
        playlist: SharedPlaylist,
        status: Arc<StatusState>,
    ) -> Self {
        Self {
            config,
            manifest,
            http,
            cache,
            store,
            playlist,
            status,
            retry: RetryConfig::default(),
        }
    }

    pub fn shared_playlist(&self) -> SharedPlaylist {
        self.playlist.clone()
    }

    /// One poll cycle: fetch the manifest, download what is missing,
    /// apply the switch policy and publish.
    pub async fn poll(&self) -> PollOutcome {
        self.config.reload();
        let cfg = self.config.snapshot();
        if !cfg.api_credentials_ready() {
            return self.record_failure("api credentials not configured".into());
        }

        let entries = match self.manifest.fetch(&cfg).await {
            Ok(entries) => entries,
            Err(e) => return self.record_failure(e.to_string()),
        };
        self.record_success();

        if entries.is_empty() {
            return self.handle_empty_manifest(&cfg).await;
        }

        let fingerprint = fingerprint_entries(
            entries
                .iter()
                .map(|e| (e.url.as_str(), e.exposure_ms)),
        );

        let (items, states) = self.download_entries(&entries).await;
        let failed = states
            .iter()
            .filter(|s| **s == DownloadState::Failed)
            .count();
        if failed > 0 {
            tracing::warn!(
                "{}/{} manifest entries failed to download",
                failed,
                entries.len()
            );
        }

        if items.is_empty() {
            // A manifest full of dead links must not blank the screen.
            tracing::warn!("No manifest entry could be resolved, keeping current playlist");
            return PollOutcome::Unchanged;
        }

        if failed > 0 && cfg.require_full_download_before_switch {
            let (current, _) = self.playlist.snapshot();
            if !current.is_empty() {
                tracing::info!(
                    "Deferring playlist switch until all {} entries are cached",
                    entries.len()
                );
                return PollOutcome::Unchanged;
            }
            // Nothing on screen: a partial playlist beats a black screen.
            tracing::warn!("Switching to partially downloaded playlist, screen is empty");
        }

        self.commit(Playlist::new(items, PlaylistSource::Live, fingerprint))
    }

    /// Empty-but-valid manifest. Unless configured to honor it, an active
    /// screen keeps its content; an empty screen rebuilds from the cache.
    async fn handle_empty_manifest(&self, cfg: &crate::config::Config) -> PollOutcome {
        if cfg.allow_empty_playlist_from_api {
            tracing::info!("Manifest is empty, clearing playlist as configured");
            return self.commit(Playlist::new(
                Vec::new(),
                PlaylistSource::Live,
                fingerprint_entries(std::iter::empty()),
            ));
        }
        let (current, _) = self.playlist.snapshot();
        if !current.is_empty() {
            tracing::warn!("Manifest is empty, keeping current {} item(s)", current.len());
            return PollOutcome::Unchanged;
        }
        match self.playlist_from_cache(cfg) {
            Some(playlist) => {
                tracing::warn!(
                    "Manifest is empty and nothing is playing, rebuilt {} item(s) from cache",
                    playlist.len()
                );
                self.commit(playlist)
            }
            None => PollOutcome::Unchanged,
        }
    }

    /// Download every entry, preserving manifest order. Each cached file
    /// gets its index entry refreshed with the manifest's metadata so the
    /// offline fallback can reconstruct exposures later.
    async fn download_entries(
        &self,
        entries: &[ManifestEntry],
    ) -> (Vec<MediaItem>, Vec<DownloadState>) {
        let mut items = Vec::with_capacity(entries.len());
        let mut states = vec![DownloadState::Missing; entries.len()];
        for (i, entry) in entries.iter().enumerate() {
            states[i] = DownloadState::Downloading;
            match self.cache.download(&self.http, &entry.url, &self.retry).await {
                Ok(path) => {
                    if !cache::is_supported_media_path(&path, true) {
                        tracing::warn!("Skipping unsupported media type: {}", entry.url);
                        states[i] = DownloadState::Failed;
                        continue;
                    }
                    self.cache.index().touch(
                        &path,
                        &entry.url,
                        entry.exposure_ms,
                        (&entry.campaign_id, &entry.campaign_name),
                    );
                    states[i] = DownloadState::Cached;
                    items.push(MediaItem {
                        url: entry.url.clone(),
                        path,
                        exposure_ms: entry.exposure_ms,
                        campaign_id: entry.campaign_id.clone(),
                        campaign_name: entry.campaign_name.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!("Download failed for {}: {}", entry.url, e);
                    states[i] = DownloadState::Failed;
                }
            }
        }
        (items, states)
    }

    /// Publish + persist + evict. Returns `Unchanged` when the playlist is
    /// byte-for-byte what is already live.
    fn commit(&self, playlist: Playlist) -> PollOutcome {
        let cfg = self.config.snapshot();
        let keep: HashSet<PathBuf> = playlist.items.iter().map(|i| i.path.clone()).collect();

        if !self.playlist.publish(playlist) {
            return PollOutcome::Unchanged;
        }
        let (published, version) = self.playlist.snapshot();
        tracing::info!(
            "Playlist v{} published: {} item(s), cycle {}ms, source {:?}",
            version,
            published.len(),
            published.cycle_total_ms,
            published.source
        );
        if let Err(e) = self.store.save(&published) {
            tracing::warn!("Failed to persist playlist: {}", e);
        }
        self.status.modify(|s| {
            s.playlist_size = Some(published.len());
            s.playlist_source = Some(format!("{:?}", published.source).to_lowercase());
            s.playlist_fingerprint = Some(published.fingerprint.clone());
        });

        // Cache contents changed: enforce quotas right away instead of
        // waiting for the next cleanup pass.
        let mut protected = keep;
        protected.extend(self.store.saved_playlist_paths());
        self.cache.evict_if_needed(&cfg, &protected);

        PollOutcome::Updated(published)
    }

    fn record_success(&self) {
        let now = Utc::now();
        self.status.modify(|s| {
            s.last_poll_success = Some(now);
            s.last_poll_error = None;
            s.consecutive_failures = 0;
        });
        self.store.record_success(now);
    }

    fn record_failure(&self, reason: String) -> PollOutcome {
        tracing::warn!("Manifest poll failed: {}", reason);
        self.status.modify(|s| {
            s.last_poll_error = Some(reason.clone());
            s.consecutive_failures = s.consecutive_failures.saturating_add(1);
        });
        PollOutcome::Failed(reason)
    }

    /// Boot-time fallback when the API cannot be polled (or the first poll
    /// failed): replay the persisted playlist, else rebuild from cache.
    /// Both paths honor the offline age limit.
    pub async fn resolve_offline(&self) -> Result<Arc<Playlist>, OfflineError> {
        let cfg = self.config.snapshot();

        let network_up = if cfg.offline_max_age_hours > 0.0
            && cfg.offline_ignore_max_age_when_no_network
            && !cfg.api_url.is_empty()
        {
            Some(manifest::endpoint_reachable(&cfg.api_url, Duration::from_secs(3)).await)
        } else {
            None
        };

        if let Some(saved) = self.store.load() {
            if self.offline_age_ok(&cfg, Some(saved.saved_at), network_up) {
                let items: Vec<MediaItem> = saved
                    .items
                    .into_iter()
                    .filter(|item| {
                        item.path.is_file()
                            && cache::is_supported_media_path(&item.path, true)
                            && std::fs::metadata(&item.path).map(|m| m.len() > 0).unwrap_or(false)
                    })
                    .collect();
                if !items.is_empty() {
                    tracing::info!(
                        "Restored persisted playlist: {} of saved item(s) present on disk",
                        items.len()
                    );
                    let playlist =
                        Playlist::new(items, PlaylistSource::Offline, saved.fingerprint);
                    self.playlist.publish(playlist);
                    let (published, _) = self.playlist.snapshot();
                    self.status.modify(|s| {
                        s.playlist_size = Some(published.len());
                        s.playlist_source = Some("offline".into());
                    });
                    return Ok(published);
                }
                tracing::warn!("Persisted playlist references no existing media");
            } else {
                tracing::warn!("Persisted playlist too old for offline fallback, ignoring");
            }
        }

        if self.offline_age_ok(&cfg, None, network_up) {
            if let Some(playlist) = self.playlist_from_cache(&cfg) {
                tracing::warn!(
                    "Reconstructed playlist from cache scan: {} item(s)",
                    playlist.len()
                );
                self.playlist.publish(playlist);
                let (published, _) = self.playlist.snapshot();
                self.status.modify(|s| {
                    s.playlist_size = Some(published.len());
                    s.playlist_source = Some("offline".into());
                });
                return Ok(published);
            }
        }

        Err(OfflineError::NoOfflineData)
    }

    /// Age gate for offline content. No limit configured means always ok;
    /// a confirmed-down network waives the limit when configured to.
    fn offline_age_ok(
        &self,
        cfg: &crate::config::Config,
        saved_at: Option<DateTime<Utc>>,
        network_up: Option<bool>,
    ) -> bool {
        if cfg.offline_max_age_hours <= 0.0 {
            return true;
        }
        if cfg.offline_ignore_max_age_when_no_network && network_up == Some(false) {
            tracing::info!("Network is down, waiving offline age limit");
            return true;
        }
        let reference = self.store.last_success().or(saved_at);
        let Some(reference) = reference else {
            return true;
        };
        let age_hours = (Utc::now() - reference).num_seconds() as f64 / 3600.0;
        age_hours <= cfg.offline_max_age_hours
    }

    /// Last-resort playlist: every playable file in the cache, ordered by
    /// last use (oldest first, stable on path). Exposure comes from the
    /// index when known, otherwise the configured default.
    fn playlist_from_cache(&self, cfg: &crate::config::Config) -> Option<Playlist> {
        let mut entries: Vec<cache::CacheEntry> = self
            .cache
            .list()
            .into_iter()
            .filter(|entry| {
                entry.size > 0
                    && cache::is_supported_media_path(&entry.path, entry.meta.is_some())
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        entries.sort_by(|a, b| (a.last_used, &a.path).cmp(&(b.last_used, &b.path)));

        let items: Vec<MediaItem> = entries
            .into_iter()
            .map(|entry| {
                let meta = entry.meta;
                MediaItem {
                    url: meta
                        .as_ref()
                        .map(|m| m.url.clone())
                        .unwrap_or_else(|| format!("cache://{}", entry.path.display())),
                    path: entry.path,
                    exposure_ms: meta
                        .as_ref()
                        .map(|m| m.exposure_ms)
                        .filter(|&ms| ms > 0)
                        .unwrap_or(i64::from(cfg.default_exposure_ms)),
                    campaign_id: meta.as_ref().map(|m| m.campaign_id.clone()).unwrap_or_default(),
                    campaign_name: meta.map(|m| m.campaign_name).unwrap_or_default(),
                }
            })
            .collect();
        let fingerprint =
            fingerprint_entries(items.iter().map(|i| (i.url.as_str(), i.exposure_ms)));
        Some(Playlist::new(items, PlaylistSource::Offline, fingerprint))
    }
}

/// Poller loop: one poll per interval, escalating backoff across failures,
/// immediate re-poll on `poll_now`. The bootstrap poll happens before this
/// worker starts, so the loop sleeps first.
pub async fn run_poller(
    resolver: Arc<Resolver>,
    telemetry: Arc<Telemetry>,
    poll_now: Arc<tokio::sync::Notify>,
    token: CancellationToken,
) {
    let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
    let mut wait = Duration::from_secs(resolver.config.snapshot().poll_interval_sec.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = poll_now.notified() => {}
            _ = token.cancelled() => return,
        }
        let outcome = resolver.poll().await;
        let cfg = resolver.config.snapshot();
        wait = match outcome {
            PollOutcome::Updated(playlist) => {
                backoff.reset();
                telemetry.playlist_updated(&playlist);
                Duration::from_secs(cfg.poll_interval_sec.max(1))
            }
            PollOutcome::Unchanged => {
                backoff.reset();
                Duration::from_secs(cfg.poll_interval_sec.max(1))
            }
            PollOutcome::Failed(reason) => {
                telemetry.emit("media_fetch", Some(reason));
                backoff.next_delay()
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn write_config(dir: &std::path::Path, extra: &str) -> SharedConfig {
        let path = dir.join("config.json");
        let body = format!(
            r#"{{"cache_dir": {:?}, "state_dir": {:?}{}}}"#,
            dir.join("cache"),
            dir.join("state"),
            extra
        );
        std::fs::write(&path, body).unwrap();
        SharedConfig::new(path.clone(), Config::load(&path).unwrap())
    }

    fn build_resolver(config: SharedConfig) -> Resolver {
        let cfg = config.snapshot();
        let cache = Arc::new(CacheStore::open(&cfg).unwrap());
        let store = PlaylistStore::new(&cfg.state_dir);
        let client = reqwest::Client::new();
        Resolver::new(
            config,
            ManifestClient::new(client.clone()),
            client,
            cache,
            store,
            SharedPlaylist::new(),
            Arc::new(StatusState::new()),
        )
    }

    #[tokio::test]
    async fn offline_fails_with_nothing_persisted_or_cached() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = build_resolver(write_config(dir.path(), ""));
        assert!(matches!(
            resolver.resolve_offline().await,
            Err(OfflineError::NoOfflineData)
        ));
    }

    #[tokio::test]
    async fn offline_replays_persisted_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = build_resolver(write_config(dir.path(), ""));

        let path = resolver.cache.put("https://cdn/a.mp4", b"video").unwrap();
        let playlist = Playlist::new(
            vec![MediaItem {
                url: "https://cdn/a.mp4".into(),
                path,
                exposure_ms: 8000,
                campaign_id: String::new(),
                campaign_name: String::new(),
            }],
            PlaylistSource::Live,
            "fp".into(),
        );
        resolver.store.save(&playlist).unwrap();

        let restored = resolver.resolve_offline().await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.source, PlaylistSource::Offline);
        assert_eq!(resolver.playlist.snapshot().0.len(), 1);
    }

    #[tokio::test]
    async fn offline_skips_items_missing_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = build_resolver(write_config(dir.path(), ""));

        let present = resolver.cache.put("https://cdn/a.mp4", b"video").unwrap();
        let playlist = Playlist::new(
            vec![
                MediaItem {
                    url: "https://cdn/a.mp4".into(),
                    path: present,
                    exposure_ms: 8000,
                    campaign_id: String::new(),
                    campaign_name: String::new(),
                },
                MediaItem {
                    url: "https://cdn/gone.mp4".into(),
                    path: dir.path().join("cache").join("gone.mp4"),
                    exposure_ms: 8000,
                    campaign_id: String::new(),
                    campaign_name: String::new(),
                },
            ],
            PlaylistSource::Live,
            "fp".into(),
        );
        resolver.store.save(&playlist).unwrap();

        let restored = resolver.resolve_offline().await.unwrap();
        assert_eq!(restored.len(), 1);
    }

    #[tokio::test]
    async fn offline_rebuilds_from_cache_scan_without_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = build_resolver(write_config(dir.path(), ""));

        let a = resolver.cache.put("https://cdn/a.mp4", b"video").unwrap();
        resolver
            .cache
            .index()
            .touch(&a, "https://cdn/a.mp4", 7000, ("c1", "spring"));
        resolver.cache.put("https://cdn/b.jpg", b"image").unwrap();

        let restored = resolver.resolve_offline().await.unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.source, PlaylistSource::Offline);
        // Indexed exposure survives; unindexed falls back to the default.
        let by_url: std::collections::HashMap<_, _> = restored
            .items
            .iter()
            .map(|i| (i.url.clone(), i.exposure_ms))
            .collect();
        assert_eq!(by_url["https://cdn/a.mp4"], 7000);
        assert_eq!(by_url["https://cdn/b.jpg"], 10_000);
    }

    #[tokio::test]
    async fn stale_persisted_playlist_is_rejected_by_age_limit() {
        let dir = tempfile::tempdir().unwrap();
        // Age limit of ~1 hour, and do not waive it on network state.
        let resolver = build_resolver(write_config(
            dir.path(),
            r#", "offline_max_age_hours": 1.0, "offline_ignore_max_age_when_no_network": false"#,
        ));

        let path = resolver.cache.put("https://cdn/a.mp4", b"video").unwrap();
        let mut playlist = Playlist::new(
            vec![MediaItem {
                url: "https://cdn/a.mp4".into(),
                path,
                exposure_ms: 8000,
                campaign_id: String::new(),
                campaign_name: String::new(),
            }],
            PlaylistSource::Live,
            "fp".into(),
        );
        playlist.saved_at = Utc::now() - chrono::Duration::hours(48);
        resolver.store.save(&playlist).unwrap();
        resolver
            .store
            .record_success(Utc::now() - chrono::Duration::hours(48));

        // Both the persisted playlist and the cache-scan path are gated.
        assert!(resolver.resolve_offline().await.is_err());
    }

    #[tokio::test]
    async fn poll_without_credentials_records_failure() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = build_resolver(write_config(dir.path(), ""));
        let outcome = resolver.poll().await;
        assert!(matches!(outcome, PollOutcome::Failed(_)));
        assert_eq!(resolver.status.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn poll_picks_up_credentials_added_to_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = build_resolver(write_config(dir.path(), ""));

        match resolver.poll().await {
            PollOutcome::Failed(reason) => assert!(reason.contains("credentials")),
            other => panic!("unexpected outcome {:?}", other),
        }

        // The config editor fills in the API section; the next cycle must
        // see it without a process restart.
        std::fs::write(
            dir.path().join("config.json"),
            format!(
                r#"{{"cache_dir": {:?}, "state_dir": {:?},
                    "api_url": "http://127.0.0.1:1/manifest",
                    "api_key": "k", "environment_id": "e",
                    "request_timeout_sec": 1}}"#,
                dir.path().join("cache"),
                dir.path().join("state"),
            ),
        )
        .unwrap();

        match resolver.poll().await {
            PollOutcome::Failed(reason) => {
                // A fetch was attempted and failed on the network, which
                // proves the new credentials were loaded.
                assert!(!reason.contains("credentials"), "got: {}", reason);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_manifest_keeps_current_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = build_resolver(write_config(dir.path(), ""));

        let path = resolver.cache.put("https://cdn/a.mp4", b"video").unwrap();
        resolver.playlist.publish(Playlist::new(
            vec![MediaItem {
                url: "https://cdn/a.mp4".into(),
                path,
                exposure_ms: 8000,
                campaign_id: String::new(),
                campaign_name: String::new(),
            }],
            PlaylistSource::Live,
            "fp".into(),
        ));
        let (_, version_before) = resolver.playlist.snapshot();

        let cfg = resolver.config.snapshot();
        let outcome = resolver.handle_empty_manifest(&cfg).await;

        assert!(matches!(outcome, PollOutcome::Unchanged));
        let (current, version_after) = resolver.playlist.snapshot();
        assert_eq!(current.len(), 1);
        assert_eq!(version_after, version_before);
    }

    #[tokio::test]
    async fn empty_manifest_clears_playlist_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = build_resolver(write_config(
            dir.path(),
            r#", "allow_empty_playlist_from_api": true"#,
        ));

        let path = resolver.cache.put("https://cdn/a.mp4", b"video").unwrap();
        resolver.playlist.publish(Playlist::new(
            vec![MediaItem {
                url: "https://cdn/a.mp4".into(),
                path,
                exposure_ms: 8000,
                campaign_id: String::new(),
                campaign_name: String::new(),
            }],
            PlaylistSource::Live,
            "fp".into(),
        ));

        let cfg = resolver.config.snapshot();
        let outcome = resolver.handle_empty_manifest(&cfg).await;

        match outcome {
            PollOutcome::Updated(playlist) => assert!(playlist.is_empty()),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
