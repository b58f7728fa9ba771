//! Shared runtime status and the periodic status-file writer.
//!
//! Every worker reports into one [`StatusState`]; the writer projects a
//! snapshot to `status_file` as JSON for the operator and any local
//! monitoring to read. The snapshot is also what telemetry payloads are
//! built from, so field names here are load-bearing.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::SharedConfig;
use crate::fsutil;
use crate::playlist::MediaItem;

/// The item currently (or next) on screen, as projected to status.
#[derive(Debug, Clone, Serialize)]
pub struct ItemStatus {
    pub url: String,
    pub path: std::path::PathBuf,
    pub exposure_ms: i64,
    pub campaign_id: String,
    pub campaign_name: String,
}

impl ItemStatus {
    pub fn from_item(item: &MediaItem) -> Self {
        Self {
            url: item.url.clone(),
            path: item.path.clone(),
            exposure_ms: item.effective_exposure_ms(),
            campaign_id: item.campaign_id.clone(),
            campaign_name: item.campaign_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_sec: u64,

    // Manifest polling
    pub last_poll_success: Option<DateTime<Utc>>,
    pub last_poll_error: Option<String>,
    pub consecutive_failures: u32,

    // Playlist
    pub playlist_size: Option<usize>,
    pub playlist_source: Option<String>,
    pub playlist_fingerprint: Option<String>,

    // Playback
    pub playback_state: String,
    pub current_index: Option<usize>,
    pub current_item: Option<ItemStatus>,
    pub next_item: Option<ItemStatus>,
    pub renderer_running: bool,
    pub renderer_last_ok: Option<DateTime<Utc>>,
    pub last_render_error: Option<String>,
    pub blocked_media_count: usize,
    pub black_screen_risk: Option<String>,

    // Wall-clock sync
    pub sync_mode: String,
    pub sync_anchor_utc: Option<DateTime<Utc>>,
    pub sync_cycle_ms: Option<i64>,
    pub sync_drift_ms: Option<i64>,
    pub sync_last_check: Option<DateTime<Utc>>,
    pub sync_last_action: Option<String>,
    pub sync_checkpoint_reason: Option<String>,
    pub sync_next_checkpoint: Option<DateTime<Utc>>,
    pub sync_soft_pending: bool,

    // Cache maintenance
    pub last_cleanup: Option<DateTime<Utc>>,
    pub last_cleanup_removed: Option<usize>,

    // Telemetry
    pub last_telemetry: Option<DateTime<Utc>>,
    pub last_telemetry_error: Option<String>,
}

impl StatusSnapshot {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            uptime_sec: 0,
            last_poll_success: None,
            last_poll_error: None,
            consecutive_failures: 0,
            playlist_size: None,
            playlist_source: None,
            playlist_fingerprint: None,
            playback_state: "starting".into(),
            current_index: None,
            current_item: None,
            next_item: None,
            renderer_running: false,
            renderer_last_ok: None,
            last_render_error: None,
            blocked_media_count: 0,
            black_screen_risk: None,
            sync_mode: "disabled".into(),
            sync_anchor_utc: None,
            sync_cycle_ms: None,
            sync_drift_ms: None,
            sync_last_check: None,
            sync_last_action: None,
            sync_checkpoint_reason: None,
            sync_next_checkpoint: None,
            sync_soft_pending: false,
            last_cleanup: None,
            last_cleanup_removed: None,
            last_telemetry: None,
            last_telemetry_error: None,
        }
    }
}

/// Process-wide status cell. Writers mutate through [`modify`], readers
/// take a [`snapshot`]; both are cheap enough for the watchdog cadence.
///
/// [`modify`]: StatusState::modify
/// [`snapshot`]: StatusState::snapshot
pub struct StatusState {
    started: Instant,
    inner: RwLock<StatusSnapshot>,
}

impl StatusState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inner: RwLock::new(StatusSnapshot::new()),
        }
    }

    pub fn modify(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        f(&mut inner);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let mut snapshot = self
            .inner
            .read()
            .expect("status lock poisoned")
            .clone();
        snapshot.uptime_sec = self.started.elapsed().as_secs();
        snapshot
    }
}

impl Default for StatusState {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically project the status snapshot to the configured file.
pub async fn run_status_writer(
    config: SharedConfig,
    status: Arc<StatusState>,
    token: CancellationToken,
) {
    loop {
        let cfg = config.snapshot();
        if let Some(path) = &cfg.status_file {
            let snapshot = status.snapshot();
            if let Err(e) = fsutil::write_json_atomic(path, &snapshot) {
                tracing::warn!("Failed to write status file {}: {}", path.display(), e);
            }
        }
        let interval = std::time::Duration::from_secs(cfg.status_interval_sec.max(1));
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = token.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modify_is_visible_in_next_snapshot() {
        let status = StatusState::new();
        status.modify(|s| {
            s.consecutive_failures = 3;
            s.playback_state = "playing".into();
        });
        let snapshot = status.snapshot();
        assert_eq!(snapshot.consecutive_failures, 3);
        assert_eq!(snapshot.playback_state, "playing");
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let status = StatusState::new();
        status.modify(|s| s.playlist_size = Some(4));
        let json = serde_json::to_value(status.snapshot()).unwrap();
        assert_eq!(json["playlist_size"], 4);
        assert!(json["last_poll_success"].is_null());
        assert_eq!(json["playback_state"], "starting");
    }

    #[tokio::test]
    async fn writer_produces_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let status_path = dir.path().join("status.json");
        std::fs::write(
            &config_path,
            format!(r#"{{"status_file": {:?}, "status_interval_sec": 1}}"#, status_path),
        )
        .unwrap();
        let config = SharedConfig::new(
            config_path.clone(),
            crate::config::Config::load(&config_path).unwrap(),
        );

        let status = Arc::new(StatusState::new());
        let token = CancellationToken::new();
        let writer = tokio::spawn(run_status_writer(config, status, token.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        token.cancel();
        writer.await.unwrap();

        let body = std::fs::read_to_string(&status_path).unwrap();
        assert!(body.contains("playback_state"));
    }
}
