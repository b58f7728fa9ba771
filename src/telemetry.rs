//! Fire-and-forget telemetry heartbeats.
//!
//! Best effort by design: a failed send is logged and recorded in status
//! but never retried aggressively and never blocks playback. The payload
//! is the camelCase heartbeat document the fleet dashboard ingests, keyed
//! by environment and station.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::SharedConfig;
use crate::playlist::Playlist;
use crate::status::StatusState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryMetrics {
    uptime_seconds: u64,
    /// Whether a next item is already resolved on disk.
    preload_size: u8,
    pending_entries: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryPayload {
    environment_id: String,
    status: String,
    heartbeat_type: String,
    /// Client wall clock, epoch milliseconds.
    client_timestamp: i64,
    playlist_size: Option<usize>,
    active_campaign_name: Option<String>,
    next_campaign_name: Option<String>,
    rotation: u32,
    metrics: TelemetryMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    station_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    consecutive_failures: u32,
}

fn health_status(consecutive_failures: u32) -> &'static str {
    match consecutive_failures {
        0 => "ok",
        1..=2 => "warning",
        _ => "error",
    }
}

fn campaign_name(item: &Option<crate::status::ItemStatus>) -> Option<String> {
    item.as_ref()
        .map(|i| i.campaign_name.clone())
        .filter(|name| !name.is_empty())
}

pub struct Telemetry {
    client: reqwest::Client,
    config: SharedConfig,
    status: Arc<StatusState>,
}

impl Telemetry {
    pub fn new(client: reqwest::Client, config: SharedConfig, status: Arc<StatusState>) -> Self {
        Self {
            client,
            config,
            status,
        }
    }

    fn payload(&self, heartbeat_type: &str, error_message: Option<String>) -> TelemetryPayload {
        let cfg = self.config.snapshot();
        let snapshot = self.status.snapshot();
        TelemetryPayload {
            environment_id: cfg.environment_id.clone(),
            status: health_status(snapshot.consecutive_failures).to_string(),
            heartbeat_type: heartbeat_type.to_string(),
            client_timestamp: Utc::now().timestamp_millis(),
            playlist_size: snapshot.playlist_size,
            active_campaign_name: campaign_name(&snapshot.current_item),
            next_campaign_name: campaign_name(&snapshot.next_item),
            rotation: cfg.rotation_deg,
            metrics: TelemetryMetrics {
                uptime_seconds: snapshot.uptime_sec,
                preload_size: u8::from(snapshot.next_item.is_some()),
                pending_entries: 0,
            },
            station_id: Some(cfg.station_id.clone()).filter(|s| !s.is_empty()),
            error_message,
            consecutive_failures: snapshot.consecutive_failures,
        }
    }

    /// Send one heartbeat without waiting for the result.
    pub fn emit(self: &Arc<Self>, heartbeat_type: &str, error_message: Option<String>) {
        let cfg = self.config.snapshot();
        if !cfg.telemetry_enabled || cfg.telemetry_url.is_empty() {
            return;
        }
        let payload = self.payload(heartbeat_type, error_message);
        let this = self.clone();
        tokio::spawn(async move {
            this.send(payload).await;
        });
    }

    async fn send(&self, payload: TelemetryPayload) {
        let cfg = self.config.snapshot();
        let timeout = Duration::from_secs(cfg.telemetry_timeout_sec.max(1));
        let mut request = self
            .client
            .post(&cfg.telemetry_url)
            .timeout(timeout)
            .json(&payload);
        if !cfg.telemetry_token.is_empty() {
            request = request.header("x-interact-telemetry-token", &cfg.telemetry_token);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                self.status.modify(|s| {
                    s.last_telemetry = Some(Utc::now());
                    s.last_telemetry_error = None;
                });
            }
            Ok(response) => {
                let reason = format!("telemetry endpoint returned HTTP {}", response.status());
                tracing::debug!("{}", reason);
                self.status.modify(|s| s.last_telemetry_error = Some(reason));
            }
            Err(e) => {
                tracing::debug!("Telemetry send failed: {}", e);
                self.status
                    .modify(|s| s.last_telemetry_error = Some(e.to_string()));
            }
        }
    }

    pub fn playlist_updated(self: &Arc<Self>, playlist: &Playlist) {
        tracing::debug!(
            "Reporting playlist heartbeat: {} item(s), cycle {}ms",
            playlist.len(),
            playlist.cycle_total_ms
        );
        self.emit("playlist", None);
    }
}

/// Startup heartbeat, then a healthcheck every `telemetry_interval_sec`.
pub async fn run_telemetry_worker(telemetry: Arc<Telemetry>, token: CancellationToken) {
    telemetry.emit("startup", None);
    loop {
        let cfg = telemetry.config.snapshot();
        let interval = Duration::from_secs(cfg.telemetry_interval_sec.max(1));
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = token.cancelled() => return,
        }
        let snapshot = telemetry.status.snapshot();
        let error = snapshot
            .last_poll_error
            .filter(|_| snapshot.consecutive_failures > 0);
        telemetry.emit("healthcheck", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::status::ItemStatus;

    fn shared(dir: &std::path::Path, body: &str) -> SharedConfig {
        let path = dir.join("config.json");
        std::fs::write(&path, body).unwrap();
        SharedConfig::new(path.clone(), Config::load(&path).unwrap())
    }

    #[test]
    fn health_escalates_with_failures() {
        assert_eq!(health_status(0), "ok");
        assert_eq!(health_status(1), "warning");
        assert_eq!(health_status(2), "warning");
        assert_eq!(health_status(3), "error");
        assert_eq!(health_status(10), "error");
    }

    #[test]
    fn payload_matches_heartbeat_schema() {
        let dir = tempfile::tempdir().unwrap();
        let config = shared(
            dir.path(),
            r#"{"environment_id": "env-1", "station_id": "unit-7", "rotation_deg": 90}"#,
        );
        let status = Arc::new(StatusState::new());
        status.modify(|s| {
            s.playlist_size = Some(3);
            s.consecutive_failures = 4;
            s.current_item = Some(ItemStatus {
                url: "https://cdn/a.mp4".into(),
                path: "/cache/a.mp4".into(),
                exposure_ms: 8000,
                campaign_id: "c1".into(),
                campaign_name: "spring".into(),
            });
        });

        let telemetry = Telemetry::new(reqwest::Client::new(), config, status);
        let payload = telemetry.payload("healthcheck", Some("poll failed".into()));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["environmentId"], "env-1");
        assert_eq!(json["stationId"], "unit-7");
        assert_eq!(json["heartbeatType"], "healthcheck");
        assert_eq!(json["playlistSize"], 3);
        assert_eq!(json["activeCampaignName"], "spring");
        assert_eq!(json["rotation"], 90);
        assert_eq!(json["status"], "error");
        assert_eq!(json["errorMessage"], "poll failed");
        assert_eq!(json["metrics"]["preloadSize"], 0);
        assert!(json["clientTimestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn empty_station_id_is_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let config = shared(dir.path(), r#"{"environment_id": "env-1"}"#);
        let telemetry = Telemetry::new(
            reqwest::Client::new(),
            config,
            Arc::new(StatusState::new()),
        );
        let json = serde_json::to_value(telemetry.payload("startup", None)).unwrap();
        assert!(json.get("stationId").is_none());
        assert!(json.get("errorMessage").is_none());
    }

    #[tokio::test]
    async fn emit_is_a_no_op_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = shared(dir.path(), "{}");
        let status = Arc::new(StatusState::new());
        let telemetry = Arc::new(Telemetry::new(
            reqwest::Client::new(),
            config,
            status.clone(),
        ));

        telemetry.emit("startup", None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(status.snapshot().last_telemetry.is_none());
        assert!(status.snapshot().last_telemetry_error.is_none());
    }
}
