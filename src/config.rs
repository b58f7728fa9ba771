//! Application configuration.
//!
//! The daemon is driven by a single JSON config file; every field has a
//! default so a minimal file (API key + environment id) is enough. Relative
//! paths resolve against the config file's directory so the agent behaves
//! the same regardless of the working directory the service manager picks.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// How the sync engine behaves when the daemon boots inside the daily
/// prep window surrounding the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPrepMode {
    /// Start playing immediately at the computed position, then force the
    /// cycle back to zero at the exact anchor instant.
    PlayThenResync,
    /// Hold playback (black screen) and start at offset zero exactly at
    /// the anchor.
    WaitUntilAnchor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Remote manifest API
    pub api_url: String,
    pub api_key: String,
    pub environment_id: String,
    pub only_standby: bool,
    pub search_in: String,
    pub include_descendants: bool,
    pub limit: u32,
    pub poll_interval_sec: u64,
    pub request_timeout_sec: u64,
    pub default_exposure_ms: u32,

    // Cache / persisted state
    pub cache_dir: PathBuf,
    pub state_dir: PathBuf,
    pub cache_max_files: u64,
    pub cache_max_bytes: u64,
    pub cache_orphan_grace_sec: u64,
    pub tmp_max_age_sec: u64,
    pub cleanup_interval_sec: u64,
    pub disable_cleanup_when_offline: bool,

    // Offline fallback
    pub offline_fallback: bool,
    pub offline_max_age_hours: f64,
    pub offline_ignore_max_age_when_no_network: bool,

    // Playlist switching policy
    pub require_full_download_before_switch: bool,
    pub allow_empty_playlist_from_api: bool,

    // External renderer
    pub player_path: String,
    pub ipc_path: PathBuf,
    pub rotation_deg: u32,
    pub mute: bool,
    pub hwdec: String,

    // Playback supervision
    pub watchdog_interval_sec: u64,
    pub playback_stall_sec: u64,
    pub playback_mismatch_sec: u64,
    pub media_load_retry_cooldown_sec: u64,

    // Status projection
    pub status_file: Option<PathBuf>,
    pub status_interval_sec: u64,

    // Telemetry
    pub telemetry_enabled: bool,
    pub telemetry_url: String,
    pub telemetry_token: String,
    pub telemetry_interval_sec: u64,
    pub telemetry_timeout_sec: u64,
    pub station_id: String,

    // Wall-clock sync
    pub sync_enabled: bool,
    pub sync_drift_threshold_ms: i64,
    pub sync_hard_resync_ms: i64,
    pub sync_boot_hard_check_sec: u64,
    pub sync_checkpoint_interval_sec: u64,
    pub sync_prep_mode: SyncPrepMode,
    pub sync_ntp_command: String,

    // Service manager integration
    pub notify_systemd: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            environment_id: String::new(),
            only_standby: true,
            search_in: "campaign".into(),
            include_descendants: true,
            limit: 20,
            poll_interval_sec: 1800,
            request_timeout_sec: 15,
            default_exposure_ms: 10_000,
            cache_dir: PathBuf::from("./media_cache"),
            state_dir: PathBuf::new(),
            cache_max_files: 0,
            cache_max_bytes: 0,
            cache_orphan_grace_sec: 3600,
            tmp_max_age_sec: 3600,
            cleanup_interval_sec: 1800,
            disable_cleanup_when_offline: true,
            offline_fallback: true,
            offline_max_age_hours: 0.0,
            offline_ignore_max_age_when_no_network: true,
            require_full_download_before_switch: true,
            allow_empty_playlist_from_api: false,
            player_path: "mpv".into(),
            ipc_path: default_ipc_path(),
            rotation_deg: 0,
            mute: false,
            hwdec: "auto".into(),
            watchdog_interval_sec: 10,
            playback_stall_sec: 25,
            playback_mismatch_sec: 10,
            media_load_retry_cooldown_sec: 60,
            status_file: None,
            status_interval_sec: 5,
            telemetry_enabled: false,
            telemetry_url: String::new(),
            telemetry_token: String::new(),
            telemetry_interval_sec: 60,
            telemetry_timeout_sec: 10,
            station_id: String::new(),
            sync_enabled: true,
            sync_drift_threshold_ms: 300,
            sync_hard_resync_ms: 1200,
            sync_boot_hard_check_sec: 300,
            sync_checkpoint_interval_sec: 3600,
            sync_prep_mode: SyncPrepMode::PlayThenResync,
            sync_ntp_command: default_ntp_command(),
            notify_systemd: false,
        }
    }
}

/// Default IPC endpoint for the renderer's control channel.
pub fn default_ipc_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"\\.\pipe\mpv-kiosk")
    } else {
        std::env::temp_dir().join("mpv-kiosk.sock")
    }
}

fn default_ntp_command() -> String {
    if cfg!(target_os = "linux") {
        "chronyc -a makestep".into()
    } else {
        String::new()
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// Resolve a possibly-relative path against the config file's directory.
fn resolve_from_base(base: &Path, path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn is_windows_named_pipe(path: &Path) -> bool {
    path.to_string_lossy().starts_with(r"\\.\pipe\")
}

impl Config {
    /// Load the config file, layering it over defaults and resolving
    /// relative paths against the file's directory.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("config not found at {}: {}", path.display(), e))?;
        let mut config: Config = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        config.cache_dir = resolve_from_base(&base, &config.cache_dir);
        if config.state_dir.as_os_str().is_empty() {
            config.state_dir = config.cache_dir.join(".state");
        } else {
            config.state_dir = resolve_from_base(&base, &config.state_dir);
        }
        if let Some(status_file) = config.status_file.take() {
            config.status_file = Some(resolve_from_base(&base, &status_file));
        }
        if !is_windows_named_pipe(&config.ipc_path) {
            config.ipc_path = resolve_from_base(&base, &config.ipc_path);
        }
        if !matches!(config.rotation_deg, 0 | 90 | 180 | 270) {
            config.rotation_deg = 0;
        }
        Ok(config)
    }

    /// Whether the remote manifest API can be polled at all.
    pub fn api_credentials_ready(&self) -> bool {
        !self.api_key.is_empty() && !self.environment_id.is_empty() && !self.api_url.is_empty()
    }
}

/// Shared, reloadable view of the config.
///
/// The local config endpoint (out of scope here) rewrites the config file;
/// the poller calls [`SharedConfig::reload`] at the top of each cycle so an
/// updated environment id or rotation is picked up without a restart.
/// Readers always get an immutable snapshot.
#[derive(Clone)]
pub struct SharedConfig {
    path: PathBuf,
    current: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(path: PathBuf, config: Config) -> Self {
        Self {
            path,
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Re-read the config file, keeping the previous snapshot on error.
    pub fn reload(&self) {
        match Config::load(&self.path) {
            Ok(config) => {
                *self.current.write().expect("config lock poisoned") = Arc::new(config);
            }
            Err(e) => {
                tracing::warn!("Config reload failed, keeping previous: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"api_key": "k", "environment_id": "e"}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.poll_interval_sec, 1800);
        assert_eq!(config.sync_drift_threshold_ms, 300);
        assert_eq!(config.sync_prep_mode, SyncPrepMode::PlayThenResync);
        assert!(!config.api_credentials_ready()); // api_url still empty
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"cache_dir": "media"}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.cache_dir, dir.path().join("media"));
        assert_eq!(config.state_dir, dir.path().join("media").join(".state"));
    }

    #[test]
    fn invalid_rotation_falls_back_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"rotation_deg": 45}"#).unwrap();
        assert_eq!(Config::load(&path).unwrap().rotation_deg, 0);
    }

    #[test]
    fn reload_keeps_previous_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"environment_id": "before"}"#).unwrap();

        let shared = SharedConfig::new(path.clone(), Config::load(&path).unwrap());
        std::fs::write(&path, "{not json").unwrap();
        shared.reload();
        assert_eq!(shared.snapshot().environment_id, "before");

        std::fs::write(&path, r#"{"environment_id": "after"}"#).unwrap();
        shared.reload();
        assert_eq!(shared.snapshot().environment_id, "after");
    }
}
