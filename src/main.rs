//! kioskd: unattended digital-signage playback agent.
//!
//! Polls a remote manifest API for campaign media, caches everything
//! locally, and drives an external mpv renderer over its JSON IPC socket.
//! Playback position is derived from UTC alone, so every device showing
//! the same playlist shows the same item at the same moment without any
//! device-to-device coordination.

mod cache;
mod cli;
mod config;
mod fsutil;
mod manifest;
mod player;
mod playlist;
mod retry;
mod shutdown;
mod status;
mod supervisor;
mod sync;
mod systemd;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use crate::cache::CacheStore;
use crate::cli::Cli;
use crate::config::{Config, SharedConfig};
use crate::manifest::ManifestClient;
use crate::playlist::resolver::{PollOutcome, Resolver};
use crate::playlist::store::PlaylistStore;
use crate::playlist::SharedPlaylist;
use crate::status::StatusState;
use crate::supervisor::Supervisor;
use crate::systemd::SystemdNotifier;
use crate::telemetry::Telemetry;

fn init_tracing(level: cli::LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kioskd={}", level.as_str())));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Get something on screen before the supervisor starts: a live poll when
/// the API is configured, the offline fallback chain otherwise or when the
/// poll fails. An empty playlist is only fatal when the API can never be
/// polled either.
async fn bootstrap_content(config: &SharedConfig, resolver: &Arc<Resolver>) -> anyhow::Result<()> {
    let cfg = config.snapshot();
    if cfg.api_credentials_ready() {
        match resolver.poll().await {
            PollOutcome::Updated(playlist) => {
                tracing::info!("Initial playlist: {} item(s)", playlist.len());
                return Ok(());
            }
            PollOutcome::Unchanged => {
                // Fetched fine but nothing published (empty manifest with
                // nothing cached, or deferred switch); fall through.
            }
            PollOutcome::Failed(reason) => {
                tracing::warn!("Initial poll failed: {}", reason);
            }
        }
    } else {
        tracing::warn!("API credentials not configured; running from local content only");
    }

    if cfg.offline_fallback {
        match resolver.resolve_offline().await {
            Ok(playlist) => {
                tracing::info!("Starting offline with {} item(s)", playlist.len());
                return Ok(());
            }
            Err(e) => tracing::warn!("Offline fallback unavailable: {}", e),
        }
    }

    if cfg.api_credentials_ready() {
        // The poller will keep trying; start with a blank screen.
        tracing::warn!("No content yet; waiting for the manifest API");
        Ok(())
    } else {
        anyhow::bail!("no API credentials configured and no offline media available")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_level);

    let config_path = PathBuf::from(&args.config);
    let config = Config::load(&config_path)?;
    if args.check_config {
        println!("Config OK: {}", config_path.display());
        return Ok(());
    }
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating state dir {}", config.state_dir.display()))?;

    let shared_config = SharedConfig::new(config_path, config);
    let cfg = shared_config.snapshot();
    tracing::info!(
        "Starting kioskd (cache {}, poll every {}s)",
        cfg.cache_dir.display(),
        cfg.poll_interval_sec
    );

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("building HTTP client")?;

    let status = Arc::new(StatusState::new());
    let cache = Arc::new(CacheStore::open(&cfg).context("opening media cache")?);
    let store = PlaylistStore::new(&cfg.state_dir);
    let playlist = SharedPlaylist::new();
    let telemetry = Arc::new(Telemetry::new(
        http.clone(),
        shared_config.clone(),
        status.clone(),
    ));
    let resolver = Arc::new(Resolver::new(
        shared_config.clone(),
        ManifestClient::new(http.clone()),
        http,
        cache.clone(),
        store.clone(),
        playlist.clone(),
        status.clone(),
    ));

    bootstrap_content(&shared_config, &resolver).await?;

    let token = shutdown::install_signal_handler();
    let notifier = SystemdNotifier::new(cfg.notify_systemd);
    let poll_now = Arc::new(Notify::new());

    let mut workers = Vec::new();
    // Always spawned: poll() reloads the config each cycle, so credentials
    // added after an offline boot are picked up without a restart.
    workers.push(tokio::spawn(playlist::resolver::run_poller(
        resolver.clone(),
        telemetry.clone(),
        poll_now.clone(),
        token.child_token(),
    )));
    workers.push(tokio::spawn(cache::run_cleanup_worker(
        shared_config.clone(),
        playlist.clone(),
        store,
        status.clone(),
        cache.clone(),
        token.child_token(),
    )));
    workers.push(tokio::spawn(status::run_status_writer(
        shared_config.clone(),
        status.clone(),
        token.child_token(),
    )));
    if cfg.telemetry_enabled {
        workers.push(tokio::spawn(telemetry::run_telemetry_worker(
            telemetry.clone(),
            token.child_token(),
        )));
    }

    let result = Supervisor::new(
        shared_config,
        playlist,
        status,
        cache.clone(),
        telemetry,
        notifier,
    )
    .run(token.clone())
    .await;

    notifier.notify_stopping();
    token.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    cache.index().flush();
    tracing::info!("Shutdown complete");
    result
}
