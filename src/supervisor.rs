//! Playback supervision: the single task that owns the renderer, walks the
//! playlist on the shared wall-clock timeline and keeps content on screen.
//!
//! Everything here is deadline-driven. The loop computes the earliest of
//! the next item boundary, the next watchdog tick and the next sync
//! checkpoint, sleeps exactly that long, then handles whatever came due.
//! There is no polling interval to tune and no busy loop to burn CPU on a
//! fanless player box.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{self, CacheStore};
use crate::config::SharedConfig;
use crate::player::Player;
use crate::playlist::{MediaItem, Playlist, SharedPlaylist};
use crate::status::{ItemStatus, StatusState};
use crate::sync::{self, BootPlan, CheckpointReason, DriftAction, SyncEngine, SyncMode};
use crate::systemd::SystemdNotifier;
use crate::telemetry::Telemetry;

/// Floor for the supervisor sleep so a zero deadline cannot spin the loop.
const MIN_SLEEP: Duration = Duration::from_millis(20);
/// Cadence when there is nothing to play and nothing scheduled.
const IDLE_SLEEP: Duration = Duration::from_millis(1000);
const STOP_GRACE: Duration = Duration::from_secs(3);

/// One item currently on screen.
#[derive(Debug)]
struct PlaybackSession {
    index: usize,
    item: MediaItem,
    /// Offset into the item at which playback started.
    start_offset_ms: i64,
    started_at: Instant,
    /// Renderer generation the item was loaded into; a newer generation
    /// means the screen no longer shows this item.
    generation: u64,
    is_image: bool,
}

impl PlaybackSession {
    fn remaining(&self) -> Duration {
        let shown = self.started_at.elapsed().as_millis() as i64 + self.start_offset_ms;
        let left = self.item.effective_exposure_ms() - shown;
        Duration::from_millis(left.max(0) as u64)
    }

    fn is_due(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Where this session currently sits on the cycle ring.
    fn cycle_pos_ms(&self, playlist: &Playlist) -> i64 {
        let before = cycle_offset_of(playlist, self.index);
        let into = self.start_offset_ms + self.started_at.elapsed().as_millis() as i64;
        let total = playlist.cycle_total_ms.max(1);
        (before + into.min(self.item.effective_exposure_ms())).rem_euclid(total)
    }
}

/// Milliseconds of cycle time before `index`.
fn cycle_offset_of(playlist: &Playlist, index: usize) -> i64 {
    playlist
        .items
        .iter()
        .take(index)
        .map(MediaItem::effective_exposure_ms)
        .sum()
}

/// Health-check bookkeeping between watchdog ticks.
#[derive(Debug, Default)]
struct HealthProbe {
    last_time_pos: Option<f64>,
    stalled_since: Option<Instant>,
    mismatch_since: Option<Instant>,
}

impl HealthProbe {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct Supervisor {
    config: SharedConfig,
    playlist: SharedPlaylist,
    status: Arc<StatusState>,
    cache: Arc<CacheStore>,
    telemetry: Arc<Telemetry>,
    notifier: SystemdNotifier,
    player: Player,
    sync: SyncEngine,
    session: Option<PlaybackSession>,
    /// Paths that recently failed to load, blocked until the deadline.
    cooldown: HashMap<PathBuf, Instant>,
    probe: HealthProbe,
    next_watchdog: Instant,
    seen_version: u64,
}

impl Supervisor {
    pub fn new(
        config: SharedConfig,
        playlist: SharedPlaylist,
        status: Arc<StatusState>,
        cache: Arc<CacheStore>,
        telemetry: Arc<Telemetry>,
        notifier: SystemdNotifier,
    ) -> Self {
        let cfg = config.snapshot();
        let sync = SyncEngine::new(&cfg, Utc::now());
        let player = Player::new(config.clone());
        Self {
            config,
            playlist,
            status,
            cache,
            telemetry,
            notifier,
            player,
            sync,
            session: None,
            cooldown: HashMap::new(),
            probe: HealthProbe::default(),
            next_watchdog: Instant::now(),
            seen_version: 0,
        }
    }

    pub async fn run(mut self, token: CancellationToken) -> anyhow::Result<()> {
        self.boot(&token).await;
        self.notifier.notify_ready();

        while !token.is_cancelled() {
            self.tick().await;

            let sleep = self.next_sleep();
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = token.cancelled() => break,
            }
        }

        tracing::info!("Stopping renderer");
        self.player.stop(STOP_GRACE).await;
        self.status.modify(|s| {
            s.playback_state = "stopped".into();
            s.renderer_running = false;
        });
        Ok(())
    }

    /// Decide and execute the boot plan before entering the main loop.
    async fn boot(&mut self, token: &CancellationToken) {
        let cfg = self.config.snapshot();
        let now = Utc::now();
        let plan = self.sync.boot_plan(&cfg, now);
        self.publish_sync_status();

        match plan {
            BootPlan::Immediate => {}
            BootPlan::PlayThenResync { anchor } => {
                tracing::info!(
                    "Booted in prep window; playing now, cycle resets at {}",
                    anchor
                );
                sync::run_ntp_command(&cfg.sync_ntp_command).await;
            }
            BootPlan::WaitUntilAnchor { anchor } => {
                tracing::info!("Booted in prep window; holding playback until {}", anchor);
                sync::run_ntp_command(&cfg.sync_ntp_command).await;
                self.status.modify(|s| s.playback_state = "waiting_anchor".into());
                let wait = (anchor - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        self.sync.anchor_reached(Utc::now());
                        self.publish_sync_status();
                    }
                    _ = token.cancelled() => return,
                }
            }
        }

        if let Err(e) = self.player.ensure_running().await {
            // The loop keeps retrying; boot does not fail on a missing
            // renderer binary because the config may be fixed live.
            tracing::error!("Renderer failed to start: {}", e);
            self.status
                .modify(|s| s.last_render_error = Some(e.to_string()));
        }
    }

    /// One pass over everything that may have come due.
    async fn tick(&mut self) {
        self.absorb_playlist_change().await;
        self.handle_checkpoints().await;
        self.advance_if_due().await;
        self.watchdog_if_due().await;
        self.publish_playback_status();
    }

    /// Pick up a newly published playlist. The item on screen finishes its
    /// exposure; alignment to the shared timeline happens at the next item
    /// boundary or sync checkpoint, so a mid-item manifest change never
    /// causes a visible jump.
    async fn absorb_playlist_change(&mut self) {
        let (playlist, version) = self.playlist.snapshot();
        if version == self.seen_version {
            return;
        }
        self.seen_version = version;
        tracing::info!(
            "Playlist v{} active: {} item(s), cycle {}ms",
            version,
            playlist.len(),
            playlist.cycle_total_ms
        );

        self.cooldown.retain(|path, _| {
            playlist.items.iter().any(|item| &item.path == path)
        });

        if playlist.is_empty() {
            self.session = None;
            return;
        }
        if let Some(session) = &self.session {
            // Finish the current item if the new playlist still carries it;
            // otherwise replace it at the canonical position right away.
            let still_there = playlist.items.iter().any(|i| i.path == session.item.path);
            if still_there {
                return;
            }
        } else if self.sync.mode() == SyncMode::AwaitingAnchor {
            return;
        }
        self.start_fresh(&playlist).await;
    }

    async fn handle_checkpoints(&mut self) {
        let now = Utc::now();
        while let Some(reason) = self.sync.due_checkpoint(now) {
            let (playlist, _) = self.playlist.snapshot();
            tracing::info!("Sync checkpoint: {}", reason.as_str());
            self.status.modify(|s| {
                s.sync_last_check = Some(now);
                s.sync_checkpoint_reason = Some(reason.as_str().to_string());
            });
            if playlist.is_empty() {
                continue;
            }
            match reason {
                CheckpointReason::DailyZero => {
                    // The anchor just passed: every device restarts the
                    // cycle from the top at the same instant.
                    self.sync.take_force_daily_zero();
                    self.play_item(&playlist, 0, 0).await;
                    self.status
                        .modify(|s| s.sync_last_action = Some("daily_zero".into()));
                }
                CheckpointReason::BootHardCheck | CheckpointReason::UtcCheckpoint => {
                    self.checkpoint_drift(&playlist, reason).await;
                }
            }
        }
    }

    /// Measure drift against the canonical position and act on it.
    async fn checkpoint_drift(&mut self, playlist: &Arc<Playlist>, reason: CheckpointReason) {
        let Some(target) = sync::position_for(Utc::now(), &playlist.durations_ms()) else {
            return;
        };
        let current_ms = match &self.session {
            Some(session) => session.cycle_pos_ms(playlist),
            // Nothing on screen at a checkpoint: treat as maximal drift.
            None => {
                self.play_item(playlist, target.index, target.offset_ms).await;
                self.status
                    .modify(|s| s.sync_last_action = Some("hard_resync".into()));
                return;
            }
        };
        let drift = sync::signed_drift_ms(target.cycle_pos_ms, current_ms, target.cycle_total_ms);
        let action = self.sync.evaluate_drift(drift);
        tracing::info!(
            "Drift at {}: {}ms ({:?})",
            reason.as_str(),
            drift,
            action
        );
        self.status.modify(|s| {
            s.sync_drift_ms = Some(drift);
            s.sync_anchor_utc = Some(target.anchor);
            s.sync_cycle_ms = Some(target.cycle_total_ms);
        });
        match action {
            DriftAction::Hard => {
                self.play_item(playlist, target.index, target.offset_ms).await;
                self.status
                    .modify(|s| s.sync_last_action = Some("hard_resync".into()));
            }
            DriftAction::Soft => {
                self.status
                    .modify(|s| s.sync_last_action = Some("soft_pending".into()));
            }
            DriftAction::None => {
                self.status
                    .modify(|s| s.sync_last_action = Some("in_sync".into()));
            }
        }
    }

    /// Start (or continue) playback at an item boundary.
    async fn advance_if_due(&mut self) {
        if self.sync.mode() == SyncMode::AwaitingAnchor {
            return;
        }
        let (playlist, _) = self.playlist.snapshot();
        if playlist.is_empty() {
            return;
        }

        match &self.session {
            None => {
                // Cold start or recovery from an all-blocked playlist.
                self.start_fresh(&playlist).await;
            }
            Some(session) if session.is_due() => {
                if self.sync.take_force_daily_zero() {
                    self.play_item(&playlist, 0, 0).await;
                } else if self.sync.take_pending_soft() {
                    // Deferred correction: realign to the wall clock at the
                    // boundary, invisible to the viewer.
                    tracing::info!("Applying soft sync correction at item boundary");
                    self.start_at_wall_clock(&playlist).await;
                    self.status
                        .modify(|s| s.sync_last_action = Some("soft_applied".into()));
                } else {
                    let next = (session.index + 1) % playlist.len().max(1);
                    self.play_item(&playlist, next, 0).await;
                }
            }
            Some(_) => {}
        }
    }

    /// Start with no session on screen. The wait-until-anchor boot lands
    /// here with the forced zero still set; it must be consumed by this
    /// first start, not left to replay item 0 at the first boundary.
    async fn start_fresh(&mut self, playlist: &Arc<Playlist>) {
        if self.sync.take_force_daily_zero() {
            self.play_item(playlist, 0, 0).await;
        } else {
            self.start_at_wall_clock(playlist).await;
        }
    }

    /// Load whatever the shared timeline says should be on screen now.
    async fn start_at_wall_clock(&mut self, playlist: &Arc<Playlist>) {
        if let Some(pos) = sync::position_for(Utc::now(), &playlist.durations_ms()) {
            self.play_item(playlist, pos.index, pos.offset_ms).await;
        }
    }

    /// Load the item at `index`, skipping cooldown-blocked entries. If every
    /// candidate is blocked the screen is flagged at risk and the session
    /// cleared; the next pass retries once cooldowns expire.
    async fn play_item(&mut self, playlist: &Arc<Playlist>, index: usize, offset_ms: i64) {
        if playlist.is_empty() {
            self.session = None;
            return;
        }
        if self.player.ensure_running().await.is_err() {
            self.status.modify(|s| {
                s.black_screen_risk = Some("renderer unavailable".into());
                s.renderer_running = false;
            });
            self.session = None;
            return;
        }

        let now = Instant::now();
        self.cooldown.retain(|_, deadline| *deadline > now);
        let cooldown = Duration::from_secs(
            self.config.snapshot().media_load_retry_cooldown_sec.max(1),
        );

        let len = playlist.len();
        let mut offset_ms = offset_ms;
        for step in 0..len {
            let candidate = (index + step) % len;
            let item = &playlist.items[candidate];
            if self.cooldown.contains_key(&item.path) {
                offset_ms = 0; // offset only applies to the scheduled item
                continue;
            }
            match self.load_item(item, offset_ms).await {
                Ok(()) => {
                    let is_image = cache::is_image_path(&item.path);
                    self.session = Some(PlaybackSession {
                        index: candidate,
                        item: item.clone(),
                        start_offset_ms: offset_ms,
                        started_at: Instant::now(),
                        generation: self.player.generation(),
                        is_image,
                    });
                    self.probe.reset();
                    self.cache.index().touch(
                        &item.path,
                        &item.url,
                        item.exposure_ms,
                        (&item.campaign_id, &item.campaign_name),
                    );
                    self.status.modify(|s| s.black_screen_risk = None);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to show {}: {}; cooling down for {}s",
                        item.path.display(),
                        e,
                        cooldown.as_secs()
                    );
                    self.status
                        .modify(|s| s.last_render_error = Some(e.to_string()));
                    self.cooldown.insert(item.path.clone(), now + cooldown);
                    offset_ms = 0;
                }
            }
        }

        tracing::error!("Every playlist item is blocked; screen is at risk");
        self.status.modify(|s| {
            s.black_screen_risk = Some("all media blocked by load failures".into());
        });
        self.session = None;
    }

    /// One load attempt: replace the file on screen and seek videos to the
    /// requested offset. A failed attempt gets a single renderer restart
    /// before giving up on the item.
    async fn load_item(&mut self, item: &MediaItem, offset_ms: i64) -> Result<(), crate::player::PlayerError> {
        let result = self.try_load(item, offset_ms).await;
        if result.is_ok() {
            return Ok(());
        }
        tracing::warn!("Load failed, restarting renderer and retrying once");
        self.player.restart().await?;
        self.try_load(item, offset_ms).await
    }

    async fn try_load(&mut self, item: &MediaItem, offset_ms: i64) -> Result<(), crate::player::PlayerError> {
        self.player.loadfile(&item.path).await?;
        if offset_ms > 500 && !cache::is_image_path(&item.path) {
            self.player
                .seek_absolute(offset_ms as f64 / 1000.0)
                .await?;
        }
        Ok(())
    }

    /// Renderer health: process liveness, control-channel liveness, stalled
    /// video and path mismatch. Any confirmed failure restarts the renderer
    /// and reloads the canonical item.
    async fn watchdog_if_due(&mut self) {
        if Instant::now() < self.next_watchdog {
            return;
        }
        let cfg = self.config.snapshot();
        self.next_watchdog =
            Instant::now() + Duration::from_secs(cfg.watchdog_interval_sec.max(1));
        self.notifier.notify_watchdog();

        if self.sync.mode() == SyncMode::AwaitingAnchor {
            return;
        }

        if !self.player.is_alive() {
            if self.session.is_some() || !self.playlist.snapshot().0.is_empty() {
                tracing::warn!("Renderer process died, recovering");
                self.recover().await;
            }
            return;
        }

        let healthy = match self.player.ping().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Renderer not responding on control channel: {}", e);
                false
            }
        };
        if !healthy {
            self.recover().await;
            return;
        }
        self.status.modify(|s| {
            s.renderer_running = true;
            s.renderer_last_ok = Some(Utc::now());
        });

        let (expected, generation, is_image) = match &self.session {
            Some(s) => (s.item.path.clone(), s.generation, s.is_image),
            None => return,
        };
        if generation != self.player.generation() {
            // Renderer restarted underneath the session.
            self.recover().await;
            return;
        }

        // Path mismatch: the renderer shows something else (or nothing) for
        // longer than the grace period.
        let stall_limit = Duration::from_secs(cfg.playback_stall_sec.max(1));
        let mismatch_limit = Duration::from_secs(cfg.playback_mismatch_sec.max(1));
        match self.player.current_path().await {
            Ok(current) => {
                let matches = current.as_deref() == Some(expected.as_path());
                if matches {
                    self.probe.mismatch_since = None;
                } else {
                    let since = *self.probe.mismatch_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= mismatch_limit {
                        tracing::warn!(
                            "Renderer shows {:?}, expected {}; reloading",
                            current,
                            expected.display()
                        );
                        self.recover().await;
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to query current path: {}", e);
                self.recover().await;
                return;
            }
        }

        // Stall: a video whose time-pos stops advancing.
        if !is_image {
            match self.player.time_pos().await {
                Ok(Some(pos)) => {
                    let moved = self
                        .probe
                        .last_time_pos
                        .map_or(true, |last| (pos - last).abs() > 0.01);
                    self.probe.last_time_pos = Some(pos);
                    if moved {
                        self.probe.stalled_since = None;
                    } else {
                        let since = *self.probe.stalled_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= stall_limit {
                            tracing::warn!("Video stalled at {:.2}s, recovering", pos);
                            self.recover().await;
                        }
                    }
                }
                Ok(None) => {
                    // No position while a video should be playing counts
                    // toward the mismatch clock, not an instant restart.
                    self.probe.mismatch_since.get_or_insert_with(Instant::now);
                }
                Err(e) => {
                    tracing::warn!("Failed to query playback position: {}", e);
                    self.recover().await;
                }
            }
        }
    }

    /// Restart the renderer if needed and put the canonical item back on
    /// screen at the wall-clock position.
    async fn recover(&mut self) {
        self.telemetry
            .emit("healthcheck", Some("renderer restarted by watchdog".into()));
        if let Err(e) = self.player.restart().await {
            tracing::error!("Renderer restart failed: {}", e);
            self.status.modify(|s| {
                s.renderer_running = false;
                s.black_screen_risk = Some("renderer restart failed".into());
                s.last_render_error = Some(e.to_string());
            });
            self.session = None;
            return;
        }
        self.probe.reset();
        self.session = None;
        let (playlist, _) = self.playlist.snapshot();
        if !playlist.is_empty() {
            self.start_at_wall_clock(&playlist).await;
        }
    }

    fn publish_sync_status(&self) {
        let mode = if !self.sync.enabled {
            "disabled"
        } else {
            match self.sync.mode() {
                SyncMode::Normal => "normal",
                SyncMode::BootPrepWindow => "boot_prep_window",
                SyncMode::AwaitingAnchor => "awaiting_anchor",
            }
        };
        let next_checkpoint = self.sync.next_checkpoint_at();
        let soft_pending = self.sync.has_pending_soft();
        self.status.modify(|s| {
            s.sync_mode = mode.into();
            s.sync_next_checkpoint = next_checkpoint;
            s.sync_soft_pending = soft_pending;
        });
    }

    fn publish_playback_status(&self) {
        let (playlist, _) = self.playlist.snapshot();
        let session = self.session.as_ref();
        let current = session.map(|s| ItemStatus::from_item(&s.item));
        let next = session.and_then(|s| {
            if playlist.is_empty() {
                return None;
            }
            playlist
                .items
                .get((s.index + 1) % playlist.len())
                .map(ItemStatus::from_item)
        });
        let state = if self.sync.mode() == SyncMode::AwaitingAnchor {
            "waiting_anchor"
        } else if session.is_some() {
            "playing"
        } else if playlist.is_empty() {
            "idle_no_content"
        } else {
            "recovering"
        };
        let index = session.map(|s| s.index);
        let blocked = self.cooldown.len();
        self.status.modify(|s| {
            s.playback_state = state.into();
            s.current_index = index;
            s.current_item = current;
            s.next_item = next;
            s.blocked_media_count = blocked;
        });
        self.notifier.notify_status(&match index {
            Some(i) => format!("{} ({}/{})", state, i + 1, playlist.len()),
            None => state.to_string(),
        });
        self.publish_sync_status();
    }

    /// Earliest of: item boundary, watchdog tick, sync deadline.
    fn next_sleep(&self) -> Duration {
        let mut sleep = IDLE_SLEEP;
        if let Some(session) = &self.session {
            sleep = sleep.min(session.remaining());
        }
        sleep = sleep.min(self.next_watchdog.saturating_duration_since(Instant::now()));
        if let Some(d) = self.sync.next_deadline(Utc::now()) {
            sleep = sleep.min(d);
        }
        sleep.max(MIN_SLEEP)
    }
}
