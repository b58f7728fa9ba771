//! Wall-clock playback synchronization.
//!
//! Every device computes its place in the repeating playlist cycle from UTC
//! alone: elapsed time since the most recent daily anchor (00:05:00 UTC),
//! modulo the cycle length. Devices that agree on UTC therefore agree on
//! the current item without ever talking to each other. The engine also
//! owns the boot prep-window behavior and the three-tier drift policy.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use tokio::time::Instant;

use crate::config::{Config, SyncPrepMode};

const SECONDS_PER_DAY: i64 = 24 * 3600;
/// Daily anchor: 00:05:00 UTC.
const ANCHOR_SEC_UTC: i64 = 5 * 60;
/// Prep window opens at 23:58:00 UTC (inclusive) and closes at the anchor
/// (exclusive).
const PREP_WINDOW_START_SEC_UTC: i64 = 23 * 3600 + 58 * 60;

/// A resolved position within the playback cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclePosition {
    pub index: usize,
    pub offset_ms: i64,
    pub cycle_pos_ms: i64,
    pub cycle_total_ms: i64,
    pub anchor: DateTime<Utc>,
}

/// What a drift measurement demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftAction {
    /// Below the soft threshold; leave playback alone.
    None,
    /// Correct at the next item boundary, no visible jump.
    Soft,
    /// Seek to the correct position immediately, even mid-item.
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Normal,
    BootPrepWindow,
    AwaitingAnchor,
}

/// How playback should begin, decided once at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPlan {
    /// Outside the prep window: start at the computed position.
    Immediate,
    /// Inside the window, `play_then_resync`: play now, force cycle zero at
    /// the anchor instant.
    PlayThenResync { anchor: DateTime<Utc> },
    /// Inside the window, `wait_until_anchor`: hold playback, start at the
    /// anchor with offset zero.
    WaitUntilAnchor { anchor: DateTime<Utc> },
}

/// Why a checkpoint fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointReason {
    /// The daily anchor passed while playing through the prep window.
    DailyZero,
    /// One-shot hard verification a few minutes after boot.
    BootHardCheck,
    /// Regular wall-clock-aligned checkpoint.
    UtcCheckpoint,
}

impl CheckpointReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointReason::DailyZero => "daily_zero",
            CheckpointReason::BootHardCheck => "boot_hard_check",
            CheckpointReason::UtcCheckpoint => "utc_checkpoint",
        }
    }
}

fn seconds_since_midnight_utc(now: DateTime<Utc>) -> i64 {
    i64::from(now.time().num_seconds_from_midnight())
}

/// Most recent anchor instant at or before `now`.
pub fn anchor_instant(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid")
        .and_utc();
    let anchor = midnight + ChronoDuration::seconds(ANCHOR_SEC_UTC);
    if now < anchor {
        anchor - ChronoDuration::seconds(SECONDS_PER_DAY)
    } else {
        anchor
    }
}

/// First anchor instant strictly after `now` (or at `now` exactly).
pub fn next_anchor_instant(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid")
        .and_utc();
    let anchor = midnight + ChronoDuration::seconds(ANCHOR_SEC_UTC);
    if now < anchor {
        anchor
    } else {
        anchor + ChronoDuration::seconds(SECONDS_PER_DAY)
    }
}

/// Whether `now` falls in the boot prep window. Inclusive at the window
/// start, exclusive at the anchor.
pub fn in_prep_window(now: DateTime<Utc>) -> bool {
    let sec = seconds_since_midnight_utc(now);
    sec >= PREP_WINDOW_START_SEC_UTC || sec < ANCHOR_SEC_UTC
}

/// Canonical cycle position for `now`, or `None` for an empty timeline.
///
/// The returned `cycle_pos_ms` is always in `[0, cycle_total_ms)`.
pub fn position_for(now: DateTime<Utc>, durations_ms: &[i64]) -> Option<CyclePosition> {
    if durations_ms.is_empty() {
        return None;
    }
    let cycle_total_ms = durations_ms.iter().sum::<i64>().max(1);
    let anchor = anchor_instant(now);
    let elapsed_ms = (now - anchor).num_milliseconds().rem_euclid(cycle_total_ms);

    let mut cursor = 0i64;
    for (index, &duration) in durations_ms.iter().enumerate() {
        let next_cursor = cursor + duration;
        if elapsed_ms < next_cursor {
            return Some(CyclePosition {
                index,
                offset_ms: elapsed_ms - cursor,
                cycle_pos_ms: elapsed_ms,
                cycle_total_ms,
                anchor,
            });
        }
        cursor = next_cursor;
    }

    // Unreachable for well-formed durations; clamp to the last instant.
    let last = durations_ms.len() - 1;
    Some(CyclePosition {
        index: last,
        offset_ms: (durations_ms[last] - 1).max(0),
        cycle_pos_ms: (cycle_total_ms - 1).max(0),
        cycle_total_ms,
        anchor,
    })
}

/// Shortest signed distance from `current_ms` to `target_ms` on the cycle
/// ring. Positive means playback is behind the canonical position.
pub fn signed_drift_ms(target_ms: i64, current_ms: i64, cycle_total_ms: i64) -> i64 {
    if cycle_total_ms <= 0 {
        return 0;
    }
    let half = cycle_total_ms / 2;
    (target_ms - current_ms + half).rem_euclid(cycle_total_ms) - half
}

/// Classify a drift measurement against the soft and hard thresholds.
pub fn classify_drift(drift_ms: i64, soft_threshold_ms: i64, hard_threshold_ms: i64) -> DriftAction {
    let soft = soft_threshold_ms.max(0);
    let hard = hard_threshold_ms.max(soft);
    let magnitude = drift_ms.abs();
    if magnitude < soft {
        DriftAction::None
    } else if magnitude >= hard {
        DriftAction::Hard
    } else {
        DriftAction::Soft
    }
}

/// Next checkpoint instant, aligned to the interval grid on the UTC epoch
/// so all devices check at the same moments.
pub fn next_checkpoint(now: DateTime<Utc>, interval_sec: u64) -> DateTime<Utc> {
    let interval = if interval_sec == 0 { 3600 } else { interval_sec as i64 };
    let ts = now.timestamp();
    DateTime::from_timestamp((ts / interval + 1) * interval, 0).expect("valid checkpoint instant")
}

/// Run the configured clock-correction command (e.g. `chronyc -a makestep`)
/// without letting it block or fail the caller.
pub async fn run_ntp_command(command: &str) {
    let command = command.trim();
    if command.is_empty() {
        tracing::info!("No sync_ntp_command configured; trusting system NTP");
        return;
    }
    let mut cmd = if cfg!(windows) {
        let mut c = tokio::process::Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = tokio::process::Command::new("sh");
        c.args(["-c", command]);
        c
    };
    cmd.stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    let run = async {
        match cmd.status().await {
            Ok(status) if status.success() => {
                tracing::info!("Clock correction command succeeded");
            }
            Ok(status) => {
                tracing::warn!("Clock correction command exited with {}", status);
            }
            Err(e) => {
                tracing::warn!("Clock correction command failed to run: {}", e);
            }
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(20), run)
        .await
        .is_err()
    {
        tracing::warn!("Clock correction command timed out");
    }
}

/// Drift-correction state machine driven by the playback supervisor.
///
/// The supervisor asks [`SyncEngine::due_checkpoint`] whenever it wakes,
/// measures drift at checkpoints, and applies soft corrections at item
/// boundaries via [`SyncEngine::take_pending_soft`].
pub struct SyncEngine {
    pub enabled: bool,
    soft_threshold_ms: i64,
    hard_threshold_ms: i64,
    checkpoint_interval_sec: u64,
    mode: SyncMode,
    pending_soft: bool,
    /// Anchor instant at which the cycle must be forced back to zero
    /// (play_then_resync boot only).
    pending_daily_zero: Option<DateTime<Utc>>,
    boot_hard_check_at: Option<Instant>,
    next_checkpoint_at: Option<DateTime<Utc>>,
    /// Set when playback reached the anchor in `wait_until_anchor` mode and
    /// the first item must start at index 0 / offset 0.
    force_daily_zero: bool,
}

impl SyncEngine {
    pub fn new(config: &Config, now: DateTime<Utc>) -> Self {
        let mut engine = Self {
            enabled: config.sync_enabled,
            soft_threshold_ms: config.sync_drift_threshold_ms,
            hard_threshold_ms: config.sync_hard_resync_ms,
            checkpoint_interval_sec: config.sync_checkpoint_interval_sec,
            mode: SyncMode::Normal,
            pending_soft: false,
            pending_daily_zero: None,
            boot_hard_check_at: None,
            next_checkpoint_at: None,
            force_daily_zero: false,
        };
        if engine.enabled {
            if config.sync_boot_hard_check_sec > 0 {
                engine.boot_hard_check_at = Some(
                    Instant::now()
                        + std::time::Duration::from_secs(config.sync_boot_hard_check_sec),
                );
            }
            engine.next_checkpoint_at = Some(next_checkpoint(now, engine.checkpoint_interval_sec));
        }
        engine
    }

    /// Decide the boot behavior and enter the corresponding mode.
    pub fn boot_plan(&mut self, config: &Config, now: DateTime<Utc>) -> BootPlan {
        if !self.enabled || !in_prep_window(now) {
            self.mode = SyncMode::Normal;
            return BootPlan::Immediate;
        }
        let anchor = next_anchor_instant(now);
        match config.sync_prep_mode {
            SyncPrepMode::PlayThenResync => {
                self.mode = SyncMode::BootPrepWindow;
                self.pending_daily_zero = Some(anchor);
                BootPlan::PlayThenResync { anchor }
            }
            SyncPrepMode::WaitUntilAnchor => {
                self.mode = SyncMode::AwaitingAnchor;
                BootPlan::WaitUntilAnchor { anchor }
            }
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Called when the awaited anchor instant arrives (either prep mode).
    /// Always exits the window into `Normal` and re-arms the grid
    /// checkpoint forward, so a slot that passed during the window is not
    /// fired late.
    pub fn anchor_reached(&mut self, now: DateTime<Utc>) {
        self.mode = SyncMode::Normal;
        self.pending_daily_zero = None;
        self.pending_soft = false;
        self.force_daily_zero = true;
        if self.enabled {
            self.next_checkpoint_at = Some(next_checkpoint(now, self.checkpoint_interval_sec));
        }
    }

    /// Whether the next item start must be forced to index 0 / offset 0.
    pub fn take_force_daily_zero(&mut self) -> bool {
        std::mem::take(&mut self.force_daily_zero)
    }

    /// Earliest pending deadline as a wall-clock instant, used by the
    /// supervisor to size its sleep.
    pub fn next_deadline(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        if !self.enabled {
            return None;
        }
        let mut earliest: Option<std::time::Duration> = None;
        let mut consider = |d: std::time::Duration| {
            earliest = Some(match earliest {
                Some(e) => e.min(d),
                None => d,
            });
        };
        if let Some(at) = self.pending_daily_zero {
            consider((at - now).to_std().unwrap_or_default());
        }
        // Gated checkpoints are not wakeup-worthy until the window exits.
        if self.mode == SyncMode::Normal {
            if let Some(at) = self.boot_hard_check_at {
                consider(at.saturating_duration_since(Instant::now()));
            }
            if let Some(at) = self.next_checkpoint_at {
                consider((at - now).to_std().unwrap_or_default());
            }
        }
        earliest
    }

    /// Consume the highest-priority due checkpoint, re-arming the interval
    /// timer when it fires.
    pub fn due_checkpoint(&mut self, now: DateTime<Utc>) -> Option<CheckpointReason> {
        if !self.enabled {
            return None;
        }
        if let Some(at) = self.pending_daily_zero {
            if now >= at {
                self.pending_daily_zero = None;
                self.anchor_reached(now);
                return Some(CheckpointReason::DailyZero);
            }
        }
        // Drift checks run only once the boot window is behind us.
        if self.mode != SyncMode::Normal {
            return None;
        }
        if let Some(at) = self.boot_hard_check_at {
            if Instant::now() >= at {
                self.boot_hard_check_at = None;
                return Some(CheckpointReason::BootHardCheck);
            }
        }
        if let Some(at) = self.next_checkpoint_at {
            if now >= at {
                self.next_checkpoint_at = Some(next_checkpoint(now, self.checkpoint_interval_sec));
                return Some(CheckpointReason::UtcCheckpoint);
            }
        }
        None
    }

    pub fn next_checkpoint_at(&self) -> Option<DateTime<Utc>> {
        self.next_checkpoint_at
    }

    /// Evaluate drift at a checkpoint. `Soft` arms a deferred correction;
    /// `Hard` is the caller's cue to reseek immediately.
    pub fn evaluate_drift(&mut self, drift_ms: i64) -> DriftAction {
        let action = classify_drift(drift_ms, self.soft_threshold_ms, self.hard_threshold_ms);
        match action {
            DriftAction::Soft => self.pending_soft = true,
            DriftAction::Hard => self.pending_soft = false,
            DriftAction::None => {}
        }
        action
    }

    /// At an item boundary: consume a pending soft correction, if any.
    pub fn take_pending_soft(&mut self) -> bool {
        std::mem::take(&mut self.pending_soft)
    }

    pub fn has_pending_soft(&self) -> bool {
        self.pending_soft
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn anchor_is_most_recent_00_05() {
        let now = utc(2025, 6, 10, 12, 0, 0);
        assert_eq!(anchor_instant(now), utc(2025, 6, 10, 0, 5, 0));

        // Before today's anchor: yesterday's applies.
        let early = utc(2025, 6, 10, 0, 3, 0);
        assert_eq!(anchor_instant(early), utc(2025, 6, 9, 0, 5, 0));

        // Exactly at the anchor it is already in effect.
        let at = utc(2025, 6, 10, 0, 5, 0);
        assert_eq!(anchor_instant(at), at);
    }

    #[test]
    fn prep_window_is_inclusive_start_exclusive_end() {
        assert!(in_prep_window(utc(2025, 6, 10, 23, 58, 0)));
        assert!(in_prep_window(utc(2025, 6, 10, 23, 59, 30)));
        assert!(in_prep_window(utc(2025, 6, 11, 0, 4, 59)));
        assert!(!in_prep_window(utc(2025, 6, 11, 0, 5, 0)));
        assert!(!in_prep_window(utc(2025, 6, 10, 23, 57, 59)));
        assert!(!in_prep_window(utc(2025, 6, 10, 12, 0, 0)));
    }

    #[test]
    fn position_is_always_within_cycle() {
        let durations = vec![10_000i64, 5_000, 15_000];
        let base = utc(2025, 6, 10, 0, 5, 0);
        for offset_sec in [0i64, 1, 9, 10, 14, 29, 30, 31, 86_399, 86_400] {
            let pos = position_for(base + ChronoDuration::seconds(offset_sec), &durations).unwrap();
            assert!(pos.cycle_pos_ms >= 0 && pos.cycle_pos_ms < pos.cycle_total_ms);
            assert!(pos.offset_ms >= 0 && pos.offset_ms < durations[pos.index]);
        }
    }

    #[test]
    fn position_walks_item_boundaries() {
        let durations = vec![10_000i64, 5_000, 15_000];
        let anchor = utc(2025, 6, 10, 0, 5, 0);

        let p0 = position_for(anchor, &durations).unwrap();
        assert_eq!((p0.index, p0.offset_ms), (0, 0));

        let p1 = position_for(anchor + ChronoDuration::seconds(10), &durations).unwrap();
        assert_eq!((p1.index, p1.offset_ms), (1, 0));

        let p2 = position_for(anchor + ChronoDuration::seconds(14), &durations).unwrap();
        assert_eq!((p2.index, p2.offset_ms), (1, 4_000));

        let p3 = position_for(anchor + ChronoDuration::seconds(16), &durations).unwrap();
        assert_eq!((p3.index, p3.offset_ms), (2, 1_000));

        // Full wrap: 30s cycle.
        let p4 = position_for(anchor + ChronoDuration::seconds(30), &durations).unwrap();
        assert_eq!((p4.index, p4.offset_ms), (0, 0));
    }

    #[test]
    fn position_is_continuous_across_wraparound() {
        let durations = vec![7_000i64, 3_000];
        let anchor = utc(2025, 6, 10, 0, 5, 0);
        let just_before = anchor + ChronoDuration::milliseconds(9_999);
        let just_after = anchor + ChronoDuration::milliseconds(10_001);
        assert_eq!(
            position_for(just_before, &durations).unwrap().cycle_pos_ms,
            9_999
        );
        assert_eq!(
            position_for(just_after, &durations).unwrap().cycle_pos_ms,
            1
        );
    }

    #[test]
    fn empty_timeline_has_no_position() {
        assert!(position_for(utc(2025, 6, 10, 12, 0, 0), &[]).is_none());
    }

    #[test]
    fn drift_uses_shortest_ring_distance() {
        assert_eq!(signed_drift_ms(100, 50, 10_000), 50);
        assert_eq!(signed_drift_ms(50, 100, 10_000), -50);
        // Wrap: target just past zero, playback just before the end.
        assert_eq!(signed_drift_ms(100, 9_900, 10_000), 200);
        assert_eq!(signed_drift_ms(9_900, 100, 10_000), -200);
        assert_eq!(signed_drift_ms(0, 0, 0), 0);
    }

    #[test]
    fn drift_tiers_match_policy() {
        assert_eq!(classify_drift(250, 300, 1200), DriftAction::None);
        assert_eq!(classify_drift(-250, 300, 1200), DriftAction::None);
        assert_eq!(classify_drift(700, 300, 1200), DriftAction::Soft);
        assert_eq!(classify_drift(-700, 300, 1200), DriftAction::Soft);
        assert_eq!(classify_drift(1500, 300, 1200), DriftAction::Hard);
        assert_eq!(classify_drift(1200, 300, 1200), DriftAction::Hard);
        assert_eq!(classify_drift(300, 300, 1200), DriftAction::Soft);
    }

    #[test]
    fn checkpoints_align_to_the_utc_grid() {
        let now = utc(2025, 6, 10, 12, 34, 56);
        assert_eq!(next_checkpoint(now, 3600), utc(2025, 6, 10, 13, 0, 0));
        // Exactly on the grid: the next slot, not the current one.
        assert_eq!(
            next_checkpoint(utc(2025, 6, 10, 13, 0, 0), 3600),
            utc(2025, 6, 10, 14, 0, 0)
        );
        // Zero interval falls back to hourly.
        assert_eq!(next_checkpoint(now, 0), utc(2025, 6, 10, 13, 0, 0));
    }

    #[test]
    fn boot_inside_window_play_then_resync() {
        let config = Config::default();
        let now = utc(2025, 6, 10, 23, 59, 30);
        let mut engine = SyncEngine::new(&config, now);
        match engine.boot_plan(&config, now) {
            BootPlan::PlayThenResync { anchor } => {
                assert_eq!(anchor, utc(2025, 6, 11, 0, 5, 0));
            }
            other => panic!("unexpected plan {:?}", other),
        }
        assert_eq!(engine.mode(), SyncMode::BootPrepWindow);

        // Anchor not reached yet: no checkpoint due, not even the 00:00
        // grid slot that passed inside the window.
        assert_eq!(engine.due_checkpoint(utc(2025, 6, 11, 0, 4, 59)), None);
        // At the anchor the daily zero fires and the window is exited.
        assert_eq!(
            engine.due_checkpoint(utc(2025, 6, 11, 0, 5, 0)),
            Some(CheckpointReason::DailyZero)
        );
        assert_eq!(engine.mode(), SyncMode::Normal);
        assert!(engine.take_force_daily_zero());
        assert!(!engine.take_force_daily_zero());
        // The grid checkpoint was re-armed forward, not fired late.
        assert_eq!(engine.due_checkpoint(utc(2025, 6, 11, 0, 5, 1)), None);
        assert_eq!(
            engine.next_checkpoint_at(),
            Some(utc(2025, 6, 11, 1, 0, 0))
        );
    }

    #[test]
    fn boot_inside_window_wait_until_anchor() {
        let mut config = Config::default();
        config.sync_prep_mode = SyncPrepMode::WaitUntilAnchor;
        let now = utc(2025, 6, 10, 23, 58, 0);
        let mut engine = SyncEngine::new(&config, now);
        match engine.boot_plan(&config, now) {
            BootPlan::WaitUntilAnchor { anchor } => {
                assert_eq!(anchor, utc(2025, 6, 11, 0, 5, 0));
            }
            other => panic!("unexpected plan {:?}", other),
        }
        assert_eq!(engine.mode(), SyncMode::AwaitingAnchor);
        engine.anchor_reached(utc(2025, 6, 11, 0, 5, 0));
        assert_eq!(engine.mode(), SyncMode::Normal);
        assert!(engine.take_force_daily_zero());
    }

    #[test]
    fn grid_checkpoints_hold_until_the_window_exits() {
        let mut config = Config::default();
        config.sync_prep_mode = SyncPrepMode::WaitUntilAnchor;
        let now = utc(2025, 6, 10, 23, 59, 30);
        let mut engine = SyncEngine::new(&config, now);
        engine.boot_plan(&config, now);

        // The 00:00 grid slot passes while still awaiting the anchor.
        assert_eq!(engine.due_checkpoint(utc(2025, 6, 11, 0, 0, 1)), None);

        engine.anchor_reached(utc(2025, 6, 11, 0, 5, 0));
        assert_eq!(engine.due_checkpoint(utc(2025, 6, 11, 0, 5, 1)), None);
        assert_eq!(
            engine.next_checkpoint_at(),
            Some(utc(2025, 6, 11, 1, 0, 0))
        );
    }

    #[test]
    fn boot_outside_window_is_immediate() {
        let config = Config::default();
        let now = utc(2025, 6, 10, 12, 0, 0);
        let mut engine = SyncEngine::new(&config, now);
        assert_eq!(engine.boot_plan(&config, now), BootPlan::Immediate);
        assert_eq!(engine.mode(), SyncMode::Normal);
    }

    #[test]
    fn soft_correction_is_deferred_until_taken() {
        let config = Config::default();
        let now = utc(2025, 6, 10, 12, 0, 0);
        let mut engine = SyncEngine::new(&config, now);
        assert_eq!(engine.evaluate_drift(700), DriftAction::Soft);
        assert!(engine.has_pending_soft());
        assert!(engine.take_pending_soft());
        assert!(!engine.has_pending_soft());
    }

    #[test]
    fn hard_correction_clears_pending_soft() {
        let config = Config::default();
        let now = utc(2025, 6, 10, 12, 0, 0);
        let mut engine = SyncEngine::new(&config, now);
        engine.evaluate_drift(700);
        assert_eq!(engine.evaluate_drift(1500), DriftAction::Hard);
        assert!(!engine.has_pending_soft());
    }

    #[test]
    fn interval_checkpoint_rearms() {
        let config = Config::default();
        let boot = utc(2025, 6, 10, 12, 30, 0);
        let mut engine = SyncEngine::new(&config, boot);
        engine.boot_plan(&config, boot);
        // Consume the one-shot boot hard check (armed on a monotonic clock,
        // not yet due in a fresh test process).
        assert_eq!(engine.due_checkpoint(utc(2025, 6, 10, 12, 59, 0)), None);
        assert_eq!(
            engine.due_checkpoint(utc(2025, 6, 10, 13, 0, 1)),
            Some(CheckpointReason::UtcCheckpoint)
        );
        assert_eq!(
            engine.next_checkpoint_at(),
            Some(utc(2025, 6, 10, 14, 0, 0))
        );
    }
}
