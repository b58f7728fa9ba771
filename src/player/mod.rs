//! External renderer process lifecycle.
//!
//! The renderer (mpv) is spawned idle and fullscreen with its JSON IPC
//! socket enabled; all content changes go through [`IpcChannel`]. The
//! supervisor owns exactly one [`Player`], so lifecycle transitions are
//! serialized by construction; the generation counter tells the
//! supervisor when a restart invalidated whatever was on screen.

pub mod error;
pub mod ipc;

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};

use crate::config::{Config, SharedConfig};

pub use error::{IpcError, PlayerError};
pub use ipc::IpcChannel;

const IPC_CONNECT_ATTEMPTS: u32 = 40;
const IPC_CONNECT_DELAY: Duration = Duration::from_millis(250);
/// Restart requests inside this window after a completed restart are
/// treated as the same incident and ignored.
const RESTART_COALESCE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
}

/// Renderer command line for the configured output.
pub fn build_player_args(config: &Config) -> Vec<String> {
    let mut args = vec![
        "--idle=yes".to_string(),
        "--force-window=yes".to_string(),
        "--fullscreen".to_string(),
        "--no-osc".to_string(),
        "--no-osd-bar".to_string(),
        "--osd-level=0".to_string(),
        "--no-input-default-bindings".to_string(),
        "--keep-open=no".to_string(),
        "--loop-file=no".to_string(),
        // Images stay up until the supervisor advances.
        "--image-display-duration=inf".to_string(),
        "--no-terminal".to_string(),
        "--really-quiet".to_string(),
        format!("--input-ipc-server={}", config.ipc_path.display()),
    ];
    if !config.hwdec.is_empty() {
        args.push(format!("--hwdec={}", config.hwdec));
    }
    if config.mute {
        args.push("--mute=yes".to_string());
    }
    if config.rotation_deg != 0 {
        args.push(format!("--video-rotate={}", config.rotation_deg));
    }
    args
}

pub struct Player {
    config: SharedConfig,
    child: Option<Child>,
    ipc: Option<IpcChannel>,
    state: ProcessState,
    generation: u64,
    last_restart: Option<Instant>,
}

impl Player {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            child: None,
            ipc: None,
            state: ProcessState::Stopped,
            generation: 0,
            last_restart: None,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Monotonic count of successful spawns. A changed generation means
    /// the screen content from before the change is gone.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the renderer process is still alive (without blocking).
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(exit)) => {
                    tracing::warn!("Renderer exited with {}", exit);
                    self.child = None;
                    self.ipc = None;
                    self.state = ProcessState::Stopped;
                    false
                }
                Err(e) => {
                    tracing::warn!("Failed to query renderer state: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    /// Spawn the renderer and connect the control channel if either is
    /// missing. Safe to call every watchdog tick.
    pub async fn ensure_running(&mut self) -> Result<(), PlayerError> {
        if self.is_alive() && self.ipc.is_some() {
            return Ok(());
        }
        if self.is_alive() {
            // Process is up but the channel dropped; reconnect only.
            self.ipc = Some(self.connect_ipc().await?);
            self.state = ProcessState::Running;
            return Ok(());
        }
        self.spawn().await
    }

    async fn spawn(&mut self) -> Result<(), PlayerError> {
        let cfg = self.config.snapshot();
        self.state = ProcessState::Starting;

        #[cfg(unix)]
        {
            // A stale socket from a dead renderer blocks the new one.
            let _ = std::fs::remove_file(&cfg.ipc_path);
        }

        tracing::info!("Spawning renderer: {}", cfg.player_path);
        let child = Command::new(&cfg.player_path)
            .args(build_player_args(&cfg))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                self.state = ProcessState::Stopped;
                PlayerError::Spawn {
                    path: cfg.player_path.clone(),
                    source,
                }
            })?;
        self.child = Some(child);

        match self.connect_ipc().await {
            Ok(channel) => {
                self.ipc = Some(channel);
                self.state = ProcessState::Running;
                self.generation += 1;
                tracing::info!("Renderer up (generation {})", self.generation);
                Ok(())
            }
            Err(e) => {
                self.kill().await;
                Err(e.into())
            }
        }
    }

    async fn connect_ipc(&mut self) -> Result<IpcChannel, IpcError> {
        let cfg = self.config.snapshot();
        let mut last = None;
        for _ in 0..IPC_CONNECT_ATTEMPTS {
            if !self.is_alive() {
                break;
            }
            match IpcChannel::connect(&cfg.ipc_path).await {
                Ok(channel) => return Ok(channel),
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(IPC_CONNECT_DELAY).await;
        }
        Err(last.unwrap_or(IpcError::Closed))
    }

    /// Kill and respawn. Requests arriving within the coalescing window of
    /// a finished restart are dropped, so one black-screen incident that
    /// trips several watchdog checks triggers one restart, not several.
    pub async fn restart(&mut self) -> Result<(), PlayerError> {
        if let Some(at) = self.last_restart {
            if at.elapsed() < RESTART_COALESCE_WINDOW {
                tracing::debug!("Restart request coalesced");
                return Ok(());
            }
        }
        tracing::warn!("Restarting renderer");
        self.stop(Duration::from_secs(2)).await;
        let result = self.spawn().await;
        self.last_restart = Some(Instant::now());
        result
    }

    /// Graceful stop: ask over IPC, wait, then kill.
    pub async fn stop(&mut self, grace: Duration) {
        if let Some(ipc) = self.ipc.as_mut() {
            let _ = ipc.quit().await;
        }
        self.ipc = None;
        if let Some(child) = self.child.as_mut() {
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                tracing::warn!("Renderer ignored quit, killing");
                self.kill().await;
            }
        }
        self.child = None;
        self.state = ProcessState::Stopped;
    }

    async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        self.ipc = None;
        self.state = ProcessState::Stopped;
    }

    fn channel(&mut self) -> Result<&mut IpcChannel, PlayerError> {
        self.ipc
            .as_mut()
            .ok_or(PlayerError::Ipc(IpcError::Closed))
    }

    /// On a closed channel the handle is dropped so the next
    /// `ensure_running` reconnects instead of erroring forever.
    fn note_result<T>(&mut self, result: Result<T, IpcError>) -> Result<T, PlayerError> {
        if matches!(result, Err(IpcError::Closed) | Err(IpcError::Io(_))) {
            self.ipc = None;
        }
        result.map_err(PlayerError::from)
    }

    pub async fn loadfile(&mut self, path: &Path) -> Result<(), PlayerError> {
        let result = self.channel()?.loadfile(path).await;
        self.note_result(result)
    }

    pub async fn seek_absolute(&mut self, seconds: f64) -> Result<(), PlayerError> {
        let result = self.channel()?.seek_absolute(seconds).await;
        self.note_result(result)
    }

    pub async fn time_pos(&mut self) -> Result<Option<f64>, PlayerError> {
        let result = self.channel()?.time_pos().await;
        self.note_result(result)
    }

    pub async fn current_path(&mut self) -> Result<Option<std::path::PathBuf>, PlayerError> {
        let result = self.channel()?.current_path().await;
        self.note_result(result)
    }

    pub async fn ping(&mut self) -> Result<bool, PlayerError> {
        let result = self.channel()?.ping().await;
        self.note_result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn args_reflect_output_config() {
        let config = Config {
            ipc_path: PathBuf::from("/tmp/r.sock"),
            rotation_deg: 90,
            mute: true,
            hwdec: "auto".into(),
            ..Config::default()
        };
        let args = build_player_args(&config);
        assert!(args.contains(&"--input-ipc-server=/tmp/r.sock".to_string()));
        assert!(args.contains(&"--video-rotate=90".to_string()));
        assert!(args.contains(&"--mute=yes".to_string()));
        assert!(args.contains(&"--hwdec=auto".to_string()));
        assert!(args.contains(&"--image-display-duration=inf".to_string()));
    }

    #[test]
    fn zero_rotation_adds_no_rotate_flag() {
        let args = build_player_args(&Config::default());
        assert!(!args.iter().any(|a| a.starts_with("--video-rotate")));
        assert!(!args.contains(&"--mute=yes".to_string()));
    }

    #[tokio::test]
    async fn commands_without_a_channel_fail_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();
        let config = SharedConfig::new(path.clone(), Config::load(&path).unwrap());

        let mut player = Player::new(config);
        assert_eq!(player.state(), ProcessState::Stopped);
        assert_eq!(player.generation(), 0);
        assert!(!player.is_alive());
        assert!(matches!(
            player.loadfile(Path::new("/media/a.mp4")).await,
            Err(PlayerError::Ipc(IpcError::Closed))
        ));
    }
}
