use std::path::PathBuf;

use thiserror::Error;

/// Errors from the renderer's JSON IPC control channel.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to connect to control socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("control socket i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("control channel closed by renderer")]
    Closed,

    #[error("control request timed out")]
    Timeout,

    #[error("renderer rejected command: {0}")]
    Rejected(String),

    #[error("malformed control response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("control channel is not available on this platform")]
    Unsupported,
}

/// Errors from managing the renderer process itself.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("failed to spawn renderer '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Ipc(#[from] IpcError),
}
