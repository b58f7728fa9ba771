//! JSON IPC client for the renderer's control socket.
//!
//! The protocol is line-delimited JSON over a unix socket: requests carry
//! a `request_id`, responses echo it back, and unsolicited event lines are
//! interleaved freely. Every request is bounded by a short timeout so a
//! wedged renderer can never stall the supervisor loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::error::IpcError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(unix)]
mod stream {
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::UnixStream;

    pub type Reader = OwnedReadHalf;
    pub type Writer = OwnedWriteHalf;

    pub async fn connect(path: &std::path::Path) -> std::io::Result<(Reader, Writer)> {
        let stream = UnixStream::connect(path).await?;
        Ok(stream.into_split())
    }
}

#[cfg(not(unix))]
mod stream {
    pub type Reader = tokio::io::DuplexStream;
    pub type Writer = tokio::io::DuplexStream;

    pub async fn connect(_path: &std::path::Path) -> std::io::Result<(Reader, Writer)> {
        Err(std::io::Error::other("unix sockets unavailable"))
    }
}

pub struct IpcChannel {
    reader: BufReader<stream::Reader>,
    writer: stream::Writer,
    next_request_id: u64,
}

impl IpcChannel {
    /// Connect once. The renderer creates the socket shortly after spawn,
    /// so callers retry this during startup.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        if cfg!(not(unix)) {
            return Err(IpcError::Unsupported);
        }
        let (reader, writer) =
            stream::connect(path)
                .await
                .map_err(|source| IpcError::Connect {
                    path: path.to_path_buf(),
                    source,
                })?;
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            next_request_id: 1,
        })
    }

    /// Send one command and wait for its matching response, skipping any
    /// event lines that arrive in between.
    async fn request(&mut self, command: Value) -> Result<Value, IpcError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let mut line = serde_json::to_string(&json!({
            "command": command,
            "request_id": request_id,
        }))?;
        line.push('\n');

        tokio::time::timeout(REQUEST_TIMEOUT, async {
            self.writer.write_all(line.as_bytes()).await?;
            loop {
                let mut response = String::new();
                let n = self.reader.read_line(&mut response).await?;
                if n == 0 {
                    return Err(IpcError::Closed);
                }
                let parsed: Value = match serde_json::from_str(response.trim()) {
                    Ok(v) => v,
                    // Garbage on the wire; keep reading for our response.
                    Err(_) => continue,
                };
                if parsed.get("request_id").and_then(Value::as_u64) != Some(request_id) {
                    continue; // event or a stale response
                }
                let error = parsed
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("missing error field");
                if error != "success" {
                    return Err(IpcError::Rejected(error.to_string()));
                }
                return Ok(parsed.get("data").cloned().unwrap_or(Value::Null));
            }
        })
        .await
        .map_err(|_| IpcError::Timeout)?
    }

    /// Replace whatever is on screen with `path`.
    pub async fn loadfile(&mut self, path: &Path) -> Result<(), IpcError> {
        self.request(json!(["loadfile", path.to_string_lossy(), "replace"]))
            .await
            .map(|_| ())
    }

    /// Exact absolute seek in seconds.
    pub async fn seek_absolute(&mut self, seconds: f64) -> Result<(), IpcError> {
        self.request(json!(["seek", seconds, "absolute+exact"]))
            .await
            .map(|_| ())
    }

    /// Playback position in seconds, `None` while no file is loaded.
    pub async fn time_pos(&mut self) -> Result<Option<f64>, IpcError> {
        match self.request(json!(["get_property", "time-pos"])).await {
            Ok(value) => Ok(value.as_f64()),
            Err(IpcError::Rejected(reason)) if reason.contains("unavailable") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Path of the file currently loaded, `None` when idle.
    pub async fn current_path(&mut self) -> Result<Option<PathBuf>, IpcError> {
        match self.request(json!(["get_property", "path"])).await {
            Ok(value) => Ok(value.as_str().map(PathBuf::from)),
            Err(IpcError::Rejected(reason)) if reason.contains("unavailable") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Liveness probe; `idle-active` exists in every renderer state.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let value = self.request(json!(["get_property", "idle-active"])).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Ask the renderer to exit. Failure is fine, the caller kills next.
    pub async fn quit(&mut self) -> Result<(), IpcError> {
        self.request(json!(["quit"])).await.map(|_| ())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Minimal fake renderer: answers `get_property time-pos` and echoes
    /// success for everything else, after first emitting an event line.
    async fn serve_one(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let req: Value = serde_json::from_str(&line).unwrap();
            let id = req["request_id"].as_u64().unwrap();
            let command = req["command"][0].as_str().unwrap();
            // Interleave an event to prove the client skips them.
            write
                .write_all(b"{\"event\":\"file-loaded\"}\n")
                .await
                .unwrap();
            let response = match (command, req["command"][1].as_str()) {
                ("get_property", Some("time-pos")) => {
                    json!({"error": "success", "data": 12.5, "request_id": id})
                }
                ("get_property", Some("path")) => {
                    json!({"error": "property unavailable", "request_id": id})
                }
                _ => json!({"error": "success", "request_id": id}),
            };
            let mut body = response.to_string();
            body.push('\n');
            write.write_all(body.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn matches_request_ids_and_skips_events() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("renderer.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        tokio::spawn(serve_one(listener));

        let mut channel = IpcChannel::connect(&sock).await.unwrap();
        channel.loadfile(Path::new("/media/a.mp4")).await.unwrap();
        assert_eq!(channel.time_pos().await.unwrap(), Some(12.5));
        // "property unavailable" maps to None, not an error.
        assert_eq!(channel.current_path().await.unwrap(), None);
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = IpcChannel::connect(&dir.path().join("absent.sock")).await;
        assert!(matches!(result, Err(IpcError::Connect { .. })));
    }
}
