//! Small filesystem helpers shared by the cache index and persisted
//! playlist state.
//!
//! All state files are written via temp-then-rename so a crash mid-write
//! can never leave a corrupt document behind.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Atomically serialize `value` as pretty JSON to `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

/// Read a JSON document, treating a missing or unreadable file as absent.
/// Decode failures are logged and treated as absent too: stale state must
/// never prevent startup.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!("Failed to read state file {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring malformed state file {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn round_trips_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut doc = BTreeMap::new();
        doc.insert("key".to_string(), 42u32);

        write_json_atomic(&path, &doc).unwrap();
        let loaded: BTreeMap<String, u32> = read_json(&path).unwrap();
        assert_eq!(loaded, doc);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_and_malformed_files_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(read_json::<serde_json::Value>(&missing).is_none());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{truncated").unwrap();
        assert!(read_json::<serde_json::Value>(&bad).is_none());
    }
}
