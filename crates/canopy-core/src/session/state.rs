//! Session state persistence
//!
//! Captures each session's serialized screen to
//! `<state-dir>/<session-id>/pty-state.json` with the async, non-blocking
//! pattern: create the directory, then a single write. Loading degrades
//! to `None` on malformed or missing state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;

/// Screen dimensions as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
}

/// On-disk capture of one session's screen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedPtyState {
    pub session_id: String,
    /// Opaque serialized emulator state
    pub serialized: String,
    pub dimensions: Dimensions,
    /// Capture time, unix milliseconds
    pub timestamp: i64,
}

/// File name of the capture inside the session directory
const STATE_FILE: &str = "pty-state.json";

fn session_dir(state_dir: &Path, session_id: &str) -> PathBuf {
    state_dir.join(session_id)
}

fn state_path(state_dir: &Path, session_id: &str) -> PathBuf {
    session_dir(state_dir, session_id).join(STATE_FILE)
}

/// Persist a capture. Never blocks the PTY event loop: directory
/// creation plus one write, both async.
pub async fn save(state_dir: &Path, state: &PersistedPtyState) -> Result<()> {
    let dir = session_dir(state_dir, &state.session_id);
    tokio::fs::create_dir_all(&dir).await?;
    let json = serde_json::to_string(state)
        .map_err(|e| crate::error::CanopyError::Internal(e.to_string()))?;
    tokio::fs::write(state_path(state_dir, &state.session_id), json).await?;
    Ok(())
}

/// Load the most recent capture for a session.
///
/// Missing or malformed state yields `None`, never an error.
pub async fn load(state_dir: &Path, session_id: &str) -> Option<PersistedPtyState> {
    let path = state_path(state_dir, session_id);
    let data = tokio::fs::read_to_string(&path).await.ok()?;
    match serde_json::from_str(&data) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(
                category = "session",
                path = %path.display(),
                error = %e,
                "Malformed session state file, recovering nothing"
            );
            None
        }
    }
}

/// Remove a session's entire state directory.
pub async fn remove(state_dir: &Path, session_id: &str) {
    let dir = session_dir(state_dir, session_id);
    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(
                category = "session",
                dir = %dir.display(),
                error = %e,
                "Failed to remove session state directory"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn capture(id: &str) -> PersistedPtyState {
        PersistedPtyState {
            session_id: id.to_string(),
            serialized: "c2NyZWVu".to_string(),
            dimensions: Dimensions { cols: 120, rows: 30 },
            timestamp: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let state = capture("sess-1");
        save(tmp.path(), &state).await.unwrap();

        let loaded = load(tmp.path(), "sess-1").await.unwrap();
        assert_eq!(loaded.session_id, "sess-1");
        assert_eq!(loaded.serialized, "c2NyZWVu");
        assert_eq!(loaded.dimensions, Dimensions { cols: 120, rows: 30 });
    }

    #[tokio::test]
    async fn test_save_creates_session_directory() {
        let tmp = TempDir::new().unwrap();
        save(tmp.path(), &capture("sess-2")).await.unwrap();
        assert!(tmp.path().join("sess-2").join("pty-state.json").exists());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(load(tmp.path(), "never-saved").await.is_none());
    }

    #[tokio::test]
    async fn test_load_malformed_is_none() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("sess-3");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("pty-state.json"), "{broken").unwrap();

        assert!(load(tmp.path(), "sess-3").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_deletes_directory() {
        let tmp = TempDir::new().unwrap();
        save(tmp.path(), &capture("sess-4")).await.unwrap();
        remove(tmp.path(), "sess-4").await;
        assert!(!tmp.path().join("sess-4").exists());
    }

    #[tokio::test]
    async fn test_remove_missing_is_noop() {
        let tmp = TempDir::new().unwrap();
        remove(tmp.path(), "never-existed").await;
    }

    #[tokio::test]
    async fn test_overwrite_keeps_latest() {
        let tmp = TempDir::new().unwrap();
        let mut state = capture("sess-5");
        save(tmp.path(), &state).await.unwrap();
        state.serialized = "bmV3ZXI=".to_string();
        state.timestamp += 100;
        save(tmp.path(), &state).await.unwrap();

        let loaded = load(tmp.path(), "sess-5").await.unwrap();
        assert_eq!(loaded.serialized, "bmV3ZXI=");
    }
}
