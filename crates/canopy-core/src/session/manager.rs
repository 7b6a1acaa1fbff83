//! Session table and background supervision
//!
//! The manager owns the session map behind a single mutex used only for
//! insert/remove/lookup; per-session state lives behind each session's
//! own lock and is never touched while the table lock is held.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::session::{PtySession, SessionSnapshot};
use super::state::{self, PersistedPtyState};
use super::Agent;
use crate::error::{CanopyError, Result};

/// Tunables for the manager's background tasks.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Directory holding one subdirectory per session
    pub state_dir: PathBuf,
    /// Cadence of screen-state captures
    pub capture_interval: Duration,
    /// Disconnected sessions older than this are garbage collected
    pub orphan_timeout: Duration,
}

impl SessionManagerConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            capture_interval: Duration::from_millis(crate::config::DEFAULT_CAPTURE_INTERVAL_MS),
            orphan_timeout: Duration::from_secs(crate::config::DEFAULT_ORPHAN_TIMEOUT_SECS),
        }
    }
}

/// Owns every live PTY session, keyed by session id.
pub struct SessionManager {
    config: SessionManagerConfig,
    sessions: StdMutex<HashMap<String, Arc<PtySession>>>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: StdMutex::new(HashMap::new()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.config.state_dir
    }

    /// Find the session for `(workspace, agent)` or create a fresh one.
    ///
    /// The PTY itself is spawned lazily on first attach.
    pub fn get_or_create(
        &self,
        workspace: &str,
        agent: Agent,
        cwd: impl Into<PathBuf>,
    ) -> Arc<PtySession> {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        if let Some(existing) = sessions
            .values()
            .find(|s| s.workspace() == workspace && s.agent() == agent)
        {
            return Arc::clone(existing);
        }

        let id = Uuid::new_v4().to_string();
        let session = PtySession::new(id.clone(), workspace.to_string(), agent, cwd.into());
        sessions.insert(id.clone(), Arc::clone(&session));
        info!(
            category = "session",
            session = %id,
            workspace,
            agent = %agent,
            "Created session record"
        );
        session
    }

    /// Look up a session by id.
    pub fn get(&self, id: &str) -> Option<Arc<PtySession>> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .get(id)
            .cloned()
    }

    /// Snapshots of every session, for diagnostics.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .values()
            .map(|s| s.snapshot())
            .collect()
    }

    /// Destroy a session: kill the PTY, remove its state directory,
    /// drop it from the table.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.lock().expect("session table poisoned");
            sessions.remove(id)
        }
        .ok_or_else(|| CanopyError::SessionNotFound { id: id.to_string() })?;

        session.kill();
        state::remove(&self.config.state_dir, id).await;
        info!(category = "session", session = %id, "Destroyed session");
        Ok(())
    }

    /// Destroy every session owned by a workspace (workspace deletion).
    pub async fn destroy_for_workspace(&self, workspace: &str) -> usize {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock().expect("session table poisoned");
            sessions
                .values()
                .filter(|s| s.workspace() == workspace)
                .map(|s| s.id().to_string())
                .collect()
        };
        let mut destroyed = 0;
        for id in ids {
            if self.destroy(&id).await.is_ok() {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Capture every session's screen state to disk.
    pub async fn capture_all(&self) {
        let sessions: Vec<Arc<PtySession>> = {
            let table = self.sessions.lock().expect("session table poisoned");
            table.values().cloned().collect()
        };
        for session in sessions {
            let capture = session.capture(chrono::Utc::now().timestamp_millis());
            if let Err(e) = state::save(&self.config.state_dir, &capture).await {
                warn!(
                    category = "session",
                    session = %session.id(),
                    error = %e,
                    "Failed to persist session state"
                );
            }
        }
    }

    /// Load a session's persisted screen state, if any survives on disk.
    pub async fn recover(&self, session_id: &str) -> Option<PersistedPtyState> {
        state::load(&self.config.state_dir, session_id).await
    }

    /// Destroy sessions disconnected for longer than the orphan timeout.
    pub async fn collect_orphans(&self) -> usize {
        let expired: Vec<String> = {
            let sessions = self.sessions.lock().expect("session table poisoned");
            sessions
                .values()
                .filter(|s| {
                    s.orphaned_for()
                        .map(|age| age >= self.config.orphan_timeout)
                        .unwrap_or(false)
                })
                .map(|s| s.id().to_string())
                .collect()
        };

        let mut collected = 0;
        for id in expired {
            debug!(category = "session", session = %id, "Collecting orphaned session");
            if self.destroy(&id).await.is_ok() {
                collected += 1;
            }
        }
        collected
    }

    /// Spawn the periodic capture task and the orphan collector.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let capture_mgr = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(capture_mgr.config.capture_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                capture_mgr.capture_all().await;
            }
        });

        let gc_mgr = Arc::clone(self);
        tokio::spawn(async move {
            // Sweep at a fraction of the timeout so collection is timely
            // without being busy.
            let sweep = gc_mgr.config.orphan_timeout.max(Duration::from_secs(10)) / 10;
            let mut interval = tokio::time::interval(sweep);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                gc_mgr.collect_orphans().await;
            }
        });
    }
}
