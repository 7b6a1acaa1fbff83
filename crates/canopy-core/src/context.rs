//! Process-wide context
//!
//! All stores are constructed once at startup and passed explicitly;
//! nothing in the engine reaches for process-global state.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::datasync::DataSync;
use crate::error::Result;
use crate::ports::PortRegistry;
use crate::runtime::ContainerRuntime;
use crate::session::{SessionManager, SessionManagerConfig};
use crate::workspace::{EngineConfig, WorkspaceEngine};

/// Dependency-injected bundle of every store the gateway needs.
pub struct Context {
    pub config: Config,
    pub runtime: Arc<ContainerRuntime>,
    pub registry: Arc<PortRegistry>,
    pub engine: Arc<WorkspaceEngine>,
    pub sessions: Arc<SessionManager>,
    pub datasync: Arc<DataSync>,
}

impl Context {
    /// Assemble the context from configuration plus a detected runtime.
    ///
    /// Stores live under `~/.canopy/` unless the config dictates
    /// otherwise; tests assemble contexts by hand instead.
    pub fn build(config: Config, runtime: ContainerRuntime) -> Result<Arc<Self>> {
        let runtime = Arc::new(runtime);
        let registry = Arc::new(PortRegistry::open(Config::ports_file()?));

        let mut engine_config = EngineConfig::new(&config.repository_root);
        engine_config.port_base = config.port_base;
        let engine = Arc::new(WorkspaceEngine::new(
            engine_config,
            Arc::clone(&runtime),
            Arc::clone(&registry),
        ));

        let mut session_config = SessionManagerConfig::new(Config::sessions_dir()?);
        session_config.capture_interval =
            Duration::from_millis(config.pty_state_capture_interval);
        session_config.orphan_timeout = Duration::from_secs(config.orphan_session_timeout);
        let sessions = SessionManager::new(session_config);

        let datasync = Arc::new(DataSync::new(Arc::clone(&runtime)));

        Ok(Arc::new(Self {
            config,
            runtime,
            registry,
            engine,
            sessions,
            datasync,
        }))
    }

    /// Start the background supervision tasks (state capture, orphan
    /// collection). Requires a running tokio runtime.
    pub fn spawn_background_tasks(&self) {
        self.sessions.spawn_background_tasks();
    }
}
