//! Configuration loading
//!
//! Reads `~/.canopy/config.json`, authored by the first-run wizard.
//! Keys are camelCase to match the on-disk format consumed by the UI.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{CanopyError, Result};

/// Name of the application directory under the user's home
pub const APP_DIR: &str = ".canopy";

/// Default interval between PTY screen-state captures (milliseconds)
pub const DEFAULT_CAPTURE_INTERVAL_MS: u64 = 2_000;

/// Default age after which a disconnected session is garbage collected (seconds)
pub const DEFAULT_ORPHAN_TIMEOUT_SECS: u64 = 3_600;

/// Default base port services are allocated from when the compose file
/// declares no explicit default
pub const DEFAULT_PORT_BASE: u16 = 3_000;

/// Which AI assistant commands are offered as terminal agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiAgentChoice {
    Claude,
    Codex,
    Both,
}

/// Forced container runtime selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeChoice {
    Docker,
    Podman,
}

/// Which interface the gateway binds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkInterface {
    Localhost,
    All,
}

impl NetworkInterface {
    /// Bind address for the gateway listener
    pub fn bind_address(&self) -> &'static str {
        match self {
            Self::Localhost => "127.0.0.1",
            Self::All => "0.0.0.0",
        }
    }
}

/// Application configuration, as written by the first-run wizard
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root of the git repository workspaces are carved from
    pub repository_root: PathBuf,
    /// Default AI assistant offered in terminals
    pub ai_agent: AiAgentChoice,
    /// Forced container runtime, if any
    #[serde(default)]
    pub container_runtime: Option<RuntimeChoice>,
    /// Interface the gateway binds
    #[serde(default = "default_interface")]
    pub default_network_interface: NetworkInterface,
    /// Interval between PTY state captures, milliseconds
    #[serde(default = "default_capture_interval")]
    pub pty_state_capture_interval: u64,
    /// Age after which a disconnected session is garbage collected, seconds
    #[serde(default = "default_orphan_timeout")]
    pub orphan_session_timeout: u64,
    /// Base port allocation starts from when the compose file has no default
    #[serde(default = "default_port_base")]
    pub port_base: u16,
}

fn default_interface() -> NetworkInterface {
    NetworkInterface::Localhost
}

fn default_capture_interval() -> u64 {
    DEFAULT_CAPTURE_INTERVAL_MS
}

fn default_orphan_timeout() -> u64 {
    DEFAULT_ORPHAN_TIMEOUT_SECS
}

fn default_port_base() -> u16 {
    DEFAULT_PORT_BASE
}

impl Config {
    /// Build a config with defaults for everything but the repository root.
    pub fn for_repository(repository_root: impl Into<PathBuf>) -> Self {
        Self {
            repository_root: repository_root.into(),
            ai_agent: AiAgentChoice::Claude,
            container_runtime: None,
            default_network_interface: default_interface(),
            pty_state_capture_interval: default_capture_interval(),
            orphan_session_timeout: default_orphan_timeout(),
            port_base: default_port_base(),
        }
    }

    /// Path of the application directory (`~/.canopy`)
    pub fn app_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| CanopyError::Config {
            reason: "failed to determine home directory".to_string(),
        })?;
        Ok(home.join(APP_DIR))
    }

    /// Default path of the configuration file
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("config.json"))
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load configuration from an explicit path.
    ///
    /// A missing file is a configuration error (the wizard has not run);
    /// a malformed file reports the parse failure.
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| CanopyError::Config {
            reason: format!("{}: {e}", path.display()),
        })?;
        let config: Config = serde_json::from_str(&data).map_err(|e| CanopyError::Config {
            reason: format!("{}: {e}", path.display()),
        })?;
        debug!(
            category = "config",
            repository = %config.repository_root.display(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Write configuration to an explicit path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| CanopyError::Config {
            reason: format!("serialize: {e}"),
        })?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Directory holding per-session state (`~/.canopy/sessions`)
    pub fn sessions_dir() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("sessions"))
    }

    /// Path of the port registry file (`~/.canopy/ports.json`)
    pub fn ports_file() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("ports.json"))
    }
}
