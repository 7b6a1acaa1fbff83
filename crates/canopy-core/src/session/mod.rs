//! PTY session manager
//!
//! Long-lived terminal sessions that survive client disconnection. Each
//! session owns its PTY process, an in-memory terminal emulator for
//! state capture, and the attached-client slot; transports only ever
//! hold a session id and resolve it through the manager.

mod control;
mod emulator;
mod manager;
mod pty;
mod session;
mod state;

pub use control::{classify, ControlMessage, Inbound, ServerFrame};
pub use emulator::ScreenState;
pub use manager::{SessionManager, SessionManagerConfig};
pub use pty::{PauseGate, PtyHandle, PtySpawnSpec};
pub use session::{AttachOutcome, ClientTransport, PtySession, SessionSnapshot};
pub use state::{Dimensions, PersistedPtyState};

use serde::{Deserialize, Serialize};

/// Default terminal dimensions on spawn; resized by client control messages
pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;

/// Outputs below this size are coalesced before forwarding
pub const LARGE_OUTPUT_THRESHOLD: usize = 512;

/// Coalescing window for small outputs
pub const COALESCE_WINDOW_MS: u64 = 4;

/// Server-side backpressure: outbound buffer high watermark
pub const BACKPRESSURE_HIGH_WATERMARK: usize = 1024 * 1024;

/// Server-side backpressure: resume once the buffer drains below this
pub const BACKPRESSURE_LOW_WATERMARK: usize = BACKPRESSURE_HIGH_WATERMARK / 2;

/// Chunks larger than this trigger the server-side pause when the
/// outbound buffer is already above the high watermark
pub const BACKPRESSURE_CHUNK_THRESHOLD: usize = 10 * 1024;

/// Safety timer: force-resume a server-paused PTY after this long
pub const BACKPRESSURE_FORCE_RESUME_SECS: u64 = 30;

/// Scrollback lines retained by the in-memory emulator
pub const SCROLLBACK_LINES: usize = 2_000;

/// Default interactive program of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    Claude,
    Codex,
    Gemini,
    Shell,
}

impl Agent {
    /// Program and arguments the PTY runs for this agent.
    ///
    /// The shell agent runs the user's shell; assistant agents run their
    /// vendor command.
    pub fn argv(&self) -> (String, Vec<String>) {
        match self {
            Self::Shell => {
                let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
                (shell, vec!["-l".to_string()])
            }
            Self::Claude => ("claude".to_string(), Vec::new()),
            Self::Codex => ("codex".to_string(), Vec::new()),
            Self::Gemini => ("gemini".to_string(), Vec::new()),
        }
    }

    /// Optional update command run before the agent program itself.
    pub fn update_argv(&self) -> Option<(String, Vec<String>)> {
        match self {
            Self::Shell => None,
            Self::Claude => Some((
                "npm".to_string(),
                vec![
                    "install".to_string(),
                    "-g".to_string(),
                    "@anthropic-ai/claude-code".to_string(),
                ],
            )),
            Self::Codex => Some((
                "npm".to_string(),
                vec![
                    "install".to_string(),
                    "-g".to_string(),
                    "@openai/codex".to_string(),
                ],
            )),
            Self::Gemini => Some((
                "npm".to_string(),
                vec![
                    "install".to_string(),
                    "-g".to_string(),
                    "@google/gemini-cli".to_string(),
                ],
            )),
        }
    }

    /// Parse an agent name as it appears in requests.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            "shell" => Some(Self::Shell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Shell => "shell",
        }
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
