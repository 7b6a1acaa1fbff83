//! Workspace progress events
//!
//! The engine is the sole broadcaster: every create/delete pipeline
//! emits typed events through one broadcast channel, and the gateway
//! subscribes and frames them for clients.

use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;

/// Pipeline step a progress line is tagged with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Git,
    Database,
    Ports,
    Containers,
    Complete,
    Error,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Database => "database",
            Self::Ports => "ports",
            Self::Containers => "containers",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// Engine-emitted events, one channel for the whole process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceEvent {
    Creating {
        name: String,
    },
    Progress {
        name: String,
        step: Step,
        message: String,
    },
    Created {
        name: String,
    },
    Error {
        name: String,
        step: Step,
        message: String,
    },
    Deleted {
        name: String,
    },
    ServicesStarted {
        name: String,
    },
    ServicesStopped {
        name: String,
    },
}

impl WorkspaceEvent {
    /// Wire event name, `worktree:*` / `services:*`
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Creating { .. } => "worktree:creating",
            Self::Progress { .. } => "worktree:progress",
            Self::Created { .. } => "worktree:created",
            Self::Error { .. } => "worktree:error",
            Self::Deleted { .. } => "worktree:deleted",
            Self::ServicesStarted { .. } => "services:started",
            Self::ServicesStopped { .. } => "services:stopped",
        }
    }

    /// Workspace the event belongs to
    pub fn workspace(&self) -> &str {
        match self {
            Self::Creating { name }
            | Self::Progress { name, .. }
            | Self::Created { name }
            | Self::Error { name, .. }
            | Self::Deleted { name }
            | Self::ServicesStarted { name }
            | Self::ServicesStopped { name } => name,
        }
    }

    /// Step tag, for events that carry one
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Progress { step, .. } | Self::Error { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// `{event, data}` wire frame
    pub fn frame(&self) -> serde_json::Value {
        let data = match self {
            Self::Creating { name }
            | Self::Created { name }
            | Self::Deleted { name }
            | Self::ServicesStarted { name }
            | Self::ServicesStopped { name } => json!({ "name": name }),
            Self::Progress {
                name,
                step,
                message,
            }
            | Self::Error {
                name,
                step,
                message,
            } => json!({
                "name": name,
                "step": step.as_str(),
                "message": message,
            }),
        };
        json!({ "event": self.event_name(), "data": data })
    }
}

/// Broadcast capacity; slow subscribers lag rather than block the engine
const CHANNEL_CAPACITY: usize = 256;

/// The engine's event outlet plus a per-run progress log.
pub struct ProgressReporter {
    sender: broadcast::Sender<WorkspaceEvent>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers; a subscriber-free channel is
    /// not an error.
    pub fn emit(&self, event: WorkspaceEvent) {
        info!(
            category = "workspace",
            event = event.event_name(),
            workspace = event.workspace(),
            "Progress"
        );
        let _ = self.sender.send(event);
    }

    /// Emit a step-tagged progress line and append it to the log.
    pub fn progress(&self, log: &mut Vec<String>, name: &str, step: Step, message: impl Into<String>) {
        let message = message.into();
        log.push(format!("[{}] {message}", step.as_str()));
        self.emit(WorkspaceEvent::Progress {
            name: name.to_string(),
            step,
            message,
        });
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}
