//! Error types for canopy-core
//!
//! Error codes are categorized as follows:
//! - E1xxx: Git operation errors
//! - E2xxx: Workspace lifecycle errors
//! - E3xxx: Port registry errors
//! - E4xxx: Terminal session errors
//! - E5xxx: Gateway errors
//! - E6xxx: Container runtime errors
//! - E7xxx: Data sync errors

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using CanopyError
pub type Result<T> = std::result::Result<T, CanopyError>;

/// Main error type for canopy-core
#[derive(Error, Debug)]
pub enum CanopyError {
    // E1xxx: Git operation errors
    #[error("[E1001] Not a git repository: {path}")]
    NotAGitRepository { path: PathBuf },

    #[error("[E1002] Git executable not found")]
    GitNotFound,

    #[error("[E1003] Git command failed: {command}: {stderr}")]
    GitCommandFailed { command: String, stderr: String },

    #[error("[E1004] Branch not found: {name}")]
    BranchNotFound { name: String },

    // E2xxx: Workspace lifecycle errors
    #[error("[E2001] Workspace not found: {name}")]
    WorkspaceNotFound { name: String },

    #[error("[E2002] Workspace already exists: {name}")]
    WorkspaceAlreadyExists { name: String, has_dirty_state: bool },

    #[error("[E2003] Workspace create failed at step '{step}': {reason}")]
    WorkspaceCreateFailed { step: String, reason: String },

    #[error("[E2004] Workspace delete refused: {reason}")]
    WorkspaceProtected { reason: String },

    #[error("[E2005] Invalid workspace name: {name}")]
    WorkspaceNameInvalid { name: String },

    #[error("[E2006] Containers did not converge within {timeout_secs}s: {detail}")]
    ConvergenceTimeout { timeout_secs: u64, detail: String },

    // E3xxx: Port registry errors
    #[error("[E3001] Port registry write failed: {path}: {reason}")]
    RegistryWriteFailed { path: PathBuf, reason: String },

    #[error("[E3002] No free port at or above {base} for {workspace}:{service}")]
    PortsExhausted {
        workspace: String,
        service: String,
        base: u16,
    },

    // E4xxx: Terminal session errors
    #[error("[E4001] Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("[E4002] PTY spawn failed: {reason}")]
    PtySpawnFailed { reason: String },

    #[error("[E4003] PTY io error: {details}")]
    PtyIo { details: String },

    #[error("[E4004] Session state invalid: {path}: {reason}")]
    SessionStateInvalid { path: PathBuf, reason: String },

    // E5xxx: Gateway errors
    #[error("[E5001] Server bind failed: {address}")]
    ServerBindFailed { address: String },

    #[error("[E5002] Invalid request: {reason}")]
    InvalidRequest { reason: String },

    // E6xxx: Container runtime errors
    #[error("[E6001] No usable container runtime\n{transcript}")]
    RuntimeUnavailable { transcript: String },

    #[error("[E6002] Compose command failed: {command}: {stderr}")]
    ComposeFailed { command: String, stderr: String },

    #[error("[E6003] Runtime command failed: {command}: {stderr}")]
    RuntimeCommandFailed { command: String, stderr: String },

    #[error("[E6004] Compose file invalid: {path}: {reason}")]
    ComposeFileInvalid { path: PathBuf, reason: String },

    // E7xxx: Data sync errors
    #[error("[E7001] Volume {volume} does not exist")]
    VolumeMissing { volume: String },

    #[error("[E7002] Volume copy failed: {volume}: {reason}")]
    VolumeCopyFailed { volume: String, reason: String },

    // Generic errors
    #[error("[E9001] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[E9002] Configuration error: {reason}")]
    Config { reason: String },

    #[error("[E9003] Internal error: {0}")]
    Internal(String),
}

impl CanopyError {
    /// Get the error code as a string (e.g., "E2002")
    pub fn code(&self) -> &'static str {
        match self {
            // E1xxx
            Self::NotAGitRepository { .. } => "E1001",
            Self::GitNotFound => "E1002",
            Self::GitCommandFailed { .. } => "E1003",
            Self::BranchNotFound { .. } => "E1004",
            // E2xxx
            Self::WorkspaceNotFound { .. } => "E2001",
            Self::WorkspaceAlreadyExists { .. } => "E2002",
            Self::WorkspaceCreateFailed { .. } => "E2003",
            Self::WorkspaceProtected { .. } => "E2004",
            Self::WorkspaceNameInvalid { .. } => "E2005",
            Self::ConvergenceTimeout { .. } => "E2006",
            // E3xxx
            Self::RegistryWriteFailed { .. } => "E3001",
            Self::PortsExhausted { .. } => "E3002",
            // E4xxx
            Self::SessionNotFound { .. } => "E4001",
            Self::PtySpawnFailed { .. } => "E4002",
            Self::PtyIo { .. } => "E4003",
            Self::SessionStateInvalid { .. } => "E4004",
            // E5xxx
            Self::ServerBindFailed { .. } => "E5001",
            Self::InvalidRequest { .. } => "E5002",
            // E6xxx
            Self::RuntimeUnavailable { .. } => "E6001",
            Self::ComposeFailed { .. } => "E6002",
            Self::RuntimeCommandFailed { .. } => "E6003",
            Self::ComposeFileInvalid { .. } => "E6004",
            // E7xxx
            Self::VolumeMissing { .. } => "E7001",
            Self::VolumeCopyFailed { .. } => "E7002",
            // E9xxx
            Self::Io(_) => "E9001",
            Self::Config { .. } => "E9002",
            Self::Internal(_) => "E9003",
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.code().chars().nth(1).and_then(|c| c.to_digit(10)) {
            Some(1) => ErrorCategory::Git,
            Some(2) => ErrorCategory::Workspace,
            Some(3) => ErrorCategory::Ports,
            Some(4) => ErrorCategory::Session,
            Some(5) => ErrorCategory::Gateway,
            Some(6) => ErrorCategory::Runtime,
            Some(7) => ErrorCategory::DataSync,
            _ => ErrorCategory::Internal,
        }
    }

    /// Whether the error reports a missing entity (HTTP 404 shaped)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::WorkspaceNotFound { .. }
                | Self::SessionNotFound { .. }
                | Self::BranchNotFound { .. }
                | Self::VolumeMissing { .. }
        )
    }

    /// Whether the error reports a conflict with existing state (HTTP 409 shaped)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::WorkspaceAlreadyExists { .. })
    }
}

/// Error category for grouping errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Git,
    Workspace,
    Ports,
    Session,
    Gateway,
    Runtime,
    DataSync,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git => write!(f, "Git"),
            Self::Workspace => write!(f, "Workspace"),
            Self::Ports => write!(f, "Ports"),
            Self::Session => write!(f, "Session"),
            Self::Gateway => write!(f, "Gateway"),
            Self::Runtime => write!(f, "Runtime"),
            Self::DataSync => write!(f, "DataSync"),
            Self::Internal => write!(f, "Internal"),
        }
    }
}
