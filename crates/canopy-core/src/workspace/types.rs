//! Workspace data model

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::session::Agent;

/// Directory under the repository root that holds non-main workspaces
pub const WORKTREES_DIR: &str = ".worktrees";

/// Name of the implicit workspace backed by the repository root
pub const MAIN_WORKSPACE: &str = "main";

/// Lifecycle state of a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Creating,
    Ready,
    Error,
    Deleted,
}

/// The primary aggregate: a worktree plus its stack
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    pub status: WorkspaceStatus,
    pub agent: Agent,
    pub ports: BTreeMap<String, u16>,
    pub progress_log: Vec<String>,
}

/// Container stack state of a workspace, as enriched into listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Stopped,
    NotFound,
    Unknown,
}

/// Git working-state of a workspace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitState {
    pub has_uncommitted: bool,
    pub has_unpushed: bool,
    pub ahead: usize,
    pub behind: usize,
}

impl GitState {
    /// Collapsed cleanliness label: clean / uncommitted / unpushed
    pub fn label(&self) -> &'static str {
        if self.has_uncommitted {
            "uncommitted"
        } else if self.has_unpushed || self.ahead > 0 {
            "unpushed"
        } else {
            "clean"
        }
    }
}

/// One row of the enriched workspace listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceListing {
    pub name: String,
    pub path: PathBuf,
    pub branch: Option<String>,
    pub is_main: bool,
    pub ports: BTreeMap<String, u16>,
    pub container_state: ContainerState,
    pub git: GitState,
}

/// Derive a workspace name from a branch name (`/` becomes `-`).
pub fn name_from_branch(branch: &str) -> String {
    branch.replace('/', "-")
}

/// Validate a workspace name for use as a directory and registry key.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains(':')
}

/// Environment variable a service's allocated port is published under.
pub fn port_env_var(service: &str) -> String {
    let upper: String = service
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{upper}_PORT")
}

/// Render the `.env` content for a port mapping.
pub fn render_env_file(ports: &BTreeMap<String, u16>) -> String {
    let mut out = String::new();
    for (service, port) in ports {
        out.push_str(&port_env_var(service));
        out.push('=');
        out.push_str(&port.to_string());
        out.push('\n');
    }
    out
}

/// Whether a workspace path is eligible for deletion: strictly inside
/// the repository's `.worktrees/` directory.
pub fn is_deletable_path(repo_root: &Path, path: &Path) -> bool {
    let worktrees = repo_root.join(WORKTREES_DIR);
    match path.strip_prefix(&worktrees) {
        Ok(rest) => !rest.as_os_str().is_empty(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_branch() {
        assert_eq!(name_from_branch("feature/login"), "feature-login");
        assert_eq!(name_from_branch("fix/a/b"), "fix-a-b");
        assert_eq!(name_from_branch("plain"), "plain");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("feature-login"));
        assert!(!validate_name(""));
        assert!(!validate_name("a/b"));
        assert!(!validate_name("a:b"));
        assert!(!validate_name(".."));
    }

    #[test]
    fn test_port_env_var() {
        assert_eq!(port_env_var("api"), "API_PORT");
        assert_eq!(port_env_var("redis-cache"), "REDIS_CACHE_PORT");
    }

    #[test]
    fn test_render_env_file() {
        let mut ports = BTreeMap::new();
        ports.insert("api".to_string(), 3000);
        ports.insert("db".to_string(), 5432);
        assert_eq!(render_env_file(&ports), "API_PORT=3000\nDB_PORT=5432\n");
    }

    #[test]
    fn test_is_deletable_path() {
        let repo = Path::new("/src/app");
        assert!(is_deletable_path(repo, Path::new("/src/app/.worktrees/feat")));
        // The repo root (main workspace) is protected.
        assert!(!is_deletable_path(repo, Path::new("/src/app")));
        // So is the .worktrees directory itself.
        assert!(!is_deletable_path(repo, Path::new("/src/app/.worktrees")));
        // And anything outside the repository.
        assert!(!is_deletable_path(repo, Path::new("/elsewhere/feat")));
    }

    #[test]
    fn test_git_state_label() {
        assert_eq!(GitState::default().label(), "clean");
        assert_eq!(
            GitState {
                has_uncommitted: true,
                ..Default::default()
            }
            .label(),
            "uncommitted"
        );
        assert_eq!(
            GitState {
                ahead: 2,
                ..Default::default()
            }
            .label(),
            "unpushed"
        );
    }
}
