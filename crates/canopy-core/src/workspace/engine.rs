//! Workspace lifecycle engine
//!
//! Drives the create/delete pipeline and is the sole broadcaster of
//! workspace progress events. Every step failure emits an `error`
//! event and rolls the workspace back so the user never sees a
//! half-built workspace.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::git::GitCli;
use super::progress::{ProgressReporter, Step, WorkspaceEvent};
use super::types::{
    is_deletable_path, name_from_branch, render_env_file, validate_name, ContainerState,
    GitState, Workspace, WorkspaceListing, WorkspaceStatus, MAIN_WORKSPACE, WORKTREES_DIR,
};
use crate::compose::ComposeFile;
use crate::datasync::{DataSync, SyncEndpoint, SyncFilter};
use crate::error::{CanopyError, Result};
use crate::ports::PortRegistry;
use crate::runtime::{is_retryable_failure, ContainerRuntime, MAX_RETRY_ATTEMPTS, RETRY_DELAYS_SECS};
use crate::session::Agent;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub repo_root: PathBuf,
    /// Base port when the compose file declares no default
    pub port_base: u16,
    /// How long compose up may take to converge
    pub converge_timeout: Duration,
    /// Poll interval while waiting for convergence
    pub converge_poll_interval: Duration,
    /// Container-state cache TTL for listings
    pub container_state_ttl: Duration,
    /// Git-state cache TTL for listings
    pub git_state_ttl: Duration,
}

impl EngineConfig {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            port_base: crate::config::DEFAULT_PORT_BASE,
            converge_timeout: Duration::from_secs(120),
            converge_poll_interval: Duration::from_secs(2),
            container_state_ttl: Duration::from_secs(3),
            git_state_ttl: Duration::from_secs(5),
        }
    }
}

/// A workspace-creation request.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub branch_name: String,
    pub from_branch: Option<String>,
    pub name: Option<String>,
    pub agent: Agent,
    pub force: bool,
    /// Data-copy options applied against the main workspace
    pub data: SyncFilter,
}

/// Stack-wide service operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicesOp {
    Start,
    Stop,
    Restart,
}

/// Single-service operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOp {
    Restart,
    Rebuild,
}

/// Orchestrates workspaces: git worktrees, ports, data, containers.
pub struct WorkspaceEngine {
    config: EngineConfig,
    git: GitCli,
    runtime: Arc<ContainerRuntime>,
    registry: Arc<PortRegistry>,
    datasync: DataSync,
    reporter: ProgressReporter,
    container_cache: StdMutex<HashMap<String, (Instant, ContainerState)>>,
    git_cache: StdMutex<HashMap<String, (Instant, GitState)>>,
}

impl WorkspaceEngine {
    pub fn new(
        config: EngineConfig,
        runtime: Arc<ContainerRuntime>,
        registry: Arc<PortRegistry>,
    ) -> Self {
        let git = GitCli::new(&config.repo_root);
        let datasync = DataSync::new(Arc::clone(&runtime));
        Self {
            config,
            git,
            runtime,
            registry,
            datasync,
            reporter: ProgressReporter::new(),
            container_cache: StdMutex::new(HashMap::new()),
            git_cache: StdMutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the engine's progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.reporter.subscribe()
    }

    pub fn repo_root(&self) -> &Path {
        &self.config.repo_root
    }

    /// Filesystem path of a non-main workspace.
    pub fn workspace_path(&self, name: &str) -> PathBuf {
        self.config.repo_root.join(WORKTREES_DIR).join(name)
    }

    /// Compose project name scoping a workspace's containers.
    pub fn project_name(&self, name: &str) -> String {
        format!("canopy-{name}")
    }

    /// Create a workspace: worktree, ports, env file, data, containers.
    pub async fn create(&self, req: CreateRequest) -> Result<Workspace> {
        let name = req
            .name
            .clone()
            .unwrap_or_else(|| name_from_branch(&req.branch_name));
        if !validate_name(&name) || name == MAIN_WORKSPACE {
            return Err(CanopyError::WorkspaceNameInvalid { name });
        }

        let path = self.workspace_path(&name);
        if self.workspace_exists(&name, &path).await? {
            if !req.force {
                let has_dirty_state = if path.exists() {
                    self.git.state_of(&path).await.has_uncommitted
                } else {
                    false
                };
                return Err(CanopyError::WorkspaceAlreadyExists {
                    name,
                    has_dirty_state,
                });
            }
            // Forced: tear the existing workspace down, then rebuild it
            // through the full pipeline.
            info!(category = "workspace", workspace = %name, "Force-recreating workspace");
            self.delete(&name).await?;
        }

        self.reporter.emit(WorkspaceEvent::Creating { name: name.clone() });
        let mut log = Vec::new();

        match self.run_create_pipeline(&req, &name, &path, &mut log).await {
            Ok(ports) => {
                self.reporter
                    .progress(&mut log, &name, Step::Complete, "workspace ready");
                self.reporter.emit(WorkspaceEvent::Created { name: name.clone() });
                Ok(Workspace {
                    name,
                    path,
                    branch: req.branch_name,
                    status: WorkspaceStatus::Ready,
                    agent: req.agent,
                    ports,
                    progress_log: log,
                })
            }
            Err((step, error)) => {
                self.reporter.emit(WorkspaceEvent::Error {
                    name: name.clone(),
                    step,
                    message: error.to_string(),
                });
                self.rollback(&name, &path).await;
                Err(error)
            }
        }
    }

    async fn run_create_pipeline(
        &self,
        req: &CreateRequest,
        name: &str,
        path: &Path,
        log: &mut Vec<String>,
    ) -> std::result::Result<BTreeMap<String, u16>, (Step, CanopyError)> {
        // git: worktree creation
        tokio::fs::create_dir_all(self.config.repo_root.join(WORKTREES_DIR))
            .await
            .map_err(|e| (Step::Git, CanopyError::Io(e)))?;
        let new_branch = !self
            .git
            .branch_exists(&req.branch_name)
            .await
            .map_err(|e| (Step::Git, e))?;
        self.git
            .worktree_add(path, &req.branch_name, req.from_branch.as_deref(), new_branch)
            .await
            .map_err(|e| (Step::Git, e))?;
        self.reporter.progress(
            log,
            name,
            Step::Git,
            format!("worktree added for branch {}", req.branch_name),
        );

        // ports: allocate for every declared service
        let compose = ComposeFile::load(path).map_err(|e| (Step::Ports, e))?;
        let mut ports = BTreeMap::new();
        let mut compose_env = Vec::new();
        if let Some(compose) = compose.as_ref() {
            for (service, env_name, base) in compose.service_base_ports() {
                let base = if base > 0 { base } else { self.config.port_base };
                let port = self
                    .registry
                    .allocate(name, &service, base)
                    .map_err(|e| (Step::Ports, e))?;
                compose_env.push((env_name, port.to_string()));
                ports.insert(service, port);
            }
            self.reporter.progress(
                log,
                name,
                Step::Ports,
                format!("allocated {} service ports", ports.len()),
            );

            // Materialize .env, never clobbering a user-authored file.
            let env_path = path.join(".env");
            if !env_path.exists() && !ports.is_empty() {
                tokio::fs::write(&env_path, render_env_file(&ports))
                    .await
                    .map_err(|e| (Step::Ports, CanopyError::Io(e)))?;
                self.reporter
                    .progress(log, name, Step::Ports, ".env written");
            }
        }

        // database: copy volume surface from the main workspace
        if let Some(compose) = compose.as_ref() {
            if req.data.skip_all {
                self.reporter
                    .progress(log, name, Step::Database, "data copy skipped");
            } else {
                let volumes = compose.volume_surface();
                let outcome = self
                    .datasync
                    .sync(
                        &SyncEndpoint::new(MAIN_WORKSPACE, &self.config.repo_root),
                        &SyncEndpoint::new(name, path),
                        &volumes,
                        &req.data,
                        None,
                    )
                    .await;
                for error in &outcome.errors {
                    self.reporter.progress(
                        log,
                        name,
                        Step::Database,
                        format!("volume {}: {}", error.volume, error.error),
                    );
                }
                self.reporter.progress(
                    log,
                    name,
                    Step::Database,
                    format!(
                        "copied {} volumes, skipped {}",
                        outcome.copied.len(),
                        outcome.skipped.len()
                    ),
                );
            }
        }

        // containers: compose up, then wait for convergence
        if compose.is_some() {
            let project = self.project_name(name);
            self.compose_up_with_retry(path, &project, &compose_env)
                .await
                .map_err(|e| (Step::Containers, e))?;
            self.reporter
                .progress(log, name, Step::Containers, "containers starting");
            self.wait_for_convergence(path, &project, &compose_env)
                .await
                .map_err(|e| (Step::Containers, e))?;
            self.reporter
                .progress(log, name, Step::Containers, "containers converged");
        }

        Ok(ports)
    }

    /// Undo a failed create so no half-built workspace survives.
    async fn rollback(&self, name: &str, path: &Path) {
        warn!(category = "workspace", workspace = %name, "Rolling back workspace");
        if let Err(e) = self.registry.release(name) {
            warn!(category = "workspace", error = %e, "Rollback: port release failed");
        }
        if path.exists() {
            let project = self.project_name(name);
            if let Err(e) = self
                .compose_in(path, &project, vec!["down", "--remove-orphans"], &[])
                .await
            {
                debug!(category = "workspace", error = %e, "Rollback: compose down failed");
            }
        }
        if let Err(e) = self.git.worktree_remove(path).await {
            warn!(category = "workspace", error = %e, "Rollback: worktree removal failed");
        }
    }

    /// Delete a workspace: containers down, worktree removed, ports
    /// released. Idempotent with respect to already-missing artifacts.
    pub async fn delete(&self, name: &str) -> Result<()> {
        if name == MAIN_WORKSPACE {
            return Err(CanopyError::WorkspaceProtected {
                reason: "the main workspace cannot be deleted".to_string(),
            });
        }
        let path = self.workspace_path(name);
        if !is_deletable_path(&self.config.repo_root, &path) {
            return Err(CanopyError::WorkspaceProtected {
                reason: format!("{} is outside {WORKTREES_DIR}/", path.display()),
            });
        }

        // A malformed compose file must not block deletion; it only
        // means there is no stack to bring down through it.
        if path.exists() && matches!(ComposeFile::load(&path), Ok(Some(_))) {
            let project = self.project_name(name);
            if let Err(e) = self
                .compose_in(&path, &project, vec!["down", "--remove-orphans"], &[])
                .await
            {
                warn!(
                    category = "workspace",
                    workspace = %name,
                    error = %e,
                    "compose down failed during delete, continuing"
                );
            }
        }

        self.git.worktree_remove(&path).await?;
        self.registry.release(name)?;
        self.invalidate_caches(name);

        self.reporter.emit(WorkspaceEvent::Deleted {
            name: name.to_string(),
        });
        info!(category = "workspace", workspace = %name, "Workspace deleted");
        Ok(())
    }

    /// Enriched listing of every workspace.
    pub async fn list(&self) -> Result<Vec<WorkspaceListing>> {
        let entries = self.git.worktree_list().await?;
        let mut listings = Vec::with_capacity(entries.len());

        for entry in entries {
            if entry.bare {
                continue;
            }
            let is_main = entry.path == self.config.repo_root;
            let name = if is_main {
                MAIN_WORKSPACE.to_string()
            } else {
                entry
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| name_from_branch(entry.branch.as_deref().unwrap_or("")))
            };

            let ports = self.registry.get_ports(&name);
            let container_state = self.cached_container_state(&name, &entry.path).await;
            let git = self.cached_git_state(&name, &entry.path).await;

            listings.push(WorkspaceListing {
                name,
                path: entry.path,
                branch: entry.branch,
                is_main,
                ports,
                container_state,
                git,
            });
        }
        Ok(listings)
    }

    /// Find a listed workspace by name.
    pub async fn find(&self, name: &str) -> Result<WorkspaceListing> {
        self.list()
            .await?
            .into_iter()
            .find(|w| w.name == name)
            .ok_or_else(|| CanopyError::WorkspaceNotFound {
                name: name.to_string(),
            })
    }

    /// Stack-wide service operation.
    pub async fn services(&self, name: &str, op: ServicesOp) -> Result<()> {
        let listing = self.find(name).await?;
        let project = self.project_name(name);
        let envs = self.compose_env_for(name, &listing.path)?;

        let args = match op {
            ServicesOp::Start => vec!["up", "-d"],
            ServicesOp::Stop => vec!["stop"],
            ServicesOp::Restart => vec!["restart"],
        };
        self.compose_in(&listing.path, &project, args, &envs).await?;
        self.invalidate_caches(name);

        self.reporter.emit(match op {
            ServicesOp::Start | ServicesOp::Restart => WorkspaceEvent::ServicesStarted {
                name: name.to_string(),
            },
            ServicesOp::Stop => WorkspaceEvent::ServicesStopped {
                name: name.to_string(),
            },
        });
        Ok(())
    }

    /// Single-service operation.
    pub async fn service(&self, name: &str, service: &str, op: ServiceOp) -> Result<()> {
        let listing = self.find(name).await?;
        let project = self.project_name(name);
        let envs = self.compose_env_for(name, &listing.path)?;

        let args = match op {
            ServiceOp::Restart => vec!["restart", service],
            ServiceOp::Rebuild => vec!["up", "-d", "--build", service],
        };
        self.compose_in(&listing.path, &project, args, &envs).await?;
        self.invalidate_caches(name);
        Ok(())
    }

    /// Environment a workspace's compose invocations need: the port
    /// interpolation names mapped to their allocated values.
    fn compose_env_for(&self, name: &str, path: &Path) -> Result<Vec<(String, String)>> {
        let Some(compose) = ComposeFile::load(path)? else {
            return Ok(Vec::new());
        };
        let allocated = self.registry.get_ports(name);
        Ok(compose
            .service_base_ports()
            .into_iter()
            .map(|(service, env_name, base)| {
                let port = allocated.get(&service).copied().unwrap_or(base);
                (env_name, port.to_string())
            })
            .collect())
    }

    async fn workspace_exists(&self, name: &str, path: &Path) -> Result<bool> {
        if path.exists() {
            return Ok(true);
        }
        let entries = self.git.worktree_list().await?;
        Ok(entries.iter().any(|e| {
            e.path == path
                || e.path
                    .file_name()
                    .map(|n| n.to_string_lossy() == name)
                    .unwrap_or(false)
        }))
    }

    async fn compose_up_with_retry(
        &self,
        path: &Path,
        project: &str,
        envs: &[(String, String)],
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self
                .compose_in(path, project, vec!["up", "-d"], envs)
                .await
            {
                Ok(_) => return Ok(()),
                Err(CanopyError::ComposeFailed { ref stderr, .. })
                    if is_retryable_failure(stderr) && attempt + 1 < MAX_RETRY_ATTEMPTS =>
                {
                    let delay = RETRY_DELAYS_SECS
                        .get(attempt as usize)
                        .copied()
                        .unwrap_or(5);
                    warn!(
                        category = "workspace",
                        attempt = attempt + 1,
                        delay_secs = delay,
                        "compose up failed transiently, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll container state until every service is running or exited 0.
    async fn wait_for_convergence(
        &self,
        path: &Path,
        project: &str,
        envs: &[(String, String)],
    ) -> Result<()> {
        let deadline = Instant::now() + self.config.converge_timeout;
        loop {
            let output = self
                .compose_in(path, project, vec!["ps", "-a", "--format", "json"], envs)
                .await?;
            let entries = parse_compose_ps(&output);
            match assess_convergence(&entries) {
                Convergence::Converged => return Ok(()),
                Convergence::Failed(detail) => {
                    return Err(CanopyError::WorkspaceCreateFailed {
                        step: Step::Containers.as_str().to_string(),
                        reason: detail,
                    })
                }
                Convergence::Pending(detail) => {
                    if Instant::now() >= deadline {
                        return Err(CanopyError::ConvergenceTimeout {
                            timeout_secs: self.config.converge_timeout.as_secs(),
                            detail,
                        });
                    }
                    tokio::time::sleep(self.config.converge_poll_interval).await;
                }
            }
        }
    }

    async fn compose_in(
        &self,
        dir: &Path,
        project: &str,
        args: Vec<&str>,
        envs: &[(String, String)],
    ) -> Result<String> {
        let argv = self.runtime.compose(args);
        let command = argv.join(" ");
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| CanopyError::Internal("empty compose argv".to_string()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest)
            .current_dir(dir)
            .env("COMPOSE_PROJECT_NAME", project);
        for (key, value) in envs {
            cmd.env(key, value);
        }

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(CanopyError::ComposeFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn cached_container_state(&self, name: &str, path: &Path) -> ContainerState {
        {
            let cache = self.container_cache.lock().expect("cache poisoned");
            if let Some((at, state)) = cache.get(name) {
                if at.elapsed() < self.config.container_state_ttl {
                    return *state;
                }
            }
        }

        let state = self.probe_container_state(name, path).await;
        self.container_cache
            .lock()
            .expect("cache poisoned")
            .insert(name.to_string(), (Instant::now(), state));
        state
    }

    async fn probe_container_state(&self, name: &str, path: &Path) -> ContainerState {
        match ComposeFile::load(path) {
            Ok(Some(_)) => {}
            Ok(None) => return ContainerState::NotFound,
            Err(_) => return ContainerState::Unknown,
        }
        let project = self.project_name(name);
        let running = self
            .compose_in(path, &project, vec!["ps", "-q"], &[])
            .await;
        let all = self
            .compose_in(path, &project, vec!["ps", "-a", "-q"], &[])
            .await;
        match (running, all) {
            (Ok(running), Ok(all)) => resolve_container_state(&running, &all),
            (Ok(running), Err(_)) => resolve_container_state(&running, ""),
            _ => ContainerState::Unknown,
        }
    }

    async fn cached_git_state(&self, name: &str, path: &Path) -> GitState {
        {
            let cache = self.git_cache.lock().expect("cache poisoned");
            if let Some((at, state)) = cache.get(name) {
                if at.elapsed() < self.config.git_state_ttl {
                    return *state;
                }
            }
        }

        let state = self.git.state_of(path).await;
        self.git_cache
            .lock()
            .expect("cache poisoned")
            .insert(name.to_string(), (Instant::now(), state));
        state
    }

    fn invalidate_caches(&self, name: &str) {
        self.container_cache
            .lock()
            .expect("cache poisoned")
            .remove(name);
        self.git_cache.lock().expect("cache poisoned").remove(name);
    }
}

/// One `compose ps --format json` entry (the fields canopy reads).
#[derive(Debug, Clone, Deserialize)]
struct PsEntry {
    #[serde(rename = "Service", default)]
    service: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: i64,
}

/// Parse compose ps JSON output; v2 emits one object per line, older
/// builds emit a single array.
fn parse_compose_ps(output: &str) -> Vec<PsEntry> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).unwrap_or_default();
    }
    trimmed
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
enum Convergence {
    Converged,
    Pending(String),
    Failed(String),
}

/// A stack has converged when every service is running or exited with
/// code 0. `created`, `restarting` and `starting` are tolerated while
/// the timeout is pending; any other terminal state fails immediately.
fn assess_convergence(entries: &[PsEntry]) -> Convergence {
    if entries.is_empty() {
        return Convergence::Pending("no containers registered yet".to_string());
    }
    let mut pending = None;
    for entry in entries {
        match entry.state.as_str() {
            "running" => {}
            "exited" if entry.exit_code == 0 => {}
            "exited" => {
                return Convergence::Failed(format!(
                    "service {} exited with code {}",
                    entry.service, entry.exit_code
                ))
            }
            "created" | "restarting" | "starting" => {
                pending = Some(format!("service {} is {}", entry.service, entry.state));
            }
            other => {
                return Convergence::Failed(format!("service {} is {other}", entry.service))
            }
        }
    }
    match pending {
        Some(detail) => Convergence::Pending(detail),
        None => Convergence::Converged,
    }
}

/// Map compose `ps -q` outputs to a container state, like the running
/// versus all-containers comparison the compose CLI affords.
fn resolve_container_state(running_output: &str, all_output: &str) -> ContainerState {
    if !running_output.trim().is_empty() {
        return ContainerState::Running;
    }
    if !all_output.trim().is_empty() {
        return ContainerState::Stopped;
    }
    ContainerState::NotFound
}
