//! Data sync engine
//!
//! Copies a workspace's storage surface (named volumes and bind mounts)
//! to another workspace. One failed volume never aborts the run; errors
//! are collected per volume and reported in the aggregate outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::compose::{VolumeKind, VolumeSpec};
use crate::error::{CanopyError, Result};
use crate::runtime::ContainerRuntime;

/// Helper image used for named-volume copies and size probes
const HELPER_IMAGE: &str = "alpine:3";

/// Per-volume include/exclude filtering
#[derive(Debug, Clone, Default)]
pub struct SyncFilter {
    /// Short-circuit: copy nothing at all
    pub skip_all: bool,
    /// Whitelist; `None` admits everything
    pub include: Option<Vec<String>>,
    /// Blacklist, applied after the whitelist
    pub exclude: Vec<String>,
}

impl SyncFilter {
    pub fn skip_all() -> Self {
        Self {
            skip_all: true,
            ..Default::default()
        }
    }
}

/// One side of a sync: a workspace identified by name and path
#[derive(Debug, Clone)]
pub struct SyncEndpoint {
    pub workspace: String,
    pub path: PathBuf,
}

impl SyncEndpoint {
    pub fn new(workspace: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            path: path.into(),
        }
    }
}

/// Error recorded for a single volume
#[derive(Debug, Clone)]
pub struct VolumeError {
    pub volume: String,
    pub error: String,
}

/// Aggregate result of a sync run
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub copied: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<VolumeError>,
}

/// Progress callback: `(volume, bytes_copied, bytes_total)`.
///
/// Called at least twice per copied volume: once with `0/total` before
/// the copy and once with `total/total` after. `0/0` means "no data
/// known".
pub type ProgressFn = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

/// Copies volumes and bind directories between workspaces.
pub struct DataSync {
    runtime: Arc<ContainerRuntime>,
}

impl DataSync {
    pub fn new(runtime: Arc<ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Runtime-qualified name of a workspace's named volume
    pub fn qualified_volume(workspace: &str, logical_name: &str) -> String {
        format!("{workspace}_{logical_name}")
    }

    /// Copy the filtered volume surface from `source` to `target`.
    pub async fn sync(
        &self,
        source: &SyncEndpoint,
        target: &SyncEndpoint,
        volumes: &[VolumeSpec],
        filter: &SyncFilter,
        progress: Option<ProgressFn>,
    ) -> SyncOutcome {
        let (to_copy, skipped) = partition_volumes(volumes, filter);

        let mut outcome = SyncOutcome {
            skipped,
            ..Default::default()
        };

        if filter.skip_all {
            debug!(category = "datasync", "skipAll set, copying nothing");
            return outcome;
        }

        for volume in to_copy {
            let result = match volume.kind {
                VolumeKind::Named => {
                    self.copy_named_volume(source, target, &volume.logical_name, progress.as_ref())
                        .await
                }
                VolumeKind::Bind => {
                    self.copy_bind_mount(source, target, &volume.logical_name, progress.as_ref())
                        .await
                }
            };
            match result {
                Ok(()) => outcome.copied.push(volume.logical_name.clone()),
                Err(e) => {
                    warn!(
                        category = "datasync",
                        volume = %volume.logical_name,
                        error = %e,
                        "Volume copy failed, continuing with siblings"
                    );
                    outcome.errors.push(VolumeError {
                        volume: volume.logical_name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            category = "datasync",
            copied = outcome.copied.len(),
            skipped = outcome.skipped.len(),
            errors = outcome.errors.len(),
            "Data sync finished"
        );
        outcome
    }

    /// Copy a named volume through an ephemeral helper container.
    ///
    /// The source volume is mounted read-only; the target volume is
    /// created first so the copy always has somewhere to land.
    async fn copy_named_volume(
        &self,
        source: &SyncEndpoint,
        target: &SyncEndpoint,
        logical_name: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        let source_volume = Self::qualified_volume(&source.workspace, logical_name);
        let target_volume = Self::qualified_volume(&target.workspace, logical_name);

        // Deliberate existence probe rather than letting the copy fail.
        if !self.volume_exists(&source_volume).await? {
            return Err(CanopyError::VolumeMissing {
                volume: source_volume,
            });
        }

        self.run_checked(
            self.runtime
                .command(["volume", "create", target_volume.as_str()]),
        )
        .await?;

        let total = self.named_volume_size(&source_volume).await.unwrap_or(0);
        report(progress, logical_name, 0, total);

        let from_mount = format!("{source_volume}:/from:ro");
        let to_mount = format!("{target_volume}:/to");
        let copy_args = self.runtime.command([
            "run",
            "--rm",
            "-v",
            from_mount.as_str(),
            "-v",
            to_mount.as_str(),
            HELPER_IMAGE,
            "sh",
            "-c",
            "cp -a /from/. /to/",
        ]);
        self.run_checked(copy_args).await.map_err(|e| {
            CanopyError::VolumeCopyFailed {
                volume: logical_name.to_string(),
                reason: e.to_string(),
            }
        })?;

        report(progress, logical_name, total, total);
        debug!(
            category = "datasync",
            volume = logical_name,
            bytes = total,
            "Copied named volume"
        );
        Ok(())
    }

    /// Copy a bind-mount directory on the host.
    ///
    /// Bind sources are workspace-relative; each side resolves under its
    /// own workspace path. Prefers rsync when present, falls back to a
    /// portable recursive copy.
    async fn copy_bind_mount(
        &self,
        source: &SyncEndpoint,
        target: &SyncEndpoint,
        logical_name: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        let relative = Path::new(logical_name);
        if relative.is_absolute() {
            return Err(CanopyError::VolumeCopyFailed {
                volume: logical_name.to_string(),
                reason: "bind mount is not workspace-relative".to_string(),
            });
        }

        let source_path = source.path.join(relative);
        let target_path = target.path.join(relative);

        if !source_path.exists() {
            return Err(CanopyError::VolumeMissing {
                volume: source_path.display().to_string(),
            });
        }

        tokio::fs::create_dir_all(&target_path).await?;

        let total = directory_size(&source_path);
        report(progress, logical_name, 0, total);

        if which::which("rsync").is_ok() {
            let status = Command::new("rsync")
                .arg("-a")
                .arg(format!("{}/", source_path.display()))
                .arg(&target_path)
                .output()
                .await?;
            if !status.status.success() {
                return Err(CanopyError::VolumeCopyFailed {
                    volume: logical_name.to_string(),
                    reason: String::from_utf8_lossy(&status.stderr).trim().to_string(),
                });
            }
        } else {
            let from = source_path.clone();
            let to = target_path.clone();
            tokio::task::spawn_blocking(move || copy_dir_recursive(&from, &to))
                .await
                .map_err(|e| CanopyError::Internal(e.to_string()))?
                .map_err(|e| CanopyError::VolumeCopyFailed {
                    volume: logical_name.to_string(),
                    reason: e.to_string(),
                })?;
        }

        report(progress, logical_name, total, total);
        debug!(
            category = "datasync",
            volume = logical_name,
            bytes = total,
            "Copied bind mount"
        );
        Ok(())
    }

    /// Destructive remove-then-recreate of a single named volume.
    ///
    /// Removal of an absent volume must not fail the operation; the
    /// create always runs.
    pub async fn reset_volume(&self, workspace: &str, logical_name: &str) -> Result<()> {
        let volume = Self::qualified_volume(workspace, logical_name);

        let rm = self
            .run(self.runtime.command(["volume", "rm", "-f", volume.as_str()]))
            .await?;
        if !rm.status.success() {
            debug!(
                category = "datasync",
                volume = %volume,
                "Volume removal failed (likely absent), recreating anyway"
            );
        }

        self.run_checked(self.runtime.command(["volume", "create", volume.as_str()]))
            .await?;
        info!(category = "datasync", volume = %volume, "Reset volume");
        Ok(())
    }

    async fn volume_exists(&self, volume: &str) -> Result<bool> {
        let out = self
            .run(self.runtime.command(["volume", "inspect", volume]))
            .await?;
        Ok(out.status.success())
    }

    /// Disk usage of a named volume, via `du -sb` in the helper image.
    async fn named_volume_size(&self, volume: &str) -> Result<u64> {
        let probe_mount = format!("{volume}:/probe:ro");
        let args = self.runtime.command([
            "run",
            "--rm",
            "-v",
            probe_mount.as_str(),
            HELPER_IMAGE,
            "du",
            "-sb",
            "/probe",
        ]);
        let out = self.run(args).await?;
        if !out.status.success() {
            return Ok(0);
        }
        Ok(parse_du_output(&String::from_utf8_lossy(&out.stdout)).unwrap_or(0))
    }

    async fn run(&self, argv: Vec<String>) -> Result<std::process::Output> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| CanopyError::Internal("empty argv".to_string()))?;
        Ok(Command::new(program).args(args).output().await?)
    }

    async fn run_checked(&self, argv: Vec<String>) -> Result<std::process::Output> {
        let command = argv.join(" ");
        let out = self.run(argv).await?;
        if !out.status.success() {
            return Err(CanopyError::RuntimeCommandFailed {
                command,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(out)
    }
}

fn report(progress: Option<&ProgressFn>, volume: &str, copied: u64, total: u64) {
    if let Some(cb) = progress {
        cb(volume, copied, total);
    }
}

/// Apply the filter pipeline: skip-all, then include, then exclude.
/// Returns `(to_copy, skipped)` preserving input order.
fn partition_volumes(
    volumes: &[VolumeSpec],
    filter: &SyncFilter,
) -> (Vec<VolumeSpec>, Vec<String>) {
    if filter.skip_all {
        return (
            Vec::new(),
            volumes.iter().map(|v| v.logical_name.clone()).collect(),
        );
    }

    let mut to_copy = Vec::new();
    let mut skipped = Vec::new();
    for volume in volumes {
        let included = filter
            .include
            .as_ref()
            .map(|list| list.contains(&volume.logical_name))
            .unwrap_or(true);
        let excluded = filter.exclude.contains(&volume.logical_name);
        if included && !excluded {
            to_copy.push(volume.clone());
        } else {
            skipped.push(volume.logical_name.clone());
        }
    }
    (to_copy, skipped)
}

/// First field of `du -sb` output
fn parse_du_output(output: &str) -> Option<u64> {
    output.split_whitespace().next()?.parse().ok()
}

/// Total apparent size of a directory tree
fn directory_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

/// Portable recursive copy preserving unix permissions.
fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
        // Symlinks inside bind mounts are intentionally not followed.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::VolumeSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn volumes() -> Vec<VolumeSpec> {
        vec![
            VolumeSpec::named("postgres-data"),
            VolumeSpec::named("redis-data"),
            VolumeSpec::named("minio-data"),
        ]
    }

    #[test]
    fn test_include_then_exclude_filter() {
        let filter = SyncFilter {
            skip_all: false,
            include: Some(vec!["postgres-data".to_string(), "redis-data".to_string()]),
            exclude: vec!["redis-data".to_string()],
        };
        let (to_copy, skipped) = partition_volumes(&volumes(), &filter);

        let copied: Vec<_> = to_copy.iter().map(|v| v.logical_name.as_str()).collect();
        assert_eq!(copied, vec!["postgres-data"]);
        assert_eq!(skipped, vec!["redis-data", "minio-data"]);
    }

    #[test]
    fn test_skip_all_skips_everything() {
        let filter = SyncFilter::skip_all();
        let (to_copy, skipped) = partition_volumes(&volumes(), &filter);
        assert!(to_copy.is_empty());
        assert_eq!(skipped.len(), 3);
    }

    #[test]
    fn test_no_filters_copies_everything() {
        let filter = SyncFilter::default();
        let (to_copy, skipped) = partition_volumes(&volumes(), &filter);
        assert_eq!(to_copy.len(), 3);
        assert!(skipped.is_empty());
    }

    #[tokio::test]
    async fn test_skip_all_never_touches_runtime_or_filesystem() {
        // The runtime argv here points at a program that does not exist;
        // if sync tried to spawn anything the outcome would carry errors.
        let runtime = Arc::new(crate::runtime::ContainerRuntime::new(
            crate::runtime::RuntimeKind::Docker,
            crate::runtime::ComposeKind::DockerComposeV2,
            false,
        ));
        let sync = DataSync::new(runtime);
        let tmp = TempDir::new().unwrap();
        let source = SyncEndpoint::new("main", tmp.path().join("main"));
        let target = SyncEndpoint::new("feat", tmp.path().join("feat"));

        let outcome = sync
            .sync(&source, &target, &volumes(), &SyncFilter::skip_all(), None)
            .await;
        assert!(outcome.copied.is_empty());
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.skipped.len(), 3);
        // Nothing was created on disk either.
        assert!(!tmp.path().join("feat").exists());
    }

    #[tokio::test]
    async fn test_bind_mount_copy_and_progress() {
        let runtime = Arc::new(crate::runtime::ContainerRuntime::new(
            crate::runtime::RuntimeKind::Docker,
            crate::runtime::ComposeKind::DockerComposeV2,
            false,
        ));
        let sync = DataSync::new(runtime);

        let tmp = TempDir::new().unwrap();
        let source_dir = tmp.path().join("main");
        let target_dir = tmp.path().join("feat");
        std::fs::create_dir_all(source_dir.join("data/nested")).unwrap();
        std::fs::write(source_dir.join("data/a.txt"), "alpha").unwrap();
        std::fs::write(source_dir.join("data/nested/b.txt"), "beta").unwrap();

        let reports: Arc<StdMutex<Vec<(String, u64, u64)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let reports_cb = Arc::clone(&reports);
        let progress: ProgressFn = Arc::new(move |volume, copied, total| {
            reports_cb
                .lock()
                .unwrap()
                .push((volume.to_string(), copied, total));
        });

        let outcome = sync
            .sync(
                &SyncEndpoint::new("main", &source_dir),
                &SyncEndpoint::new("feat", &target_dir),
                &[VolumeSpec::bind("data")],
                &SyncFilter::default(),
                Some(progress),
            )
            .await;

        assert_eq!(outcome.copied, vec!["data"]);
        assert!(outcome.errors.is_empty());
        assert_eq!(
            std::fs::read_to_string(target_dir.join("data/a.txt")).unwrap(),
            "alpha"
        );
        assert_eq!(
            std::fs::read_to_string(target_dir.join("data/nested/b.txt")).unwrap(),
            "beta"
        );

        let reports = reports.lock().unwrap();
        assert!(reports.len() >= 2);
        let total = 5 + 4; // alpha + beta
        assert_eq!(reports.first().unwrap(), &("data".to_string(), 0, total));
        assert_eq!(
            reports.last().unwrap(),
            &("data".to_string(), total, total)
        );
    }

    #[tokio::test]
    async fn test_missing_bind_source_is_collected_not_fatal() {
        let runtime = Arc::new(crate::runtime::ContainerRuntime::new(
            crate::runtime::RuntimeKind::Docker,
            crate::runtime::ComposeKind::DockerComposeV2,
            false,
        ));
        let sync = DataSync::new(runtime);

        let tmp = TempDir::new().unwrap();
        let source_dir = tmp.path().join("main");
        let target_dir = tmp.path().join("feat");
        std::fs::create_dir_all(source_dir.join("present")).unwrap();
        std::fs::write(source_dir.join("present/x"), "x").unwrap();

        let outcome = sync
            .sync(
                &SyncEndpoint::new("main", &source_dir),
                &SyncEndpoint::new("feat", &target_dir),
                &[VolumeSpec::bind("absent"), VolumeSpec::bind("present")],
                &SyncFilter::default(),
                None,
            )
            .await;

        // The missing sibling is an error; the present one still copied.
        assert_eq!(outcome.copied, vec!["present"]);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].volume, "absent");
        assert!(outcome.errors[0].error.contains("does not exist"));
    }

    #[test]
    fn test_qualified_volume_prefixing() {
        assert_eq!(
            DataSync::qualified_volume("feature-x", "postgres-data"),
            "feature-x_postgres-data"
        );
    }

    #[test]
    fn test_parse_du_output() {
        assert_eq!(parse_du_output("4096\t/probe\n"), Some(4096));
        assert_eq!(parse_du_output("123 /probe"), Some(123));
        assert_eq!(parse_du_output("garbage"), None);
        assert_eq!(parse_du_output(""), None);
    }

    #[test]
    fn test_directory_size() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a"), "12345").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b"), "123").unwrap();
        assert_eq!(directory_size(tmp.path()), 8);
    }

    #[test]
    fn test_progress_counter_smoke() {
        // ProgressFn is object-safe and clonable through Arc.
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        let cb: ProgressFn = Arc::new(move |_, _, _| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });
        report(Some(&cb), "v", 0, 0);
        report(Some(&cb), "v", 1, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
