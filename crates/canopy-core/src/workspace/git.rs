//! Git CLI driver
//!
//! All git interaction goes through the `git` executable as a
//! subprocess; canopy carries no embedded git implementation.

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use super::types::GitState;
use crate::error::{CanopyError, Result};

/// One entry of `git worktree list --porcelain`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
}

/// Drives git for one repository.
pub struct GitCli {
    repo_root: PathBuf,
}

impl GitCli {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    async fn run_in(&self, dir: &Path, args: &[&str]) -> Result<String> {
        debug!(category = "workspace", ?args, "Running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CanopyError::GitNotFound
                } else {
                    CanopyError::Io(e)
                }
            })?;

        if !output.status.success() {
            return Err(CanopyError::GitCommandFailed {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        self.run_in(&self.repo_root, args).await
    }

    /// `git worktree add`, passing `-b` and a start point when creating
    /// a new branch, plain when attaching to an existing branch.
    pub async fn worktree_add(
        &self,
        path: &Path,
        branch: &str,
        from_branch: Option<&str>,
        new_branch: bool,
    ) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "add"];
        if new_branch {
            args.extend(["-b", branch, path_str.as_str()]);
            if let Some(from) = from_branch {
                args.push(from);
            }
        } else {
            args.extend([path_str.as_str(), branch]);
        }
        self.run(&args).await?;
        Ok(())
    }

    /// `git worktree remove --force`. A worktree that is already gone
    /// is treated as removed.
    pub async fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        match self
            .run(&["worktree", "remove", "--force", path_str.as_str()])
            .await
        {
            Ok(_) => Ok(()),
            Err(CanopyError::GitCommandFailed { stderr, .. })
                if stderr.contains("is not a working tree")
                    || stderr.contains("No such file or directory") =>
            {
                debug!(
                    category = "workspace",
                    path = %path.display(),
                    "Worktree already absent"
                );
                // Drop any stale bookkeeping git still holds.
                let _ = self.run(&["worktree", "prune"]).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Parse `git worktree list --porcelain`.
    pub async fn worktree_list(&self) -> Result<Vec<WorktreeInfo>> {
        let output = self.run(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_porcelain(&output))
    }

    /// Whether a local branch exists.
    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{branch}");
        let result = self
            .run(&["show-ref", "--verify", "--quiet", refname.as_str()])
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(CanopyError::GitCommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Git working-state for a checkout: uncommitted changes plus
    /// ahead/behind relative to its upstream.
    pub async fn state_of(&self, path: &Path) -> GitState {
        let has_uncommitted = self
            .run_in(path, &["status", "--porcelain"])
            .await
            .map(|out| !out.trim().is_empty())
            .unwrap_or(false);

        let (ahead, behind) = match self
            .run_in(
                path,
                &["rev-list", "--left-right", "--count", "@{upstream}...HEAD"],
            )
            .await
        {
            Ok(out) => parse_ahead_behind(&out),
            // No upstream configured: nothing to be ahead/behind of.
            Err(_) => (0, 0),
        };

        GitState {
            has_uncommitted,
            has_unpushed: ahead > 0,
            ahead,
            behind,
        }
    }
}

/// Parse porcelain worktree output: blank-line separated stanzas of
/// `worktree <path>` / `HEAD <sha>` / `branch <ref>` / `bare` /
/// `detached` lines.
pub fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeInfo> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                bare: false,
                detached: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(
                branch
                    .strip_prefix("refs/heads/")
                    .unwrap_or(branch)
                    .to_string(),
            );
        } else if line == "bare" {
            entry.bare = true;
        } else if line == "detached" {
            entry.detached = true;
        }
    }
    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    entries
}

/// Parse `rev-list --left-right --count` output: `<behind>\t<ahead>`.
fn parse_ahead_behind(output: &str) -> (usize, usize) {
    let mut parts = output.split_whitespace();
    let behind = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    let ahead = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    (ahead, behind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_porcelain_main_and_worktrees() {
        let output = "\
worktree /src/app
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /src/app/.worktrees/feature-login
HEAD 2222222222222222222222222222222222222222
branch refs/heads/feature/login

worktree /src/app/.worktrees/spike
HEAD 3333333333333333333333333333333333333333
detached
";
        let entries = parse_worktree_porcelain(output);
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].path, PathBuf::from("/src/app"));
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert!(!entries[0].detached);

        assert_eq!(entries[1].branch.as_deref(), Some("feature/login"));

        assert!(entries[2].detached);
        assert!(entries[2].branch.is_none());
    }

    #[test]
    fn test_parse_porcelain_bare() {
        let output = "worktree /src/app.git\nbare\n";
        let entries = parse_worktree_porcelain(output);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].bare);
    }

    #[test]
    fn test_parse_porcelain_empty() {
        assert!(parse_worktree_porcelain("").is_empty());
    }

    #[test]
    fn test_parse_ahead_behind() {
        assert_eq!(parse_ahead_behind("2\t3\n"), (3, 2));
        assert_eq!(parse_ahead_behind("0\t0"), (0, 0));
        assert_eq!(parse_ahead_behind("garbage"), (0, 0));
    }

    mod integration {
        use super::*;
        use tempfile::TempDir;

        async fn init_repo(tmp: &TempDir) -> GitCli {
            let root = tmp.path().to_path_buf();
            for args in [
                vec!["init", "-b", "main"],
                vec!["config", "user.email", "dev@example.com"],
                vec!["config", "user.name", "dev"],
            ] {
                let status = tokio::process::Command::new("git")
                    .args(&args)
                    .current_dir(&root)
                    .output()
                    .await
                    .unwrap();
                assert!(status.status.success(), "git {args:?} failed");
            }
            std::fs::write(root.join("README.md"), "seed").unwrap();
            for args in [vec!["add", "."], vec!["commit", "-m", "seed"]] {
                let status = tokio::process::Command::new("git")
                    .args(&args)
                    .current_dir(&root)
                    .output()
                    .await
                    .unwrap();
                assert!(status.status.success(), "git {args:?} failed");
            }
            GitCli::new(root)
        }

        #[tokio::test]
        async fn test_worktree_add_list_remove() {
            let tmp = TempDir::new().unwrap();
            let git = init_repo(&tmp).await;

            let wt_path = tmp.path().join(".worktrees/feature-x");
            std::fs::create_dir_all(tmp.path().join(".worktrees")).unwrap();
            git.worktree_add(&wt_path, "feature/x", Some("main"), true)
                .await
                .unwrap();

            let listed = git.worktree_list().await.unwrap();
            assert_eq!(listed.len(), 2);
            assert!(listed
                .iter()
                .any(|w| w.branch.as_deref() == Some("feature/x")));

            git.worktree_remove(&wt_path).await.unwrap();
            let listed = git.worktree_list().await.unwrap();
            assert_eq!(listed.len(), 1);

            // Removing again is a no-op.
            git.worktree_remove(&wt_path).await.unwrap();
        }

        #[tokio::test]
        async fn test_branch_exists() {
            let tmp = TempDir::new().unwrap();
            let git = init_repo(&tmp).await;
            assert!(git.branch_exists("main").await.unwrap());
            assert!(!git.branch_exists("missing").await.unwrap());
        }

        #[tokio::test]
        async fn test_state_of_detects_uncommitted() {
            let tmp = TempDir::new().unwrap();
            let git = init_repo(&tmp).await;

            let clean = git.state_of(tmp.path()).await;
            assert!(!clean.has_uncommitted);
            assert_eq!(clean.label(), "clean");

            std::fs::write(tmp.path().join("dirty.txt"), "x").unwrap();
            let dirty = git.state_of(tmp.path()).await;
            assert!(dirty.has_uncommitted);
            assert_eq!(dirty.label(), "uncommitted");
        }
    }
}
