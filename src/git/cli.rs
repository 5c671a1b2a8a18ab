//! Git CLI wrapper: translates high-level requests into `git` subprocess
//! invocations bounded by a deadline and an ambient cancellation scope. One
//! `async fn` per git verb, all routed through a single private runner.

use crate::cancel::Scope;
use crate::error::{Error, Result};
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeEntry {
    pub path: String,
    pub branch: Option<String>,
    pub head: Option<String>,
}

/// Thin async wrapper around the `git` binary. Stateless: every method takes
/// the repository path, a timeout and a cancellation scope explicitly.
pub struct GitAdapter;

impl GitAdapter {
    async fn run(
        args: &[&str],
        cwd: &Path,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<String> {
        debug!(?args, cwd = %cwd.display(), "running git");

        let mut child = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::select! {
            biased;
            _ = scope.cancelled() => {
                let _ = child.kill().await;
                return Err(Error::Cancelled);
            }
            result = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()) => {
                match result {
                    Ok(output) => output?,
                    Err(_elapsed) => return Err(Error::Cancelled),
                }
            }
        };

        if !output.status.success() {
            return Err(Error::GitError {
                command: args.join(" "),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_silent(args: &[&str], cwd: &Path, timeout_secs: u64, scope: &Scope) -> Result<()> {
        Self::run(args, cwd, timeout_secs, scope).await?;
        Ok(())
    }

    #[instrument(skip(scope), fields(path = %path.display()))]
    pub async fn repo_root(path: &Path, timeout_secs: u64, scope: &Scope) -> Result<String> {
        Self::run(&["rev-parse", "--show-toplevel"], path, timeout_secs, scope).await
    }

    /// The shared `.git` directory, resolvable from any worktree. Its parent
    /// is the main repository root regardless of whether `path` is itself a
    /// worktree, which is how the Lifecycle Engine locates the canonical
    /// `tickets/` tree when a command is invoked from within a doing worktree.
    #[instrument(skip(scope), fields(path = %path.display()))]
    pub async fn main_repo_root(
        path: &Path,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<std::path::PathBuf> {
        let raw = Self::run(&["rev-parse", "--git-common-dir"], path, timeout_secs, scope).await?;
        let common_dir = std::path::PathBuf::from(&raw);
        let common_dir = if common_dir.is_absolute() {
            common_dir
        } else {
            path.join(common_dir)
        };
        let root = common_dir.parent().unwrap_or(&common_dir).to_path_buf();
        Ok(std::fs::canonicalize(&root).unwrap_or(root))
    }

    #[instrument(skip(scope), fields(path = %path.display()))]
    pub async fn current_branch(path: &Path, timeout_secs: u64, scope: &Scope) -> Result<String> {
        Self::run(
            &["rev-parse", "--abbrev-ref", "HEAD"],
            path,
            timeout_secs,
            scope,
        )
        .await
    }

    /// `git status --porcelain`; non-empty means dirty.
    #[instrument(skip(scope), fields(path = %path.display()))]
    pub async fn is_dirty(path: &Path, timeout_secs: u64, scope: &Scope) -> Result<bool> {
        let output = Self::run(&["status", "--porcelain"], path, timeout_secs, scope).await?;
        Ok(!output.is_empty())
    }

    /// The offending paths from a dirty status, for `DirtyWorkingTree`'s message.
    #[instrument(skip(scope), fields(path = %path.display()))]
    pub async fn dirty_paths(path: &Path, timeout_secs: u64, scope: &Scope) -> Result<Vec<String>> {
        let output = Self::run(&["status", "--porcelain"], path, timeout_secs, scope).await?;
        Ok(output
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.trim().to_string())
            .collect())
    }

    /// Local branch names, used by the Reconciler to find stale branches
    /// that no longer correspond to a `doing` ticket.
    #[instrument(skip(scope), fields(path = %path.display()))]
    pub async fn list_branches(
        path: &Path,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<Vec<String>> {
        let output = Self::run(
            &["for-each-ref", "--format=%(refname:short)", "refs/heads/"],
            path,
            timeout_secs,
            scope,
        )
        .await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    #[instrument(skip(scope), fields(path = %path.display(), name))]
    pub async fn branch_exists(
        path: &Path,
        name: &str,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<bool> {
        let reference = format!("refs/heads/{name}");
        match Self::run(
            &["show-ref", "--verify", "--quiet", &reference],
            path,
            timeout_secs,
            scope,
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(Error::GitError { exit_code, .. }) if exit_code == 1 => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(scope), fields(path = %path.display(), name, from))]
    pub async fn create_branch(
        path: &Path,
        name: &str,
        from: &str,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<()> {
        Self::run_silent(&["branch", name, from], path, timeout_secs, scope).await
    }

    #[instrument(skip(scope), fields(path = %path.display(), name, force))]
    pub async fn delete_branch(
        path: &Path,
        name: &str,
        force: bool,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        Self::run_silent(&["branch", flag, name], path, timeout_secs, scope).await
    }

    #[instrument(skip(scope), fields(path = %path.display(), name))]
    pub async fn checkout_branch(
        path: &Path,
        name: &str,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<()> {
        Self::run_silent(&["checkout", name], path, timeout_secs, scope).await
    }

    /// Stage `paths` (or everything when empty) and commit. Requires a
    /// non-empty index; a no-op `git commit` failing is surfaced as
    /// `GitError`, never swallowed.
    #[instrument(skip(scope), fields(path = %path.display()))]
    pub async fn commit(
        path: &Path,
        message: &str,
        paths: &[&str],
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<()> {
        if paths.is_empty() {
            Self::run_silent(&["add", "-A"], path, timeout_secs, scope).await?;
        } else {
            let mut args = vec!["add"];
            args.extend_from_slice(paths);
            Self::run_silent(&args, path, timeout_secs, scope).await?;
        }
        Self::run_silent(&["commit", "-m", message], path, timeout_secs, scope).await
    }

    #[instrument(skip(scope), fields(path = %path.display(), a, b))]
    pub async fn merge_base(
        path: &Path,
        a: &str,
        b: &str,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<String> {
        Self::run(&["merge-base", a, b], path, timeout_secs, scope).await
    }

    /// `(ahead, behind)` of `branch` relative to `reference`.
    #[instrument(skip(scope), fields(path = %path.display(), branch, reference))]
    pub async fn ahead_behind(
        path: &Path,
        branch: &str,
        reference: &str,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<(u32, u32)> {
        let range = format!("{reference}...{branch}");
        let output = Self::run(
            &["rev-list", "--left-right", "--count", &range],
            path,
            timeout_secs,
            scope,
        )
        .await?;
        let mut parts = output.split_whitespace();
        let behind = parts.next().unwrap_or("0").parse().unwrap_or(0);
        let ahead = parts.next().unwrap_or("0").parse().unwrap_or(0);
        Ok((ahead, behind))
    }

    #[instrument(skip(scope), fields(repo_path = %repo_path.display()))]
    pub async fn list_worktrees(
        repo_path: &Path,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<Vec<WorktreeEntry>> {
        let output = Self::run(
            &["worktree", "list", "--porcelain"],
            repo_path,
            timeout_secs,
            scope,
        )
        .await?;

        let mut entries = Vec::new();
        let mut current: Option<WorktreeEntry> = None;

        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if let Some(entry) = current.take() {
                    entries.push(entry);
                }
                current = Some(WorktreeEntry {
                    path: path.to_string(),
                    branch: None,
                    head: None,
                });
            } else if let Some(head) = line.strip_prefix("HEAD ") {
                if let Some(entry) = current.as_mut() {
                    entry.head = Some(head.to_string());
                }
            } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                if let Some(entry) = current.as_mut() {
                    entry.branch = Some(branch.to_string());
                }
            }
        }
        if let Some(entry) = current {
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Implements the branch-creation rule: attach to an existing branch
    /// with plain `git worktree add <path> <branch>`, or create it with
    /// `-b <branch> [<base>]` when it does not yet exist.
    #[instrument(skip(scope), fields(repo_path = %repo_path.display(), worktree_path = %worktree_path.display(), branch, base_branch))]
    pub async fn add_worktree(
        repo_path: &Path,
        worktree_path: &Path,
        branch: &str,
        base_branch: Option<&str>,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<()> {
        let worktree_str = worktree_path.to_string_lossy().into_owned();
        let exists = Self::branch_exists(repo_path, branch, timeout_secs, scope).await?;

        if exists {
            Self::run_silent(
                &["worktree", "add", &worktree_str, branch],
                repo_path,
                timeout_secs,
                scope,
            )
            .await
        } else {
            let mut args = vec!["worktree", "add", "-b", branch, &worktree_str];
            if let Some(base) = base_branch {
                args.push(base);
            }
            Self::run_silent(&args, repo_path, timeout_secs, scope).await
        }
    }

    #[instrument(skip(scope), fields(repo_path = %repo_path.display(), worktree_path = %worktree_path.display(), force))]
    pub async fn remove_worktree(
        repo_path: &Path,
        worktree_path: &Path,
        force: bool,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<()> {
        let worktree_str = worktree_path.to_string_lossy();
        if force {
            Self::run_silent(
                &["worktree", "remove", "--force", &worktree_str],
                repo_path,
                timeout_secs,
                scope,
            )
            .await
        } else {
            Self::run_silent(
                &["worktree", "remove", &worktree_str],
                repo_path,
                timeout_secs,
                scope,
            )
            .await
        }
    }

    #[instrument(skip(scope), fields(repo_path = %repo_path.display()))]
    pub async fn prune_worktrees(repo_path: &Path, timeout_secs: u64, scope: &Scope) -> Result<()> {
        Self::run_silent(&["worktree", "prune"], repo_path, timeout_secs, scope).await
    }

    /// Run an arbitrary command inside `dir` (used for `worktree.init_commands`),
    /// streaming combined output back for the caller to log.
    #[instrument(skip(scope), fields(dir = %dir.display(), command))]
    pub async fn exec_in_dir(
        dir: &Path,
        command: &str,
        timeout_secs: u64,
        scope: &Scope,
    ) -> Result<String> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::select! {
            biased;
            _ = scope.cancelled() => {
                let _ = child.kill().await;
                return Err(Error::Cancelled);
            }
            result = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()) => {
                match result {
                    Ok(output) => output?,
                    Err(_elapsed) => return Err(Error::Cancelled),
                }
            }
        };

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        if !output.status.success() {
            return Err(Error::InitFailed {
                command: command.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
            });
        }

        Ok(combined)
    }
}
