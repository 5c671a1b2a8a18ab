//! Worktree Coordinator: couples worktree existence to ticket state, one
//! worktree per ticket, at `<base>/<ticket id>` on a branch named after the
//! ticket.

use crate::cancel::Scope;
use crate::error::Result;
use crate::git::cli::GitAdapter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

pub struct WorktreeCoordinator {
    repo_root: PathBuf,
    base_dir: PathBuf,
    git_timeout_secs: u64,
}

impl WorktreeCoordinator {
    pub fn new(repo_root: PathBuf, base_dir: PathBuf, git_timeout_secs: u64) -> Self {
        Self {
            repo_root,
            base_dir,
            git_timeout_secs,
        }
    }

    pub fn path_for(&self, ticket_id: &str) -> PathBuf {
        self.base_dir.join(ticket_id)
    }

    /// `Ensure(ticket, base_branch) -> (path, branch, created?)`.
    #[instrument(skip(self, scope), fields(ticket_id, base_branch))]
    pub async fn ensure(
        &self,
        ticket_id: &str,
        base_branch: &str,
        scope: &Scope,
    ) -> Result<(PathBuf, String, bool)> {
        let branch = ticket_id.to_string();
        let path = self.path_for(ticket_id);

        let existing = self.locate_by_branch(&branch, scope).await?;
        if let Some(existing_path) = existing {
            if existing_path == path {
                debug!("worktree already registered, reusing");
                return Ok((path, branch, false));
            }
        }

        if path.exists() {
            // Registered path vanished from git's view but the directory is
            // still there; prune stale metadata before retrying.
            GitAdapter::prune_worktrees(&self.repo_root, self.git_timeout_secs, scope).await?;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        GitAdapter::add_worktree(
            &self.repo_root,
            &path,
            &branch,
            Some(base_branch),
            self.git_timeout_secs,
            scope,
        )
        .await?;

        info!(path = %path.display(), %branch, "worktree created");
        Ok((path, branch, true))
    }

    /// `RunInit(path)`: each configured command runs sequentially; the first
    /// non-zero exit aborts the remainder.
    #[instrument(skip(self, commands, scope), fields(path = %path.display()))]
    pub async fn run_init(
        &self,
        path: &Path,
        commands: &[String],
        total_timeout_secs: u64,
        scope: &Scope,
    ) -> Result<Vec<String>> {
        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            let output =
                GitAdapter::exec_in_dir(path, command, total_timeout_secs, scope).await?;
            outputs.push(output);
        }
        Ok(outputs)
    }

    /// `Locate(ticket) -> path?`.
    pub async fn locate(&self, ticket_id: &str, scope: &Scope) -> Result<Option<PathBuf>> {
        self.locate_by_branch(ticket_id, scope).await
    }

    async fn locate_by_branch(&self, branch: &str, scope: &Scope) -> Result<Option<PathBuf>> {
        let worktrees =
            GitAdapter::list_worktrees(&self.repo_root, self.git_timeout_secs, scope).await?;
        Ok(worktrees
            .into_iter()
            .find(|w| w.branch.as_deref() == Some(branch))
            .map(|w| PathBuf::from(w.path)))
    }

    /// `Remove(ticket, force) -> removed?`.
    #[instrument(skip(self, scope), fields(ticket_id, force))]
    pub async fn remove(&self, ticket_id: &str, force: bool, scope: &Scope) -> Result<bool> {
        let Some(path) = self.locate(ticket_id, scope).await? else {
            // Nothing registered; still sweep a stale directory if present.
            let path = self.path_for(ticket_id);
            if path.exists() {
                tokio::fs::remove_dir_all(&path).await?;
                return Ok(true);
            }
            return Ok(false);
        };

        GitAdapter::remove_worktree(&self.repo_root, &path, force, self.git_timeout_secs, scope)
            .await?;

        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }

        Ok(true)
    }
}
