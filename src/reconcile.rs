//! Reconciler: diagnoses orphaned worktrees, stale branches and a broken
//! current-ticket symlink, with a dry-run and a destructive `AutoCleanup`
//! mode.

use crate::cancel::Scope;
use crate::config::Config;
use crate::error::Result;
use crate::git::{GitAdapter, WorktreeCoordinator};
use crate::ticket::{is_valid_id, ListFilter, Status, TicketStore};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, instrument};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileStats {
    pub orphaned_worktrees: Vec<String>,
    pub stale_branches: Vec<String>,
    pub broken_symlink: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub removed_worktrees: Vec<String>,
    pub deleted_branches: Vec<String>,
    pub skipped_unmerged_branches: Vec<String>,
}

pub struct Reconciler {
    repo_root: PathBuf,
    config: Config,
}

impl Reconciler {
    pub fn new(repo_root: PathBuf, config: Config) -> Self {
        Self { repo_root, config }
    }

    fn store(&self) -> TicketStore {
        TicketStore::new(self.repo_root.clone(), self.config.clone())
    }

    fn coordinator(&self) -> WorktreeCoordinator {
        WorktreeCoordinator::new(
            self.repo_root.clone(),
            self.config.worktree_base_dir(&self.repo_root),
            self.config.timeouts.git_secs(),
        )
    }

    /// `Stats()`: orphaned worktrees, stale branches, broken symlinks —
    /// read-only, never mutates state.
    #[instrument(skip(self, scope))]
    pub async fn stats(&self, scope: &Scope) -> Result<ReconcileStats> {
        let timeout = self.config.timeouts.git_secs();
        let store = self.store();
        let doing_ids: Vec<String> = store
            .list(ListFilter::Doing)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let done_ids: Vec<String> = store
            .list(ListFilter::Done)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();

        let worktrees = GitAdapter::list_worktrees(&self.repo_root, timeout, scope).await?;
        let orphaned_worktrees: Vec<String> = worktrees
            .iter()
            .filter_map(|w| w.branch.clone())
            .filter(|branch| is_valid_id(branch) && !doing_ids.contains(branch))
            .collect();

        let branches = GitAdapter::list_branches(&self.repo_root, timeout, scope).await?;
        let stale_branches: Vec<String> = branches
            .into_iter()
            .filter(|branch| is_valid_id(branch) && done_ids.contains(branch))
            .collect();

        let broken_symlink = self.symlink_is_broken();

        Ok(ReconcileStats {
            orphaned_worktrees,
            stale_branches,
            broken_symlink,
        })
    }

    fn symlink_is_broken(&self) -> bool {
        let link = Config::current_ticket_path(&self.repo_root);
        match std::fs::symlink_metadata(&link) {
            Ok(_) => std::fs::metadata(&link).is_err(),
            Err(_) => false,
        }
    }

    /// `AutoCleanup(dry_run)`. Never deletes an unmerged branch unless
    /// `force` is set; always reports what it would do even when `dry_run`
    /// suppresses the actual mutation.
    #[instrument(skip(self, scope), fields(dry_run, force))]
    pub async fn auto_cleanup(
        &self,
        dry_run: bool,
        force: bool,
        scope: &Scope,
    ) -> Result<CleanupReport> {
        let stats = self.stats(scope).await?;
        let timeout = self.config.timeouts.git_secs();
        let coordinator = self.coordinator();

        let mut report = CleanupReport {
            dry_run,
            ..Default::default()
        };

        for branch in &stats.orphaned_worktrees {
            if dry_run {
                report.removed_worktrees.push(branch.clone());
                continue;
            }
            if coordinator.remove(branch, force, scope).await? {
                report.removed_worktrees.push(branch.clone());
            }
        }

        for branch in &stats.stale_branches {
            if dry_run {
                report.deleted_branches.push(branch.clone());
                continue;
            }
            match GitAdapter::delete_branch(&self.repo_root, branch, force, timeout, scope).await {
                Ok(()) => report.deleted_branches.push(branch.clone()),
                Err(crate::error::Error::GitError { stderr, .. })
                    if !force && stderr.to_lowercase().contains("not fully merged") =>
                {
                    report.skipped_unmerged_branches.push(branch.clone());
                }
                Err(err) => return Err(err),
            }
        }

        if stats.broken_symlink && !dry_run {
            self.store().set_current(None).await?;
        }

        info!(
            dry_run,
            removed = report.removed_worktrees.len(),
            deleted = report.deleted_branches.len(),
            "reconciler auto-cleanup finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleEngine;
    use tempfile::TempDir;
    use tokio::process::Command as TokioCommand;

    async fn init_repo() -> TempDir {
        let temp = TempDir::new().unwrap();
        for args in [
            vec!["init", "-q", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            TokioCommand::new("git")
                .args(&args)
                .current_dir(temp.path())
                .status()
                .await
                .unwrap();
        }
        Config::init_skeleton(temp.path()).unwrap();
        TokioCommand::new("git")
            .args(["add", "-A"])
            .current_dir(temp.path())
            .status()
            .await
            .unwrap();
        TokioCommand::new("git")
            .args(["commit", "-q", "-m", "initial"])
            .current_dir(temp.path())
            .status()
            .await
            .unwrap();
        temp
    }

    #[tokio::test]
    async fn stats_reports_no_defects_on_fresh_repo() {
        let temp = init_repo().await;
        let config = Config::load(temp.path(), None).unwrap();
        let reconciler = Reconciler::new(temp.path().to_path_buf(), config);
        let scope = Scope::root();

        let stats = reconciler.stats(&scope).await.unwrap();
        assert!(stats.orphaned_worktrees.is_empty());
        assert!(stats.stale_branches.is_empty());
        assert!(!stats.broken_symlink);
    }

    #[tokio::test]
    async fn stats_flags_stale_branch_after_cleanup_skipped() {
        let temp = init_repo().await;
        let mut config = Config::load(temp.path(), None).unwrap();
        config.worktree.base_dir = "../wt-reconcile-test".to_string();
        let engine = LifecycleEngine::new(temp.path().to_path_buf(), config.clone());
        let scope = Scope::root();

        let ticket = engine
            .new_ticket("stale-check", "desc", None, &scope)
            .await
            .unwrap();
        engine.start(&ticket.id, false, &scope).await.unwrap();
        engine
            .close(temp.path(), Some(&ticket.id), true, None, &scope)
            .await
            .unwrap();

        // The close commit lives on the feature branch until merged
        // upstream; the reconciler only ever reads the main repo's tree.
        TokioCommand::new("git")
            .args(["merge", "-q", "--no-ff", "-m", "merge", &ticket.id])
            .current_dir(temp.path())
            .status()
            .await
            .unwrap();

        let reconciler = Reconciler::new(temp.path().to_path_buf(), config);
        let stats = reconciler.stats(&scope).await.unwrap();
        assert!(stats.stale_branches.contains(&ticket.id));

        let report = reconciler.auto_cleanup(false, true, &scope).await.unwrap();
        assert!(report.deleted_branches.contains(&ticket.id));

        let _ = tokio::fs::remove_dir_all(temp.path().join("../wt-reconcile-test")).await;
    }

    #[tokio::test]
    async fn dry_run_cleanup_does_not_mutate() {
        let temp = init_repo().await;
        let mut config = Config::load(temp.path(), None).unwrap();
        config.worktree.base_dir = "../wt-reconcile-dry-test".to_string();
        let engine = LifecycleEngine::new(temp.path().to_path_buf(), config.clone());
        let scope = Scope::root();

        let ticket = engine
            .new_ticket("dry-run-check", "desc", None, &scope)
            .await
            .unwrap();
        engine.start(&ticket.id, false, &scope).await.unwrap();
        engine
            .close(temp.path(), Some(&ticket.id), true, None, &scope)
            .await
            .unwrap();

        TokioCommand::new("git")
            .args(["merge", "-q", "--no-ff", "-m", "merge", &ticket.id])
            .current_dir(temp.path())
            .status()
            .await
            .unwrap();

        let reconciler = Reconciler::new(temp.path().to_path_buf(), config.clone());
        let report = reconciler.auto_cleanup(true, true, &scope).await.unwrap();
        assert!(report.dry_run);
        assert!(report.deleted_branches.contains(&ticket.id));

        assert!(GitAdapter::branch_exists(temp.path(), &ticket.id, 5, &scope)
            .await
            .unwrap());

        let _ = tokio::fs::remove_dir_all(temp.path().join("../wt-reconcile-dry-test")).await;
    }
}
