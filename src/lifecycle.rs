//! Lifecycle Engine: the state machine proper. Every externally observable
//! command — `new`, `start`, `close`, `cleanup`, `restore` — corresponds to
//! one method here, orchestrating the Ticket Store, Git Adapter and
//! Worktree Coordinator in strict, deterministic order.

use crate::cancel::Scope;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::git::{GitAdapter, WorktreeCoordinator};
use crate::interactive::{self, DivergedBranchChoice};
use crate::ticket::{ListFilter, Status, Ticket, TicketStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    pub ticket: Ticket,
    pub worktree_path: Option<PathBuf>,
    pub source_branch: String,
    pub init_ran: bool,
    pub init_error: Option<String>,
    pub branch_recreated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupSummary {
    pub removed_worktree: bool,
    pub deleted_branch: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub current: Option<String>,
}

/// Owns only the repository root and configuration; every method derives
/// the ticket store / worktree coordinator it needs per call, since no
/// state is shared across invocations.
pub struct LifecycleEngine {
    repo_root: PathBuf,
    config: Config,
}

impl LifecycleEngine {
    pub fn new(repo_root: PathBuf, config: Config) -> Self {
        Self { repo_root, config }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn main_store(&self) -> TicketStore {
        TicketStore::new(self.repo_root.clone(), self.config.clone())
    }

    fn worktree_coordinator(&self) -> WorktreeCoordinator {
        WorktreeCoordinator::new(
            self.repo_root.clone(),
            self.config.worktree_base_dir(&self.repo_root),
            self.git_timeout(),
        )
    }

    fn git_timeout(&self) -> u64 {
        self.config.timeouts.git_secs()
    }

    /// `New(slug, parent?) -> Ticket`.
    #[instrument(skip(self, scope), fields(slug, parent))]
    pub async fn new_ticket(
        &self,
        slug: &str,
        description: &str,
        parent: Option<&str>,
        scope: &Scope,
    ) -> Result<Ticket> {
        let store = self.main_store();
        let mut ticket = store.create(slug, description, scope).await?;

        if let Some(parent_id) = parent {
            let parent_ticket = store.get(parent_id).await?;
            ticket.set_parent(&parent_ticket.id);
            store.update(&ticket, scope).await?;
        }

        Ok(ticket)
    }

    /// `Start(ticket_id) -> StartResult`.
    #[instrument(skip(self, scope), fields(id_or_prefix, force))]
    pub async fn start(&self, id_or_prefix: &str, force: bool, scope: &Scope) -> Result<StartResult> {
        let store = self.main_store();
        let mut ticket = store.get(id_or_prefix).await?;

        match ticket.derived_status() {
            Status::Doing => return Err(Error::AlreadyStarted(ticket.id)),
            Status::Done => return Err(Error::AlreadyClosed(ticket.id)),
            Status::Todo => {}
        }

        let timeout = self.git_timeout();

        let source_branch = match ticket.parent_id() {
            Some(parent_id) => {
                let parent_id = parent_id.to_string();
                if !GitAdapter::branch_exists(&self.repo_root, &parent_id, timeout, scope).await? {
                    return Err(Error::ParentBranchMissing(parent_id));
                }
                parent_id
            }
            None => self.config.git.default_branch.clone(),
        };

        // Clean-working-tree precondition always reads the main repo (spec
        // §4.D.2 step 3), ignoring this ticket's own file: `Create` never
        // commits, so the ticket being started is always "dirty" on its own
        // account; its creation rides along in the Start commit below.
        let dirty_paths = GitAdapter::dirty_paths(&self.repo_root, timeout, scope).await?;
        let blocking: Vec<String> = dirty_paths
            .into_iter()
            .filter(|p| !p.contains(ticket.id.as_str()))
            .collect();
        if !blocking.is_empty() && !force {
            return Err(Error::DirtyWorkingTree {
                paths: blocking.join(", "),
            });
        }

        // The source branch may already be checked out in another ticket's
        // worktree (a parent currently in `doing/`). Checking it out again
        // in the main repo would collide with git's one-worktree-per-branch
        // rule, so the move + commit run inside that worktree instead.
        let coordinator = self.worktree_coordinator();
        // `locate` also matches the primary checkout itself (it's listed by
        // `git worktree list` like any other entry), so only treat it as a
        // "source worktree" when it's actually a secondary one.
        let source_worktree = coordinator
            .locate(&source_branch, scope)
            .await?
            .filter(|path| path != &self.repo_root);
        let commit_root = source_worktree
            .clone()
            .unwrap_or_else(|| self.repo_root.clone());

        if source_worktree.is_none() {
            let current_branch = GitAdapter::current_branch(&self.repo_root, timeout, scope).await?;
            if current_branch != source_branch {
                GitAdapter::checkout_branch(&self.repo_root, &source_branch, timeout, scope).await?;
            }
        } else {
            relocate_ticket_file(&mut ticket, &self.repo_root, commit_root.as_path()).await?;
        }

        let move_store = TicketStore::new(commit_root.clone(), self.config.clone());

        // Read the ticket branch's standing relative to the source branch
        // before the Start commit below advances the source branch's head;
        // otherwise a branch created from an earlier source head always
        // reports as behind, even when it was never actually diverged.
        let existing_branch_behind = if self.config.worktree.enabled
            && self.config.worktree.auto_operations.create_on_start
            && GitAdapter::branch_exists(&self.repo_root, &ticket.id, timeout, scope).await?
        {
            let (_, behind) =
                GitAdapter::ahead_behind(&self.repo_root, &ticket.id, &source_branch, timeout, scope)
                    .await?;
            Some(behind)
        } else {
            None
        };

        ticket.frontmatter.started_at = Some(chrono::Local::now().fixed_offset());
        move_store.move_to(&mut ticket, Status::Doing).await?;
        move_store.update(&ticket, scope).await?;

        GitAdapter::commit(
            &commit_root,
            &format!("Start ticket: {}", ticket.id),
            &[],
            timeout,
            scope,
        )
        .await?;

        // Only point the main repo's current-ticket symlink at this ticket
        // when it actually lives in the main repo's checkout; when the move
        // landed in a parent's worktree instead, the main repo's existing
        // pointer (if any) still resolves and is left untouched.
        if source_worktree.is_none() {
            store.set_current(Some(&ticket)).await?;
        }

        let mut worktree_path = None;
        let mut init_ran = false;
        let mut init_error = None;
        let mut branch_recreated = false;

        if self.config.worktree.enabled && self.config.worktree.auto_operations.create_on_start {
            if let Some(behind) = existing_branch_behind {
                if behind > 0 {
                    let choice = interactive::prompter()
                        .diverged_branch(&ticket.id, behind)
                        .map_err(Error::IoError)?;

                    match choice {
                        DivergedBranchChoice::Abort => return Err(Error::Cancelled),
                        DivergedBranchChoice::ReuseAsIs => {}
                        DivergedBranchChoice::RecreateAtHead => {
                            coordinator.remove(&ticket.id, true, scope).await?;
                            GitAdapter::delete_branch(&self.repo_root, &ticket.id, true, timeout, scope)
                                .await?;
                            branch_recreated = true;
                        }
                    }
                }
            }

            let (path, _, _created) = coordinator.ensure(&ticket.id, &source_branch, scope).await?;
            symlink_current_in_worktree(&self.config, &path, &ticket)?;

            match coordinator
                .run_init(
                    &path,
                    &self.config.worktree.init_commands,
                    self.config.timeouts.init_commands_secs(),
                    scope,
                )
                .await
            {
                Ok(_) => init_ran = true,
                Err(err) => {
                    warn!(ticket = %ticket.id, %err, "init commands failed, worktree retained");
                    init_error = Some(err.to_string());
                }
            }

            worktree_path = Some(path);
        }

        info!(id = %ticket.id, %source_branch, "ticket started");

        Ok(StartResult {
            ticket,
            worktree_path,
            source_branch,
            init_ran,
            init_error,
            branch_recreated,
        })
    }

    /// `Close(force?, reason?) -> Ticket`. `cwd` is the directory the
    /// command was invoked from (a worktree, typically); `explicit_id` is
    /// the optional positional argument for closing a ticket other than
    /// the current one.
    #[instrument(skip(self, scope), fields(explicit_id, force))]
    pub async fn close(
        &self,
        cwd: &Path,
        explicit_id: Option<&str>,
        force: bool,
        reason: Option<&str>,
        scope: &Scope,
    ) -> Result<Ticket> {
        let (mut ticket, operating_root) =
            self.resolve_close_target(cwd, explicit_id, scope).await?;

        if ticket.derived_status() != Status::Doing {
            return Err(Error::NotInProgress(ticket.id));
        }

        let timeout = self.git_timeout();
        let branch_exists =
            GitAdapter::branch_exists(&self.repo_root, &ticket.id, timeout, scope).await?;

        if branch_exists {
            let current = GitAdapter::current_branch(&operating_root, timeout, scope).await?;
            if current != ticket.id {
                return Err(Error::WrongBranch {
                    current,
                    expected: ticket.id.clone(),
                });
            }
        }

        let dirty = GitAdapter::is_dirty(&operating_root, timeout, scope).await?;
        if dirty && !force {
            let paths = GitAdapter::dirty_paths(&operating_root, timeout, scope).await?;
            return Err(Error::DirtyWorkingTree {
                paths: paths.join(", "),
            });
        }

        let store = TicketStore::new(operating_root.clone(), self.config.clone());
        let original_path = ticket.path.clone();

        ticket.frontmatter.closed_at = Some(chrono::Local::now().fixed_offset());
        store.move_to(&mut ticket, Status::Done).await?;

        if let Err(err) = store.update(&ticket, scope).await {
            if let (Some(new_path), Some(old_path)) = (&ticket.path, &original_path) {
                let _ = tokio::fs::rename(new_path, old_path).await;
            }
            return Err(err);
        }

        let message = match reason {
            Some(reason) => format!("Close ticket: {}\n\n{reason}", ticket.id),
            None => format!("Close ticket: {}", ticket.id),
        };

        if let Err(err) = GitAdapter::commit(&operating_root, &message, &[], timeout, scope).await {
            ticket.frontmatter.closed_at = None;
            let _ = store.move_to(&mut ticket, Status::Doing).await;
            let _ = store.update(&ticket, scope).await;
            return Err(err);
        }

        self.main_store().set_current(None).await?;

        info!(id = %ticket.id, "ticket closed");
        Ok(ticket)
    }

    async fn resolve_close_target(
        &self,
        cwd: &Path,
        explicit_id: Option<&str>,
        scope: &Scope,
    ) -> Result<(Ticket, PathBuf)> {
        let main_store = self.main_store();

        if let Some(id) = explicit_id {
            let ticket = main_store.get(id).await?;
            let root = self.operating_root_for(&ticket, scope).await?;
            return Ok((ticket, root));
        }

        if let Ok(branch) = GitAdapter::current_branch(cwd, self.git_timeout(), scope).await {
            if crate::ticket::is_valid_id(&branch) {
                let cwd_store = TicketStore::new(cwd.to_path_buf(), self.config.clone());
                if let Ok(ticket) = cwd_store.get(&branch).await {
                    if ticket.derived_status() == Status::Doing {
                        return Ok((ticket, cwd.to_path_buf()));
                    }
                }
            }
        }

        let ticket = main_store.read_current().await?.ok_or(Error::NoActiveTicket)?;
        let root = self.operating_root_for(&ticket, scope).await?;
        Ok((ticket, root))
    }

    /// Where to run git/file operations for this ticket: its worktree when
    /// one is registered for a ticket-named branch, else the main repo
    /// (worktrees disabled, or the branch/worktree was never created).
    async fn operating_root_for(&self, ticket: &Ticket, scope: &Scope) -> Result<PathBuf> {
        let timeout = self.git_timeout();
        let branch_exists =
            GitAdapter::branch_exists(&self.repo_root, &ticket.id, timeout, scope).await?;
        if branch_exists {
            let coordinator = self.worktree_coordinator();
            if let Some(path) = coordinator.locate(&ticket.id, scope).await? {
                return Ok(path);
            }
        }
        Ok(self.repo_root.clone())
    }

    /// `Cleanup(ticket_id, force?)`.
    #[instrument(skip(self, scope), fields(id_or_prefix, force))]
    pub async fn cleanup(
        &self,
        id_or_prefix: &str,
        force: bool,
        scope: &Scope,
    ) -> Result<CleanupSummary> {
        let store = self.main_store();
        let ticket = store.get(id_or_prefix).await?;

        if ticket.derived_status() != Status::Done {
            return Err(Error::NotDone(ticket.id));
        }

        let timeout = self.git_timeout();
        let coordinator = self.worktree_coordinator();
        let removed_worktree = coordinator.remove(&ticket.id, force, scope).await?;

        let branch_exists =
            GitAdapter::branch_exists(&self.repo_root, &ticket.id, timeout, scope).await?;
        let deleted_branch = if branch_exists {
            match GitAdapter::delete_branch(&self.repo_root, &ticket.id, force, timeout, scope).await
            {
                Ok(()) => true,
                Err(Error::GitError { stderr, .. })
                    if !force && stderr.to_lowercase().contains("not fully merged") =>
                {
                    return Err(Error::BranchNotMerged(ticket.id));
                }
                Err(err) => return Err(err),
            }
        } else {
            false
        };

        info!(id = %ticket.id, removed_worktree, deleted_branch, "ticket cleaned up");
        Ok(CleanupSummary {
            removed_worktree,
            deleted_branch,
        })
    }

    /// `Restore`: recompute `current-ticket.md` from the contents of
    /// `tickets/doing/`.
    #[instrument(skip(self))]
    pub async fn restore(&self, preferred_id: Option<&str>) -> Result<RestoreResult> {
        let store = self.main_store();
        let doing = store.list(ListFilter::Doing).await?;

        match doing.len() {
            0 => {
                store.set_current(None).await?;
                Ok(RestoreResult { current: None })
            }
            1 => {
                store.set_current(Some(&doing[0])).await?;
                Ok(RestoreResult {
                    current: Some(doing[0].id.clone()),
                })
            }
            _ => {
                if let Some(id) = preferred_id {
                    if let Some(ticket) = doing.iter().find(|t| t.id == id) {
                        store.set_current(Some(ticket)).await?;
                        return Ok(RestoreResult {
                            current: Some(ticket.id.clone()),
                        });
                    }
                    return Err(Error::NotFound(id.to_string()));
                }
                Err(Error::Ambiguous {
                    prefix: "doing".to_string(),
                    matches: doing.iter().map(|t| t.id.clone()).collect(),
                })
            }
        }
    }
}

/// Moves a ticket's physical file from the main repo tree into a source
/// worktree's tree at the same relative path, so the Start move + commit can
/// run inside that worktree without disturbing the main repo's checkout.
async fn relocate_ticket_file(ticket: &mut Ticket, repo_root: &Path, worktree_path: &Path) -> Result<()> {
    let current = ticket
        .path
        .clone()
        .ok_or_else(|| Error::Invalid(format!("ticket {} has no path", ticket.id)))?;
    let relative = current.strip_prefix(repo_root).unwrap_or(&current).to_path_buf();
    let dest = worktree_path.join(&relative);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(&current, &dest).await?;
    ticket.path = Some(dest);
    Ok(())
}

fn symlink_current_in_worktree(config: &Config, worktree_path: &Path, ticket: &Ticket) -> Result<()> {
    let doing_dir = config.doing_dir(worktree_path);
    let target = doing_dir.join(ticket.filename());
    let relative = target
        .strip_prefix(worktree_path)
        .unwrap_or(&target)
        .to_path_buf();
    let link = worktree_path.join("current-ticket.md");

    if std::fs::symlink_metadata(&link).is_ok() {
        std::fs::remove_file(&link)?;
    }

    #[cfg(unix)]
    std::os::unix::fs::symlink(&relative, &link)?;
    #[cfg(not(unix))]
    std::fs::copy(&target, &link).map(|_| ())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn engine(temp: &TempDir, worktree_enabled: bool) -> LifecycleEngine {
        let mut config = Config::load(temp.path(), None).unwrap();
        config.worktree.enabled = worktree_enabled;
        config.worktree.base_dir = "../wt-lifecycle-test".to_string();
        LifecycleEngine::new(temp.path().to_path_buf(), config)
    }

    #[tokio::test]
    async fn full_lifecycle_without_worktree() {
        let temp = init_repo().await;
        let engine = engine(&temp, false);
        let scope = Scope::root();

        let ticket = engine
            .new_ticket("add-auth", "Add auth", None, &scope)
            .await
            .unwrap();

        let start = engine.start(&ticket.id, false, &scope).await.unwrap();
        assert!(start.worktree_path.is_none());
        assert_eq!(start.source_branch, "main");

        let closed = engine
            .close(temp.path(), None, false, None, &scope)
            .await
            .unwrap();
        assert_eq!(closed.derived_status(), Status::Done);

        let cleanup = engine.cleanup(&ticket.id, false, &scope).await.unwrap();
        assert!(!cleanup.removed_worktree);
        assert!(!cleanup.deleted_branch);
    }

    #[tokio::test]
    async fn start_creates_worktree_when_enabled() {
        let temp = init_repo().await;
        let engine = engine(&temp, true);
        let scope = Scope::root();

        let ticket = engine
            .new_ticket("add-worktree", "desc", None, &scope)
            .await
            .unwrap();
        let start = engine.start(&ticket.id, false, &scope).await.unwrap();

        let path = start.worktree_path.clone().unwrap();
        assert!(path.exists());
        assert!(path.join("current-ticket.md").exists());

        let closed = engine
            .close(&path, None, false, None, &scope)
            .await
            .unwrap();
        assert_eq!(closed.derived_status(), Status::Done);

        // `cleanup` only ever reads the main repo's tickets/ tree; the close
        // commit lives on the feature branch until the caller merges it
        // upstream.
        TokioCommand::new("git")
            .args(["merge", "-q", "--no-ff", "-m", "merge", &ticket.id])
            .current_dir(temp.path())
            .status()
            .await
            .unwrap();

        let cleanup = engine.cleanup(&ticket.id, true, &scope).await.unwrap();
        assert!(cleanup.removed_worktree);
        assert!(cleanup.deleted_branch);

        let _ = tokio::fs::remove_dir_all(temp.path().join("../wt-lifecycle-test")).await;
    }

    #[tokio::test]
    async fn start_fails_on_already_started_ticket() {
        let temp = init_repo().await;
        let engine = engine(&temp, false);
        let scope = Scope::root();

        let ticket = engine
            .new_ticket("twice", "desc", None, &scope)
            .await
            .unwrap();
        engine.start(&ticket.id, false, &scope).await.unwrap();

        let err = engine.start(&ticket.id, false, &scope).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted(_)));
    }

    #[tokio::test]
    async fn close_without_active_ticket_fails() {
        let temp = init_repo().await;
        let engine = engine(&temp, false);
        let scope = Scope::root();
        let err = engine
            .close(temp.path(), None, false, None, &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoActiveTicket));
    }

    #[tokio::test]
    async fn sub_ticket_starts_from_parent_branch() {
        let temp = init_repo().await;
        let engine = engine(&temp, false);
        let scope = Scope::root();

        let parent = engine
            .new_ticket("parent-feature", "desc", None, &scope)
            .await
            .unwrap();
        engine.start(&parent.id, false, &scope).await.unwrap();

        let child = engine
            .new_ticket("child-feature", "desc", Some(&parent.id), &scope)
            .await
            .unwrap();
        assert_eq!(child.parent_id(), Some(parent.id.as_str()));

        let err = engine.start(&child.id, false, &scope).await.unwrap_err();
        // worktrees disabled here, so the parent branch never exists: the
        // source-branch precondition correctly rejects starting the child.
        assert!(matches!(err, Error::ParentBranchMissing(_)));
    }

    #[tokio::test]
    async fn sub_ticket_branches_from_parent_worktree_branch() {
        let temp = init_repo().await;
        let engine = engine(&temp, true);
        let scope = Scope::root();

        let parent = engine
            .new_ticket("parent-feature", "desc", None, &scope)
            .await
            .unwrap();
        let parent_start = engine.start(&parent.id, false, &scope).await.unwrap();
        assert_eq!(parent_start.source_branch, "main");

        let child = engine
            .new_ticket("child-feature", "desc", Some(&parent.id), &scope)
            .await
            .unwrap();
        let child_start = engine.start(&child.id, false, &scope).await.unwrap();
        assert_eq!(child_start.source_branch, parent.id);
        assert!(child_start.worktree_path.is_some());

        let _ = tokio::fs::remove_dir_all(temp.path().join("../wt-lifecycle-test")).await;
    }

    #[tokio::test]
    async fn restore_clears_when_no_doing_tickets() {
        let temp = init_repo().await;
        let engine = engine(&temp, false);
        let result = engine.restore(None).await.unwrap();
        assert_eq!(result.current, None);
    }
}
