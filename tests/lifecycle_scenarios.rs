//! End-to-end lifecycle scenarios driving the public `ticketflow` library
//! API directly against a throwaway git repository.

use tempfile::TempDir;
use ticketflow::cancel::Scope;
use ticketflow::config::Config;
use ticketflow::error::Error;
use ticketflow::git::GitAdapter;
use ticketflow::lifecycle::LifecycleEngine;
use tokio::process::Command;

/// `git init -b main` with two prior commits on `main`.
async fn fresh_repo() -> TempDir {
    let temp = TempDir::new().unwrap();
    for args in [
        vec!["init", "-q", "-b", "main"],
        vec!["config", "user.email", "test@example.com"],
        vec!["config", "user.name", "Test"],
    ] {
        Command::new("git")
            .args(&args)
            .current_dir(temp.path())
            .status()
            .await
            .unwrap();
    }
    Config::init_skeleton(temp.path()).unwrap();
    std::fs::write(temp.path().join("README.md"), "placeholder\n").unwrap();
    for (msg, stage_readme) in [("initial", true), ("second commit", true)] {
        if stage_readme {
            std::fs::write(
                temp.path().join("README.md"),
                format!("{msg}\n"),
            )
            .unwrap();
        }
        Command::new("git")
            .args(["add", "-A"])
            .current_dir(temp.path())
            .status()
            .await
            .unwrap();
        Command::new("git")
            .args(["commit", "-q", "-m", msg])
            .current_dir(temp.path())
            .status()
            .await
            .unwrap();
    }
    temp
}

fn engine(temp: &TempDir, worktree_enabled: bool, base_dir: &str) -> LifecycleEngine {
    let mut config = Config::load(temp.path(), None).unwrap();
    config.worktree.enabled = worktree_enabled;
    config.worktree.base_dir = base_dir.to_string();
    LifecycleEngine::new(temp.path().to_path_buf(), config)
}

async fn commit_log(repo: &std::path::Path) -> Vec<String> {
    let output = Command::new("git")
        .args(["log", "--format=%s"])
        .current_dir(repo)
        .output()
        .await
        .unwrap();
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

/// Scenario 1: create -> start -> close -> cleanup, worktrees disabled.
#[tokio::test]
async fn create_start_close_cleanup_without_worktree() {
    let temp = fresh_repo().await;
    let engine = engine(&temp, false, "../unused-wt-1");
    let scope = Scope::root();

    let ticket = engine
        .new_ticket("add-auth", "Add auth", None, &scope)
        .await
        .unwrap();
    let todo_path = temp.path().join("tickets/todo").join(ticket.filename());
    assert!(todo_path.exists());

    engine.start(&ticket.id, false, &scope).await.unwrap();
    let doing_path = temp.path().join("tickets/doing").join(ticket.filename());
    assert!(doing_path.exists());
    assert!(!todo_path.exists());

    let closed = engine
        .close(temp.path(), None, false, None, &scope)
        .await
        .unwrap();
    let done_path = temp.path().join("tickets/done").join(ticket.filename());
    assert!(done_path.exists());
    assert!(!doing_path.exists());
    assert!(closed.frontmatter.started_at.is_some());
    assert!(closed.frontmatter.closed_at.is_some());

    let log = commit_log(temp.path()).await;
    assert_eq!(log[0], format!("Close ticket: {}", ticket.id));
    assert_eq!(log[1], format!("Start ticket: {}", ticket.id));

    let cleanup = engine.cleanup(&ticket.id, false, &scope).await.unwrap();
    assert!(!cleanup.removed_worktree);
    assert!(!cleanup.deleted_branch);

    // idempotent cleanup (property 7): calling it again is a no-op success.
    let cleanup_again = engine.cleanup(&ticket.id, false, &scope).await.unwrap();
    assert!(!cleanup_again.removed_worktree);
    assert!(!cleanup_again.deleted_branch);
}

/// Scenario 2: create -> start with worktree enabled.
#[tokio::test]
async fn start_with_worktree_creates_branch_and_symlink() {
    let temp = fresh_repo().await;
    let engine = engine(&temp, true, "../wt-scenario-2");
    let scope = Scope::root();

    let ticket = engine
        .new_ticket("add-worktree", "desc", None, &scope)
        .await
        .unwrap();
    let result = engine.start(&ticket.id, false, &scope).await.unwrap();

    let worktree_path = result.worktree_path.clone().unwrap();
    assert!(worktree_path.exists());
    assert_eq!(
        worktree_path,
        temp.path().join("../wt-scenario-2").join(&ticket.id)
    );

    let branch = GitAdapter::current_branch(&worktree_path, 5, &scope)
        .await
        .unwrap();
    assert_eq!(branch, ticket.id);

    let link = worktree_path.join("current-ticket.md");
    assert!(std::fs::symlink_metadata(&link).is_ok());
    let resolved = std::fs::canonicalize(&link).unwrap();
    assert_eq!(
        resolved,
        std::fs::canonicalize(worktree_path.join("tickets/doing").join(ticket.filename()))
            .unwrap()
    );

    engine.close(&worktree_path, None, false, None, &scope).await.unwrap();

    // The close commit lives on the feature branch until it's merged
    // upstream; `cleanup` only ever reads the main repo's tree.
    Command::new("git")
        .args(["merge", "-q", "--no-ff", "-m", "merge", &ticket.id])
        .current_dir(temp.path())
        .status()
        .await
        .unwrap();

    engine.cleanup(&ticket.id, true, &scope).await.unwrap();
    let _ = tokio::fs::remove_dir_all(temp.path().join("../wt-scenario-2")).await;
}

/// Scenario 3: sub-ticket branches from the parent's branch, not `main`.
#[tokio::test]
async fn sub_ticket_branches_from_parent_not_default_branch() {
    let temp = fresh_repo().await;
    let engine = engine(&temp, true, "../wt-scenario-3");
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
    assert!(child
        .frontmatter
        .related
        .contains(&format!("parent:{}", parent.id)));

    let child_start = engine.start(&child.id, false, &scope).await.unwrap();
    assert_eq!(child_start.source_branch, parent.id);

    let child_worktree = child_start.worktree_path.unwrap();
    let log = commit_log(&child_worktree).await;
    assert_eq!(log[0], format!("Start ticket: {}", child.id));
    // The child branch must descend from the parent's branch commit, not main.
    let merge_base = GitAdapter::merge_base(&child_worktree, &parent.id, &child.id, 5, &scope)
        .await
        .unwrap();
    assert!(!merge_base.is_empty());

    let _ = tokio::fs::remove_dir_all(temp.path().join("../wt-scenario-3")).await;
}

/// Scenario 5: dirty close without force fails; retrying with force succeeds.
#[tokio::test]
async fn dirty_close_requires_force() {
    let temp = fresh_repo().await;
    let engine = engine(&temp, false, "../unused-wt-5");
    let scope = Scope::root();

    let ticket = engine
        .new_ticket("dirty-close", "desc", None, &scope)
        .await
        .unwrap();
    engine.start(&ticket.id, false, &scope).await.unwrap();

    std::fs::write(temp.path().join("untracked.txt"), "oops\n").unwrap();

    let err = engine
        .close(temp.path(), None, false, None, &scope)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DirtyWorkingTree { .. }));

    let doing_path = temp.path().join("tickets/doing").join(ticket.filename());
    assert!(doing_path.exists(), "ticket must remain in doing/ after a failed close");

    let closed = engine
        .close(temp.path(), None, true, None, &scope)
        .await
        .unwrap();
    assert_eq!(closed.id, ticket.id);
    assert!(temp
        .path()
        .join("tickets/done")
        .join(ticket.filename())
        .exists());
}

/// Scenario 6: an unambiguous-looking prefix that actually matches two
/// tickets surfaces `Ambiguous`, listing both candidate IDs.
#[tokio::test]
async fn ambiguous_prefix_lists_every_match() {
    let temp = fresh_repo().await;
    let config = Config::load(temp.path(), None).unwrap();
    let store = ticketflow::ticket::TicketStore::new(temp.path().to_path_buf(), config);

    let dir = temp.path().join("tickets/todo");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    for id in ["250124-150000-alpha", "250124-150000-beta"] {
        let ticket = ticketflow::ticket::Ticket::new(id.to_string(), "x".to_string());
        let rendered =
            ticketflow::ticket::render_document(&ticket.frontmatter, "").unwrap();
        tokio::fs::write(dir.join(format!("{id}.md")), rendered)
            .await
            .unwrap();
    }

    let err = store.get("250124-150000").await.unwrap_err();
    match err {
        Error::Ambiguous { matches, .. } => {
            assert_eq!(matches.len(), 2);
            assert!(matches.iter().any(|m| m.ends_with("alpha")));
            assert!(matches.iter().any(|m| m.ends_with("beta")));
        }
        other => panic!("expected Ambiguous, got {other:?}"),
    }
}
