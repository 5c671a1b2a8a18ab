//! Coordinator-wide error taxonomy.
//!
//! One enum covers every failure mode the ticket store, git adapter,
//! worktree coordinator, lifecycle engine and reconciler can surface, so
//! that callers (the CLI layer in particular) can match on error kind
//! rather than parse messages: one `thiserror` variant per failure mode.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // --- Validation ---
    #[error("invalid slug '{0}': must match ^[a-z0-9]+(-[a-z0-9]+)*$")]
    InvalidSlug(String),

    #[error("invalid status '{0}'")]
    InvalidStatus(String),

    #[error("invalid ticket: {0}")]
    Invalid(String),

    #[error("ticket file {path} is {size} bytes, exceeding the 50 MiB limit")]
    FileTooLarge { path: PathBuf, size: u64 },

    #[error("configuration file {path} is {size} bytes, exceeding the 1 MiB limit")]
    ConfigTooLarge { path: PathBuf, size: u64 },

    // --- Identity ---
    #[error("no ticket found matching '{0}'")]
    NotFound(String),

    #[error("'{prefix}' matches more than one ticket: {}", .matches.join(", "))]
    Ambiguous { prefix: String, matches: Vec<String> },

    #[error("ticket '{0}' already exists")]
    Exists(String),

    // --- State ---
    #[error("ticket '{0}' has already been started")]
    AlreadyStarted(String),

    #[error("ticket '{0}' has already been closed")]
    AlreadyClosed(String),

    #[error("ticket '{0}' is not in progress")]
    NotInProgress(String),

    #[error("ticket '{0}' is not done")]
    NotDone(String),

    #[error("no active ticket")]
    NoActiveTicket,

    #[error("working tree is dirty: {paths}")]
    DirtyWorkingTree { paths: String },

    #[error("branch '{0}' is not fully merged")]
    BranchNotMerged(String),

    #[error("parent branch '{0}' does not exist")]
    ParentBranchMissing(String),

    #[error("current branch '{current}' does not match ticket branch '{expected}'")]
    WrongBranch { current: String, expected: String },

    // --- External ---
    #[error("git {command} failed (exit {exit_code}): {stderr}")]
    GitError {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("init command '{command}' failed with exit code {exit_code}")]
    InitFailed { command: String, exit_code: i32 },

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse {file}: {source}")]
    ParseError {
        file: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // --- Cancellation ---
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Stable machine-readable identifier, used as `error.code` in JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidSlug(_) => "invalid_slug",
            Error::InvalidStatus(_) => "invalid_status",
            Error::Invalid(_) => "invalid",
            Error::FileTooLarge { .. } => "file_too_large",
            Error::ConfigTooLarge { .. } => "config_too_large",
            Error::NotFound(_) => "not_found",
            Error::Ambiguous { .. } => "ambiguous",
            Error::Exists(_) => "exists",
            Error::AlreadyStarted(_) => "already_started",
            Error::AlreadyClosed(_) => "already_closed",
            Error::NotInProgress(_) => "not_in_progress",
            Error::NotDone(_) => "not_done",
            Error::NoActiveTicket => "no_active_ticket",
            Error::DirtyWorkingTree { .. } => "dirty_working_tree",
            Error::BranchNotMerged(_) => "branch_not_merged",
            Error::ParentBranchMissing(_) => "parent_branch_missing",
            Error::WrongBranch { .. } => "wrong_branch",
            Error::GitError { .. } => "git_error",
            Error::InitFailed { .. } => "init_failed",
            Error::IoError(_) => "io_error",
            Error::ParseError { .. } => "parse_error",
            Error::Cancelled => "cancelled",
        }
    }

    /// Short actionable hints shown under `Suggestions:` in text mode and
    /// `suggestions` in JSON mode. Empty when there's nothing useful to add.
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            Error::DirtyWorkingTree { .. } => {
                vec!["commit or stash your changes, or retry with --force".to_string()]
            }
            Error::BranchNotMerged(branch) => {
                vec![format!(
                    "merge '{branch}' upstream first, or retry with --force"
                )]
            }
            Error::Ambiguous { matches, .. } => {
                vec![format!("use a longer prefix, e.g. one of: {}", matches.join(", "))]
            }
            Error::ParentBranchMissing(parent) => {
                vec![format!("start the parent ticket '{parent}' first")]
            }
            Error::WrongBranch { expected, .. } => {
                vec![format!("run this from the worktree for '{expected}'")]
            }
            Error::NoActiveTicket => {
                vec!["pass an explicit ticket id, or run 'ticketflow start <id>' first".to_string()]
            }
            _ => Vec::new(),
        }
    }

    /// Whether this error is safe to downgrade to a warning under `--force`.
    pub fn is_force_overridable(&self) -> bool {
        matches!(self, Error::DirtyWorkingTree { .. } | Error::BranchNotMerged(_))
    }

    /// Process exit code this error should produce.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Cancelled => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
