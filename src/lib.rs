//! ticketflow — a single-developer ticket manager that layers a lifecycle
//! state machine on top of a git repository.
//!
//! The library exposes the coordinator: ticket storage, the git adapter,
//! the worktree coordinator, the lifecycle engine and the reconciler. The
//! CLI binary (`src/main.rs`) is a thin translation layer on top of this.

pub mod cancel;
pub mod config;
pub mod error;
pub mod git;
pub mod interactive;
pub mod lifecycle;
pub mod logging;
pub mod output;
pub mod reconcile;
pub mod ticket;
