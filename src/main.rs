//! `ticketflow` CLI: argument parsing and output formatting only. Every
//! subcommand handler is a thin translation from parsed args to one
//! `LifecycleEngine`/`Reconciler`/`TicketStore` call followed by one
//! `Writer::emit` call — no lifecycle logic lives here.

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;

use ticketflow::cancel::Scope;
use ticketflow::config::Config;
use ticketflow::error::Error;
use ticketflow::git::GitAdapter;
use ticketflow::lifecycle::LifecycleEngine;
use ticketflow::logging::{self, LogFormat};
use ticketflow::output::Writer;
use ticketflow::reconcile::Reconciler;
use ticketflow::ticket::{ListFilter, TicketStore};

#[derive(Parser)]
#[command(name = "ticketflow")]
#[command(about = "Single-developer ticket manager with a git worktree lifecycle")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// `debug`, `info`, `warn`, `error`.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// `text` or `json`.
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    /// `stderr`, `stdout`, or a file path.
    #[arg(long, global = true, default_value = "stderr")]
    log_output: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create `.ticketflow.yaml` and the `tickets/{todo,doing,done}` layout.
    Init,

    /// Create a new ticket in `todo/`.
    New {
        slug: String,
        #[arg(short = 'p', long)]
        parent: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        format: Option<String>,
    },

    /// List tickets.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        count: usize,
        #[arg(long)]
        format: Option<String>,
    },

    /// Show one ticket by id or unambiguous prefix.
    Show {
        id: String,
        #[arg(long)]
        format: Option<String>,
    },

    /// Move a ticket to `doing/` and (by default) create its worktree.
    Start {
        id: String,
        #[arg(short, long)]
        force: bool,
        #[arg(long)]
        format: Option<String>,
    },

    /// Move the current (or a specified) ticket to `done/`.
    Close {
        id: Option<String>,
        #[arg(short, long)]
        force: bool,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        format: Option<String>,
    },

    /// Recompute `current-ticket.md` from `tickets/doing/`.
    Restore { id: Option<String> },

    /// Show the current ticket and any reconciler defects.
    Status {
        #[arg(long)]
        format: Option<String>,
    },

    Worktree {
        #[command(subcommand)]
        action: WorktreeAction,
    },

    /// Remove a done ticket's worktree and local branch, or sweep all
    /// orphaned/stale state when no id is given.
    Cleanup {
        id: Option<String>,
        #[arg(short, long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        format: Option<String>,
    },

    /// Convert legacy subsecond timestamps to second precision.
    Migrate {
        #[arg(long)]
        dry_run: bool,
    },

    Version,
}

#[derive(Subcommand)]
enum WorktreeAction {
    List {
        #[arg(long)]
        format: Option<String>,
    },
    Clean,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_format = cli.log_format.parse::<LogFormat>().unwrap_or(LogFormat::Text);
    let _logging_handle = match logging::init_logging(&cli.log_level, log_format, &cli.log_output) {
        Ok(handle) => Some(handle),
        Err(err) => {
            eprintln!("Warning: failed to initialize logging: {err}");
            None
        }
    };

    let scope = Scope::root();
    let sigint_scope = scope.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            sigint_scope.cancel();
        }
    });

    run(cli, scope).await
}

async fn run(cli: Cli, scope: Scope) -> ExitCode {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("Error: failed to resolve current directory: {err}");
            return ExitCode::from(1);
        }
    };

    if matches!(cli.command, Commands::Version) {
        println!("ticketflow {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::from(0);
    }

    let git_timeout = Config::default().timeouts.git_secs();
    let repo_root = match GitAdapter::main_repo_root(&cwd, git_timeout, &scope).await {
        Ok(root) => root,
        Err(_) if matches!(cli.command, Commands::Init) => cwd.clone(),
        Err(err) => {
            eprintln!("Error: not inside a git repository: {err}");
            return ExitCode::from(1);
        }
    };

    if matches!(cli.command, Commands::Init) {
        return match Config::init_skeleton(&repo_root) {
            Ok(()) => {
                println!("Initialized ticketflow in {}", repo_root.display());
                ExitCode::from(0)
            }
            Err(err) => {
                eprintln!("Error: {err}");
                ExitCode::from(err.exit_code() as u8)
            }
        };
    }

    let config = match Config::load(&repo_root, None) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    dispatch(cli.command, &cwd, &repo_root, config, &scope).await
}

async fn dispatch(
    command: Commands,
    cwd: &std::path::Path,
    repo_root: &std::path::Path,
    config: Config,
    scope: &Scope,
) -> ExitCode {
    let engine = LifecycleEngine::new(repo_root.to_path_buf(), config.clone());
    let store = TicketStore::new(repo_root.to_path_buf(), config.clone());
    let reconciler = Reconciler::new(repo_root.to_path_buf(), config.clone());

    let result: Result<(Writer, ExitCode), Error> = async {
        match command {
            Commands::Init | Commands::Version => unreachable!("handled before dispatch"),

            Commands::New {
                slug,
                parent,
                description,
                format,
            } => {
                let writer = Writer::resolve(&config, format.as_deref());
                let ticket = engine
                    .new_ticket(&slug, &description, parent.as_deref(), scope)
                    .await?;
                writer.emit(&ticket, |t| format!("Created ticket {} in todo/", t.id));
                Ok((writer, ExitCode::from(0)))
            }

            Commands::List {
                status,
                count,
                format,
            } => {
                let writer = Writer::resolve(&config, format.as_deref());
                let filter = match status.as_deref() {
                    Some("todo") => ListFilter::Todo,
                    Some("doing") => ListFilter::Doing,
                    Some("done") => ListFilter::Done,
                    Some(other) => return Err(Error::InvalidStatus(other.to_string())),
                    None => ListFilter::Active,
                };
                let mut tickets = store.list(filter).await?;
                tickets.truncate(count);
                writer.emit(&tickets, |tickets| {
                    if tickets.is_empty() {
                        return "No tickets.".to_string();
                    }
                    tickets
                        .iter()
                        .map(|t| {
                            format!(
                                "[{}] {} (p{}) {}",
                                t.derived_status(),
                                t.id,
                                t.frontmatter.priority,
                                t.frontmatter.description
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                });
                Ok((writer, ExitCode::from(0)))
            }

            Commands::Show { id, format } => {
                let writer = Writer::resolve(&config, format.as_deref());
                let ticket = store.get(&id).await?;
                writer.emit(&ticket, |t| {
                    format!(
                        "{} [{}] p{}\n{}\n\n{}",
                        t.id,
                        t.derived_status(),
                        t.frontmatter.priority,
                        t.frontmatter.description,
                        t.content
                    )
                });
                Ok((writer, ExitCode::from(0)))
            }

            Commands::Start { id, force, format } => {
                let writer = Writer::resolve(&config, format.as_deref());
                let result = engine.start(&id, force, scope).await?;
                writer.emit(&result, |r| match &r.worktree_path {
                    Some(path) => format!(
                        "Started {} on {} -> worktree {}",
                        r.ticket.id,
                        r.source_branch,
                        path.display()
                    ),
                    None => format!("Started {} on {}", r.ticket.id, r.source_branch),
                });
                Ok((writer, ExitCode::from(0)))
            }

            Commands::Close {
                id,
                force,
                reason,
                format,
            } => {
                let writer = Writer::resolve(&config, format.as_deref());
                let ticket = engine
                    .close(cwd, id.as_deref(), force, reason.as_deref(), scope)
                    .await?;
                writer.emit(&ticket, |t| format!("Closed {}", t.id));
                Ok((writer, ExitCode::from(0)))
            }

            Commands::Restore { id } => {
                let writer = Writer::resolve(&config, None);
                let result = engine.restore(id.as_deref()).await?;
                writer.emit(&result, |r| match &r.current {
                    Some(id) => format!("Current ticket set to {id}"),
                    None => "No doing ticket; current-ticket.md cleared".to_string(),
                });
                Ok((writer, ExitCode::from(0)))
            }

            Commands::Status { format } => {
                let writer = Writer::resolve(&config, format.as_deref());
                let current = store.read_current().await?;
                let stats = reconciler.stats(scope).await?;
                let payload = json!({
                    "current": current.as_ref().map(|t| &t.id),
                    "reconciler": stats,
                });
                writer.emit(&payload, |_| match &current {
                    Some(t) => format!("Current ticket: {}", t.id),
                    None => "No current ticket.".to_string(),
                });
                Ok((writer, ExitCode::from(0)))
            }

            Commands::Worktree { action } => match action {
                WorktreeAction::List { format } => {
                    let writer = Writer::resolve(&config, format.as_deref());
                    let timeout = config.timeouts.git_secs();
                    let worktrees =
                        GitAdapter::list_worktrees(repo_root, timeout, scope).await?;
                    writer.emit(&worktrees, |worktrees| {
                        if worktrees.is_empty() {
                            return "No worktrees.".to_string();
                        }
                        worktrees
                            .iter()
                            .map(|w| {
                                format!(
                                    "{} ({})",
                                    w.path,
                                    w.branch.as_deref().unwrap_or("<detached>")
                                )
                            })
                            .collect::<Vec<_>>()
                            .join("\n")
                    });
                    Ok((writer, ExitCode::from(0)))
                }
                WorktreeAction::Clean => {
                    let writer = Writer::resolve(&config, None);
                    let report = reconciler.auto_cleanup(false, false, scope).await?;
                    writer.emit(&report, |r| {
                        format!(
                            "Removed {} worktree(s), deleted {} branch(es)",
                            r.removed_worktrees.len(),
                            r.deleted_branches.len()
                        )
                    });
                    Ok((writer, ExitCode::from(0)))
                }
            },

            Commands::Cleanup {
                id,
                force,
                dry_run,
                format,
            } => {
                let writer = Writer::resolve(&config, format.as_deref());
                match id {
                    Some(id) => {
                        let summary = engine.cleanup(&id, force, scope).await?;
                        writer.emit(&summary, |s| {
                            format!(
                                "removed_worktree={} deleted_branch={}",
                                s.removed_worktree, s.deleted_branch
                            )
                        });
                    }
                    None => {
                        let report = reconciler.auto_cleanup(dry_run, force, scope).await?;
                        writer.emit(&report, |r| {
                            if r.dry_run {
                                format!(
                                    "Would remove {} worktree(s), delete {} branch(es)",
                                    r.removed_worktrees.len(),
                                    r.deleted_branches.len()
                                )
                            } else {
                                format!(
                                    "Removed {} worktree(s), deleted {} branch(es)",
                                    r.removed_worktrees.len(),
                                    r.deleted_branches.len()
                                )
                            }
                        });
                    }
                }
                Ok((writer, ExitCode::from(0)))
            }

            Commands::Migrate { dry_run } => {
                let writer = Writer::resolve(&config, None);
                let migrated = migrate_timestamps(&store, dry_run).await?;
                writer.emit(&migrated, |n| {
                    if dry_run {
                        format!("Would migrate {n} ticket(s)")
                    } else {
                        format!("Migrated {n} ticket(s)")
                    }
                });
                Ok((writer, ExitCode::from(0)))
            }
        }
    }
    .await;

    match result {
        Ok((_, code)) => code,
        Err(err) => {
            let writer = Writer::resolve(&config, None);
            let code = writer.emit_error(&err);
            ExitCode::from(code as u8)
        }
    }
}

/// Backs `migrate --dry-run`: rewriting every ticket drops any subsecond
/// precision the old parser tolerated, since the store's writer
/// (`ticket::model::render_document`) only ever emits second precision.
async fn migrate_timestamps(store: &TicketStore, dry_run: bool) -> Result<usize, Error> {
    let tickets = store.list(ListFilter::All).await?;
    let migrated = tickets.len();
    if !dry_run {
        let scope = Scope::root();
        for ticket in &tickets {
            store.update(ticket, &scope).await?;
        }
    }
    Ok(migrated)
}
