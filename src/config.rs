//! Process-wide configuration, loaded once per invocation and never mutated
//! thereafter. Layered as defaults -> repo config file -> environment, via
//! the `config` crate.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub worktree: WorktreeConfig,
    #[serde(default)]
    pub tickets: TicketsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            default_branch: default_branch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default)]
    pub init_commands: Vec<String>,
    #[serde(default)]
    pub auto_operations: AutoOperationsConfig,
}

fn default_base_dir() -> String {
    "../ticketflow-worktrees".to_string()
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: default_base_dir(),
            init_commands: Vec::new(),
            auto_operations: AutoOperationsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoOperationsConfig {
    #[serde(default = "default_true")]
    pub create_on_start: bool,
    #[serde(default)]
    pub remove_on_close: bool,
    #[serde(default = "default_true")]
    pub cleanup_orphaned: bool,
}

impl Default for AutoOperationsConfig {
    fn default() -> Self {
        Self {
            create_on_start: true,
            remove_on_close: false,
            cleanup_orphaned: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketsConfig {
    #[serde(default = "default_tickets_dir")]
    pub dir: String,
    #[serde(default = "default_todo_dir")]
    pub todo_dir: String,
    #[serde(default = "default_doing_dir")]
    pub doing_dir: String,
    #[serde(default = "default_done_dir")]
    pub done_dir: String,
    #[serde(default = "default_template")]
    pub template: String,
}

fn default_tickets_dir() -> String {
    "tickets".to_string()
}
fn default_todo_dir() -> String {
    "todo".to_string()
}
fn default_doing_dir() -> String {
    "doing".to_string()
}
fn default_done_dir() -> String {
    "done".to_string()
}
fn default_template() -> String {
    "---\npriority: 2\ndescription: \"\"\ncreated_at: null\nstarted_at: null\nclosed_at: null\n---\n\n"
        .to_string()
}

impl Default for TicketsConfig {
    fn default() -> Self {
        Self {
            dir: default_tickets_dir(),
            todo_dir: default_todo_dir(),
            doing_dir: default_doing_dir(),
            done_dir: default_done_dir(),
            template: default_template(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_format")]
    pub default_format: String,
    #[serde(default = "default_true")]
    pub json_pretty: bool,
}

fn default_format() -> String {
    "text".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            default_format: default_format(),
            json_pretty: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_git_timeout")]
    pub git: u64,
    #[serde(default = "default_init_timeout")]
    pub init_commands: u64,
}

const MAX_TIMEOUT_SECS: u64 = 3600;

fn default_git_timeout() -> u64 {
    30
}
fn default_init_timeout() -> u64 {
    60
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            git: default_git_timeout(),
            init_commands: default_init_timeout(),
        }
    }
}

impl TimeoutsConfig {
    /// `0` means "use the default"; any value is capped at an hour.
    pub fn git_secs(&self) -> u64 {
        clamp_timeout(self.git, default_git_timeout())
    }

    pub fn init_commands_secs(&self) -> u64 {
        clamp_timeout(self.init_commands, default_init_timeout())
    }
}

fn clamp_timeout(value: u64, default: u64) -> u64 {
    let value = if value == 0 { default } else { value };
    value.min(MAX_TIMEOUT_SECS)
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            git: GitConfig::default(),
            worktree: WorktreeConfig::default(),
            tickets: TicketsConfig::default(),
            output: OutputConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

impl Config {
    pub fn config_path(repo_root: &Path) -> PathBuf {
        repo_root.join(".ticketflow.yaml")
    }

    /// Load configuration layered as defaults -> `.ticketflow.yaml` ->
    /// `TICKETFLOW_*` environment variables.
    pub fn load(repo_root: &Path, explicit_path: Option<&Path>) -> Result<Self> {
        let defaults = Config::default();
        let defaults_json = serde_json::to_string(&defaults)
            .map_err(|e| Error::Invalid(format!("failed to serialize default config: {e}")))?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        let config_path = explicit_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Self::config_path(repo_root));

        if config_path.exists() {
            let metadata = std::fs::metadata(&config_path)?;
            if metadata.len() > MAX_CONFIG_BYTES {
                return Err(Error::ConfigTooLarge {
                    path: config_path,
                    size: metadata.len(),
                });
            }
            builder = builder.add_source(config::File::from(config_path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TICKETFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let built = builder
            .build()
            .map_err(|e| Error::Invalid(format!("failed to load configuration: {e}")))?;

        built
            .try_deserialize()
            .map_err(|e| Error::Invalid(format!("failed to deserialize configuration: {e}")))
    }

    /// Write the default config skeleton plus `tickets/{todo,doing,done}/`.
    /// Backs the `init` CLI subcommand.
    pub fn init_skeleton(repo_root: &Path) -> Result<()> {
        let config_path = Self::config_path(repo_root);
        if !config_path.exists() {
            let defaults = Config::default();
            let yaml = serde_yaml::to_string(&defaults)
                .map_err(|e| Error::Invalid(format!("failed to serialize config: {e}")))?;
            std::fs::write(&config_path, yaml)?;
        }

        let loaded = Config::load(repo_root, Some(&config_path))?;
        for dir in [
            &loaded.tickets.todo_dir,
            &loaded.tickets.doing_dir,
            &loaded.tickets.done_dir,
        ] {
            std::fs::create_dir_all(tickets_subdir(repo_root, &loaded.tickets.dir, dir))?;
        }
        Ok(())
    }

    pub fn todo_dir(&self, repo_root: &Path) -> PathBuf {
        tickets_subdir(repo_root, &self.tickets.dir, &self.tickets.todo_dir)
    }

    pub fn doing_dir(&self, repo_root: &Path) -> PathBuf {
        tickets_subdir(repo_root, &self.tickets.dir, &self.tickets.doing_dir)
    }

    pub fn done_dir(&self, repo_root: &Path) -> PathBuf {
        tickets_subdir(repo_root, &self.tickets.dir, &self.tickets.done_dir)
    }

    pub fn worktree_base_dir(&self, repo_root: &Path) -> PathBuf {
        let path = PathBuf::from(&self.worktree.base_dir);
        if path.is_absolute() {
            path
        } else {
            repo_root.join(path)
        }
    }

    pub fn current_ticket_path(repo_root: &Path) -> PathBuf {
        repo_root.join("current-ticket.md")
    }
}

fn tickets_subdir(repo_root: &Path, tickets_dir: &str, sub: &str) -> PathBuf {
    repo_root.join(tickets_dir).join(sub)
}
