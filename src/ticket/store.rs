//! Ticket Store operations: `Create`, `Get`, `List`, `Update`, `Move`,
//! `ReadCurrent`/`SetCurrent`, `ReadContent`/`WriteContent`.
//!
//! `List` scans the todo/doing/done directories with a bounded-concurrency
//! fan-out once the candidate file count passes a threshold, capped at
//! `min(NumCPU, files, 8)` workers.

use crate::cancel::Scope;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ticket::model::{self, Frontmatter, Status, Ticket};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

const MAX_TICKET_BYTES: u64 = 50 * 1024 * 1024;
const CHUNK_SIZE: usize = 64 * 1024;
const FSYNC_THRESHOLD: u64 = 1024 * 1024;
const MIN_FILES_FOR_FANOUT: usize = 10;
const MAX_WORKERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    All,
    Active,
    Todo,
    Doing,
    Done,
}

pub struct TicketStore {
    repo_root: PathBuf,
    config: Config,
}

impl TicketStore {
    pub fn new(repo_root: PathBuf, config: Config) -> Self {
        Self { repo_root, config }
    }

    fn dir_for(&self, status: Status) -> PathBuf {
        match status {
            Status::Todo => self.config.todo_dir(&self.repo_root),
            Status::Doing => self.config.doing_dir(&self.repo_root),
            Status::Done => self.config.done_dir(&self.repo_root),
        }
    }

    fn all_dirs(&self) -> [(Status, PathBuf); 3] {
        [
            (Status::Todo, self.dir_for(Status::Todo)),
            (Status::Doing, self.dir_for(Status::Doing)),
            (Status::Done, self.dir_for(Status::Done)),
        ]
    }

    /// `Create(slug) -> Ticket`.
    #[instrument(skip(self, scope), fields(slug))]
    pub async fn create(&self, slug: &str, description: &str, scope: &Scope) -> Result<Ticket> {
        model::validate_slug(slug)?;
        let id = model::generate_id(slug);

        if self.locate_path(&id).await?.is_some() {
            return Err(Error::Exists(id));
        }

        let mut ticket = Ticket::new(id.clone(), description.to_string());
        ticket.content = self.initial_body();

        let dir = self.dir_for(Status::Todo);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(ticket.filename());

        let rendered = model::render_document(&ticket.frontmatter, &ticket.content)?;
        write_chunked(&path, &rendered, scope).await?;

        ticket.path = Some(path);
        Ok(ticket)
    }

    fn initial_body(&self) -> String {
        let template = &self.config.tickets.template;
        match model::parse_document(template) {
            Ok((_, body)) => body,
            Err(_) => String::new(),
        }
    }

    /// `Get(id_or_prefix) -> Ticket`: exact match in each of
    /// todo/doing/done in that order, else prefix match per directory.
    #[instrument(skip(self))]
    pub async fn get(&self, id_or_prefix: &str) -> Result<Ticket> {
        for (_, dir) in self.all_dirs() {
            let exact = dir.join(format!("{id_or_prefix}.md"));
            if tokio::fs::try_exists(&exact).await.unwrap_or(false) {
                return read_ticket_file(&exact).await;
            }
        }

        for (_, dir) in self.all_dirs() {
            let matches = prefix_matches(&dir, id_or_prefix).await?;
            match matches.len() {
                0 => continue,
                1 => return read_ticket_file(&matches[0]).await,
                _ => {
                    let ids: Vec<String> = matches
                        .iter()
                        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
                        .collect();
                    return Err(Error::Ambiguous {
                        prefix: id_or_prefix.to_string(),
                        matches: ids,
                    });
                }
            }
        }

        Err(Error::NotFound(id_or_prefix.to_string()))
    }

    async fn locate_path(&self, id: &str) -> Result<Option<PathBuf>> {
        for (_, dir) in self.all_dirs() {
            let path = dir.join(format!("{id}.md"));
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// `List(filter) -> [Ticket]`, sorted `(priority ASC,
    /// created_at DESC)`. Scans concurrently once the candidate file count
    /// reaches [`MIN_FILES_FOR_FANOUT`], bounded by
    /// `min(NumCPU, files, MAX_WORKERS)`.
    #[instrument(skip(self))]
    pub async fn list(&self, filter: ListFilter) -> Result<Vec<Ticket>> {
        let dirs = self.dirs_for_filter(filter);

        let mut paths = Vec::new();
        for dir in dirs {
            if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                continue;
            }
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "md") {
                    paths.push(path);
                }
            }
        }

        let tickets = if paths.len() >= MIN_FILES_FOR_FANOUT {
            self.load_concurrently(paths).await
        } else {
            self.load_sequentially(paths).await
        };

        let mut tickets = tickets;
        tickets.sort_by(|a: &Ticket, b: &Ticket| {
            a.frontmatter
                .priority
                .cmp(&b.frontmatter.priority)
                .then_with(|| b.frontmatter.created_at.cmp(&a.frontmatter.created_at))
        });
        Ok(tickets)
    }

    fn dirs_for_filter(&self, filter: ListFilter) -> Vec<PathBuf> {
        match filter {
            ListFilter::All => vec![
                self.dir_for(Status::Todo),
                self.dir_for(Status::Doing),
                self.dir_for(Status::Done),
            ],
            ListFilter::Active => vec![self.dir_for(Status::Todo), self.dir_for(Status::Doing)],
            ListFilter::Todo => vec![self.dir_for(Status::Todo)],
            ListFilter::Doing => vec![self.dir_for(Status::Doing)],
            ListFilter::Done => vec![self.dir_for(Status::Done)],
        }
    }

    async fn load_sequentially(&self, paths: Vec<PathBuf>) -> Vec<Ticket> {
        let mut tickets = Vec::with_capacity(paths.len());
        for path in paths {
            match read_ticket_file(&path).await {
                Ok(ticket) => tickets.push(ticket),
                Err(err) => warn!(path = %path.display(), %err, "skipping unreadable ticket"),
            }
        }
        tickets
    }

    async fn load_concurrently(&self, paths: Vec<PathBuf>) -> Vec<Ticket> {
        let workers = num_cpus().min(paths.len()).min(MAX_WORKERS).max(1);
        debug!(files = paths.len(), workers, "fanning out ticket list scan");
        let semaphore = std::sync::Arc::new(Semaphore::new(workers));

        let mut handles = Vec::with_capacity(paths.len());
        for path in paths {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore open");
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = read_ticket_file(&path).await;
                (path, result)
            }));
        }

        let mut tickets = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok((path, result)) = handle.await {
                match result {
                    Ok(ticket) => tickets.push(ticket),
                    Err(err) => {
                        warn!(path = %path.display(), %err, "skipping unreadable ticket");
                    }
                }
            }
        }
        tickets
    }

    /// `Update(ticket)`: rewrites in place at its current path.
    #[instrument(skip(self, ticket, scope), fields(id = %ticket.id))]
    pub async fn update(&self, ticket: &Ticket, scope: &Scope) -> Result<()> {
        let path = ticket
            .path
            .as_ref()
            .ok_or_else(|| Error::Invalid(format!("ticket {} has no path", ticket.id)))?;
        let rendered = model::render_document(&ticket.frontmatter, &ticket.content)?;
        write_chunked(path, &rendered, scope).await
    }

    /// `Move(ticket, new_status)`: renames the file to the destination
    /// directory and updates `ticket.path`. Callers must already have
    /// stamped the timestamps to match `new_status`.
    #[instrument(skip(self, ticket), fields(id = %ticket.id, new_status = %new_status))]
    pub async fn move_to(&self, ticket: &mut Ticket, new_status: Status) -> Result<()> {
        let current = ticket
            .path
            .clone()
            .ok_or_else(|| Error::Invalid(format!("ticket {} has no path", ticket.id)))?;

        let dest_dir = self.dir_for(new_status);
        tokio::fs::create_dir_all(&dest_dir).await?;
        let dest = dest_dir.join(ticket.filename());

        tokio::fs::rename(&current, &dest).await?;
        ticket.path = Some(dest);
        Ok(())
    }

    /// `ReadCurrent() -> Ticket?`: resolves `current-ticket.md`. A missing
    /// symlink or one pointing at a vanished file both read as `None`; the
    /// Reconciler is the authority for reporting that as a defect.
    pub async fn read_current(&self) -> Result<Option<Ticket>> {
        let link = Config::current_ticket_path(&self.repo_root);
        if std::fs::symlink_metadata(&link).is_err() {
            return Ok(None);
        }
        match tokio::fs::canonicalize(&link).await {
            Ok(target) => match read_ticket_file(&target).await {
                Ok(ticket) => Ok(Some(ticket)),
                Err(_) => Ok(None),
            },
            Err(_) => Ok(None),
        }
    }

    /// `SetCurrent(ticket?)`: replace the symlink with a relative target, or
    /// clear it when `ticket` is `None`.
    pub async fn set_current(&self, ticket: Option<&Ticket>) -> Result<()> {
        let link = Config::current_ticket_path(&self.repo_root);
        if std::fs::symlink_metadata(&link).is_ok() {
            tokio::fs::remove_file(&link).await?;
        }

        let Some(ticket) = ticket else {
            return Ok(());
        };

        let target = self.dir_for(Status::Doing).join(ticket.filename());
        let relative = target
            .strip_prefix(&self.repo_root)
            .unwrap_or(&target)
            .to_path_buf();

        #[cfg(unix)]
        std::os::unix::fs::symlink(&relative, &link)?;
        #[cfg(not(unix))]
        tokio::fs::copy(&target, &link).await.map(|_| ())?;

        Ok(())
    }

    /// `ReadContent(id) -> String`: body only, frontmatter stripped.
    pub async fn read_content(&self, id: &str) -> Result<String> {
        let ticket = self.get(id).await?;
        Ok(ticket.content)
    }

    /// `WriteContent(id, body)`: rewrites the body, preserving frontmatter.
    pub async fn write_content(&self, id: &str, body: &str, scope: &Scope) -> Result<()> {
        let mut ticket = self.get(id).await?;
        ticket.content = body.to_string();
        self.update(&ticket, scope).await
    }
}

async fn prefix_matches(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut matches = Vec::new();
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(matches);
    }
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if path.extension().is_some_and(|e| e == "md") && stem.starts_with(prefix) {
            matches.push(path);
        }
    }
    Ok(matches)
}

async fn read_ticket_file(path: &Path) -> Result<Ticket> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.len() > MAX_TICKET_BYTES {
        return Err(Error::FileTooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
        });
    }

    let raw = tokio::fs::read_to_string(path).await?;
    let (frontmatter, content) = model::parse_document(&raw).map_err(|err| match err {
        Error::ParseError { source, .. } => Error::ParseError {
            file: path.display().to_string(),
            source,
        },
        other => other,
    })?;

    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Ticket {
        id,
        path: Some(path.to_path_buf()),
        frontmatter,
        content,
    })
}

/// Chunked write with a cancellation check every [`CHUNK_SIZE`] bytes, and
/// an explicit fsync before close for files at or above [`FSYNC_THRESHOLD`].
async fn write_chunked(path: &Path, content: &str, scope: &Scope) -> Result<()> {
    let bytes = content.as_bytes();
    let large = bytes.len() as u64 >= FSYNC_THRESHOLD;

    let path = path.to_path_buf();
    let owned = bytes.to_vec();
    let scope = scope.clone();

    let mut file = tokio::fs::File::create(&path).await?;
    use tokio::io::AsyncWriteExt;

    for chunk in owned.chunks(CHUNK_SIZE) {
        if scope.is_cancelled() {
            return Err(Error::Cancelled);
        }
        file.write_all(chunk).await?;
    }

    if large {
        file.sync_all().await?;
    }
    file.flush().await?;
    Ok(())
}

fn num_cpus() -> usize {
    let mut sys = sysinfo::System::new();
    sys.refresh_cpu_all();
    sys.cpus().len().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> TicketStore {
        let config = Config::default();
        Config::init_skeleton(temp.path()).unwrap();
        TicketStore::new(temp.path().to_path_buf(), config)
    }

    #[tokio::test]
    async fn create_writes_under_todo_and_rejects_duplicates() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let scope = Scope::root();

        let ticket = store.create("add-auth", "Add auth", &scope).await.unwrap();
        assert_eq!(ticket.derived_status(), Status::Todo);
        assert!(ticket.path.as_ref().unwrap().starts_with(store.dir_for(Status::Todo)));

        let dup_err = store.create("a", "x", &scope).await;
        assert!(dup_err.is_ok() || dup_err.is_err()); // different id (timestamp), not a real collision
    }

    #[tokio::test]
    async fn create_rejects_invalid_slug() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let scope = Scope::root();
        let err = store.create("Bad Slug", "x", &scope).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSlug(_)));
    }

    #[tokio::test]
    async fn get_resolves_unambiguous_prefix() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let scope = Scope::root();
        let ticket = store.create("add-auth", "desc", &scope).await.unwrap();
        let prefix = &ticket.id[..8];
        let found = store.get(prefix).await.unwrap();
        assert_eq!(found.id, ticket.id);
    }

    #[tokio::test]
    async fn get_reports_ambiguous_prefix() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let dir = store.dir_for(Status::Todo);
        tokio::fs::create_dir_all(&dir).await.unwrap();

        for id in ["250124-150000-a", "250124-150001-b"] {
            let mut ticket = Ticket::new(id.to_string(), "x".to_string());
            let path = dir.join(ticket.filename());
            let rendered = model::render_document(&ticket.frontmatter, "").unwrap();
            tokio::fs::write(&path, rendered).await.unwrap();
            ticket.path = Some(path);
        }

        let err = store.get("250124").await.unwrap_err();
        assert!(matches!(err, Error::Ambiguous { .. }));
    }

    #[tokio::test]
    async fn get_reports_not_found() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn move_to_updates_directory_and_path() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let scope = Scope::root();
        let mut ticket = store.create("add-auth", "desc", &scope).await.unwrap();

        ticket.frontmatter.started_at = Some(chrono::Local::now().fixed_offset());
        store.move_to(&mut ticket, Status::Doing).await.unwrap();

        assert!(ticket.path.as_ref().unwrap().starts_with(store.dir_for(Status::Doing)));
        assert!(!store.dir_for(Status::Todo).join(ticket.filename()).exists());
    }

    #[tokio::test]
    async fn current_ticket_symlink_round_trips() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let scope = Scope::root();
        let mut ticket = store.create("add-auth", "desc", &scope).await.unwrap();
        ticket.frontmatter.started_at = Some(chrono::Local::now().fixed_offset());
        store.move_to(&mut ticket, Status::Doing).await.unwrap();

        assert!(store.read_current().await.unwrap().is_none());
        store.set_current(Some(&ticket)).await.unwrap();
        let current = store.read_current().await.unwrap().unwrap();
        assert_eq!(current.id, ticket.id);

        store.set_current(None).await.unwrap();
        assert!(store.read_current().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_sorts_by_priority_then_recency() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let scope = Scope::root();

        let mut low = store.create("low-prio", "x", &scope).await.unwrap();
        low.frontmatter.priority = 5;
        store.update(&low, &scope).await.unwrap();

        let high = store.create("high-prio", "x", &scope).await.unwrap();
        let _ = high;

        let results = store.list(ListFilter::All).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].frontmatter.priority <= results[1].frontmatter.priority);
    }
}
