//! Filesystem watcher for the exchange directory.
//!
//! `notify` delivers events on its own thread; they are bridged into tokio
//! through a bounded channel. Every created file is ingested in its own task:
//! read (with retry), parse, persist, then remove. Files that fail are moved
//! to the error directory and the watcher carries on.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::Instrument;

use super::parser::{parse_content, ParseError};
use crate::db::Repository;
use crate::errors::StoreError;

/// Reads attempted before a file is given up on.
pub const READ_MAX_ATTEMPTS: u32 = 5;

/// Pause between reads of a file that is missing or still empty.
pub const READ_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Store inserts attempted when the failure is not a validation error.
const PERSIST_MAX_ATTEMPTS: u32 = 3;

/// Capacity of the channel bridging `notify` events into tokio.
const CHANNEL_CAPACITY: usize = 512;

/// Fatal watcher setup errors.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// Why a single file could not be ingested.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to read file after {attempts} attempts: {source}")]
    Read {
        attempts: u32,
        source: std::io::Error,
    },
    #[error("file content is empty after {attempts} attempts")]
    Empty { attempts: u32 },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Watches one input directory and feeds stored notifications to dispatch.
#[derive(Clone)]
pub struct ExchangeWatcher {
    input_dir: PathBuf,
    error_dir: PathBuf,
    repo: Arc<Repository>,
    dispatch: Option<mpsc::Sender<i64>>,
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ExchangeWatcher {
    /// `dispatch` receives the id of every persisted notification.
    pub fn new(
        input_dir: impl Into<PathBuf>,
        error_dir: impl Into<PathBuf>,
        repo: Arc<Repository>,
        dispatch: Option<mpsc::Sender<i64>>,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            error_dir: error_dir.into(),
            repo,
            dispatch,
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Create both directories, register the watch and spawn the event loop.
    ///
    /// Files already sitting in the input directory are ingested first.
    /// The returned task finishes after `shutdown` flips and in-flight files
    /// have been handled.
    pub async fn start(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<tokio::task::JoinHandle<()>, WatchError> {
        self.input_dir = ensure_dir(&self.input_dir).await?;
        self.error_dir = ensure_dir(&self.error_dir).await?;

        tracing::info!(
            input = %self.input_dir.display(),
            error = %self.error_dir.display(),
            "Starting exchange watcher"
        );

        let (bridge_tx, mut bridge_rx) = mpsc::channel::<Event>(CHANNEL_CAPACITY);
        let mut watcher = notify::RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    // Runs on the notify thread, outside the runtime
                    let _ = bridge_tx.blocking_send(event);
                }
                Err(e) => tracing::error!(error = %e, "Watcher error"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.input_dir, RecursiveMode::Recursive)?;

        let handle = tokio::spawn(async move {
            // Keep the OS watch registered for the lifetime of the loop
            let _watcher = watcher;
            let mut tasks = JoinSet::new();

            for path in self.existing_files().await {
                self.spawn_ingest(&mut tasks, path);
            }

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = bridge_rx.recv() => match event {
                        Some(event) => {
                            for path in created_paths(&event) {
                                self.spawn_ingest(&mut tasks, path);
                            }
                        }
                        None => break,
                    },
                    Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(e) = done {
                            tracing::error!(error = %e, "Ingest task failed");
                        }
                    }
                }
            }

            tracing::info!(in_flight = tasks.len(), "Exchange watcher stopping");
            while tasks.join_next().await.is_some() {}
        });

        Ok(handle)
    }

    fn spawn_ingest(&self, tasks: &mut JoinSet<()>, path: PathBuf) {
        if path.starts_with(&self.error_dir) {
            return;
        }
        let this = self.clone();
        let span = tracing::info_span!("ingest", file = %path.display());
        tasks.spawn(async move { this.ingest(path).await }.instrument(span));
    }

    /// Full pipeline for one file. Never fails; problems end in the error dir.
    pub async fn ingest(&self, path: PathBuf) {
        if tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return;
        }
        if !self.claimed.lock().await.insert(path.clone()) {
            tracing::debug!("File already being ingested");
            return;
        }

        tracing::info!("New file created");
        match self.process(&path).await {
            Ok(id) => {
                tracing::info!(notification_id = id, "Notification stored");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::error!(error = %e, "Failed to remove ingested file");
                }
                self.forward(id);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to ingest file");
                match self.relocate(&path).await {
                    Ok(dest) => tracing::info!(dest = %dest.display(), "Moved file to error dir"),
                    Err(e) => tracing::error!(error = %e, "Error moving file to error dir"),
                }
            }
        }

        self.claimed.lock().await.remove(&path);
    }

    async fn process(&self, path: &Path) -> Result<i64, IngestError> {
        let content = read_with_retry(path, READ_MAX_ATTEMPTS, READ_RETRY_DELAY).await?;
        let notif = parse_content(&content)?;
        tracing::debug!(
            topic = %notif.topic,
            metadata = ?notif.metadata,
            "Notification parsed"
        );

        let mut attempt = 1;
        loop {
            match self.repo.insert_notification(&notif).await {
                Ok(id) => return Ok(id),
                Err(e)
                    if e.is_validation()
                        || matches!(e, StoreError::Closed)
                        || attempt >= PERSIST_MAX_ATTEMPTS =>
                {
                    return Err(e.into())
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Failed to store notification, retrying");
                    attempt += 1;
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
            }
        }
    }

    fn forward(&self, id: i64) {
        let Some(dispatch) = &self.dispatch else {
            return;
        };
        // A full or closed queue is recovered by the pending sweep
        if let Err(e) = dispatch.try_send(id) {
            tracing::warn!(notification_id = id, error = %e, "Dispatch queue unavailable");
        }
    }

    /// Move a failed file into the error directory under its own name, adding
    /// a `_YYYYMMDDHHMMSS` suffix when that name is taken, and a further
    /// `_N` counter when the suffixed name is taken as well.
    pub async fn relocate(&self, path: &Path) -> std::io::Result<PathBuf> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        let dest = self.reserve_error_path(&file_name).await?;
        if tokio::fs::rename(path, &dest).await.is_err() {
            // Rename cannot cross filesystems
            let copied = match tokio::fs::copy(path, &dest).await {
                Ok(_) => tokio::fs::remove_file(path).await,
                Err(e) => Err(e),
            };
            if let Err(e) = copied {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(e);
            }
        }
        Ok(dest)
    }

    /// Claim a free name in the error directory by creating it exclusively,
    /// so concurrent relocations never pick the same target.
    async fn reserve_error_path(&self, file_name: &str) -> std::io::Result<PathBuf> {
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
        let mut collisions = 0u32;
        loop {
            let candidate = match collisions {
                0 => file_name.to_string(),
                1 => format!("{file_name}_{stamp}"),
                n => format!("{file_name}_{stamp}_{}", n - 1),
            };
            let dest = self.error_dir.join(candidate);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&dest)
                .await
            {
                Ok(_) => return Ok(dest),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => collisions += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Regular files already present under the input directory.
    async fn existing_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut dirs = vec![self.input_dir.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Failed to scan directory");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                match entry.file_type().await {
                    Ok(t) if t.is_dir() && !path.starts_with(&self.error_dir) => dirs.push(path),
                    Ok(t) if t.is_file() => files.push(path),
                    _ => {}
                }
            }
        }
        if !files.is_empty() {
            tracing::info!(count = files.len(), "Ingesting files left from a previous run");
        }
        files
    }
}

/// Read a file, retrying while it is unreadable or still empty.
pub async fn read_with_retry(
    path: &Path,
    max_attempts: u32,
    delay: Duration,
) -> Result<String, IngestError> {
    let mut last_error = None;
    for attempt in 1..=max_attempts {
        match tokio::fs::read(path).await {
            Ok(bytes) if !bytes.is_empty() => {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            Ok(_) => {
                tracing::warn!(attempt, "File is empty, retrying");
                last_error = None;
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "Failed to read file, retrying");
                last_error = Some(e);
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(delay).await;
        }
    }

    Err(match last_error {
        Some(source) => IngestError::Read {
            attempts: max_attempts,
            source,
        },
        None => IngestError::Empty {
            attempts: max_attempts,
        },
    })
}

/// Paths that appeared in the watched tree: plain creations and
/// rename-into-place.
fn created_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.clone()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().cloned().into_iter().collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.iter().filter(|p| p.exists()).cloned().collect()
        }
        _ => Vec::new(),
    }
}

async fn ensure_dir(dir: &Path) -> Result<PathBuf, WatchError> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        tracing::info!(dir = %dir.display(), "Creating directory");
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| WatchError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
    tokio::fs::canonicalize(dir)
        .await
        .map_err(|source| WatchError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })
}
