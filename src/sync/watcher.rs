//! File system watcher for the watched directory.
//!
//! Wraps a `notify` watcher and normalizes its notifications into
//! [`FileEvent`]s on a tokio channel. Only file creation and content
//! modification are forwarded; removals, renames, access and metadata
//! changes and anything about directories are dropped here.

use notify::event::{CreateKind, ModifyKind};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    Created,
    Modified,
}

impl FileEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventKind::Created => "created",
            FileEventKind::Modified => "modified",
        }
    }
}

/// A change to one file in the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

impl FileEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: FileEventKind::Created,
        }
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: FileEventKind::Modified,
        }
    }

    /// Normalize a notify event; yields one event per affected file path.
    fn from_notify(event: Event) -> Vec<FileEvent> {
        let kind = match event.kind {
            EventKind::Create(CreateKind::Folder) => return Vec::new(),
            EventKind::Create(_) => FileEventKind::Created,
            EventKind::Modify(ModifyKind::Name(_)) | EventKind::Modify(ModifyKind::Metadata(_)) => {
                return Vec::new()
            }
            EventKind::Modify(_) => FileEventKind::Modified,
            EventKind::Remove(_) | EventKind::Access(_) | EventKind::Other | EventKind::Any => {
                return Vec::new()
            }
        };

        event
            .paths
            .into_iter()
            .filter(|p| !p.is_dir())
            .map(|path| FileEvent { path, kind })
            .collect()
    }
}

/// Non-recursive watcher over one directory.
///
/// Dropping the watcher unsubscribes from the OS; [`next_event`] then
/// returns `None` once buffered events are drained.
///
/// [`next_event`]: DirectoryWatcher::next_event
pub struct DirectoryWatcher {
    _watcher: RecommendedWatcher,
    receiver: mpsc::UnboundedReceiver<FileEvent>,
    directory: PathBuf,
}

impl DirectoryWatcher {
    pub fn new(directory: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for file_event in FileEvent::from_notify(event) {
                        let _ = tx.send(file_event);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )
        .map_err(|e| watch_error(directory, e))?;

        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(directory, e))?;
        tracing::info!(event = "watch_started", path = %directory.display(), "watching directory");

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
            directory: directory.to_path_buf(),
        })
    }

    /// Get the next event asynchronously.
    pub async fn next_event(&mut self) -> Option<FileEvent> {
        self.receiver.recv().await
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

fn watch_error(directory: &Path, err: notify::Error) -> SyncError {
    SyncError::from_io_error(
        std::io::Error::other(err.to_string()),
        "watching",
        directory,
    )
}
