//! In-memory per-file sync state.
//!
//! State lives for the lifetime of the process only. A restart resets the
//! incremental watermark to zero and forgets cached headers.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What the engine remembers about one watched file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Data rows (header excluded) already sent in incremental mode.
    pub processed_line_count: u64,
    /// When the last accepted event for this file started processing.
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// Last known column list of the mapped table.
    pub cached_header: Option<Vec<String>>,
}

impl SyncState {
    /// Whether an event at `now` falls inside the debounce window.
    pub fn is_debounced(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if window.is_zero() {
            return false;
        }
        match self.last_sync_timestamp {
            Some(last) => now
                .signed_duration_since(last)
                .to_std()
                .map(|elapsed| elapsed < window)
                // Clock went backwards: treat as inside the window.
                .unwrap_or(true),
            None => false,
        }
    }
}

/// Shared map of [`SyncState`] keyed by file path.
///
/// Entries are created lazily. Callers hold the per-path processing token
/// while reading and updating, so each lock is held only briefly.
#[derive(Debug, Clone, Default)]
pub struct SyncStateStore {
    inner: Arc<Mutex<HashMap<PathBuf, SyncState>>>,
}

impl SyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self) -> MutexGuard<'_, HashMap<PathBuf, SyncState>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the state for `path` (default if never seen).
    pub fn get(&self, path: &Path) -> SyncState {
        self.states().get(path).cloned().unwrap_or_default()
    }

    /// Apply `f` to the state for `path`, creating it if needed.
    pub fn update<R>(&self, path: &Path, f: impl FnOnce(&mut SyncState) -> R) -> R {
        let mut states = self.states();
        f(states.entry(path.to_path_buf()).or_default())
    }

    pub fn watermark(&self, path: &Path) -> u64 {
        self.get(path).processed_line_count
    }

    pub fn set_watermark(&self, path: &Path, rows: u64) {
        self.update(path, |s| s.processed_line_count = rows);
    }

    pub fn cached_header(&self, path: &Path) -> Option<Vec<String>> {
        self.get(path).cached_header
    }

    pub fn set_cached_header(&self, path: &Path, header: Vec<String>) {
        self.update(path, |s| s.cached_header = Some(header));
    }

    /// Whether an event for `path` at `now` falls inside the debounce window
    /// of the last accepted sync.
    pub fn is_debounced(&self, path: &Path, now: DateTime<Utc>, window: Duration) -> bool {
        self.get(path).is_debounced(now, window)
    }

    /// Record `now` as the start of an accepted sync of `path`.
    pub fn mark_sync(&self, path: &Path, now: DateTime<Utc>) {
        self.update(path, |s| s.last_sync_timestamp = Some(now));
    }
}
