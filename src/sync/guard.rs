//! Per-path single-flight registry.
//!
//! A path is held by at most one pipeline at a time. Holding is expressed
//! as a [`ProcessingToken`]; dropping the token releases the path, so every
//! exit path of a pipeline (including errors, panics and task abort)
//! releases it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Set of paths currently inside the sync pipeline.
#[derive(Debug, Clone, Default)]
pub struct ProcessingRegistry {
    inner: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ProcessingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn paths(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        // The set is never left half-updated, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically claim `path`. Returns `None` if another pipeline holds it.
    pub fn try_acquire(&self, path: &Path) -> Option<ProcessingToken> {
        if self.paths().insert(path.to_path_buf()) {
            Some(ProcessingToken {
                registry: self.clone(),
                path: path.to_path_buf(),
            })
        } else {
            None
        }
    }

    pub fn is_processing(&self, path: &Path) -> bool {
        self.paths().contains(path)
    }

    pub fn in_flight(&self) -> usize {
        self.paths().len()
    }

    fn release(&self, path: &Path) {
        self.paths().remove(path);
    }
}

/// Ownership of one path in the registry; released on drop.
#[derive(Debug)]
pub struct ProcessingToken {
    registry: ProcessingRegistry,
    path: PathBuf,
}

impl Drop for ProcessingToken {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}
