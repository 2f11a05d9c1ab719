//! Check whether a file is safe to read.

use std::fs::OpenOptions;
use std::path::Path;

/// A file is ready when it can be opened for reading and writing.
///
/// Failure (a writer still holding a lock, missing permissions, the file
/// vanished) means the event is dropped; a later notification for the same
/// path gets another chance.
pub fn is_ready(path: &Path) -> bool {
    match path.metadata() {
        Ok(meta) if meta.is_file() => {}
        _ => return false,
    }
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(_) => true,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "file not ready");
            false
        }
    }
}
