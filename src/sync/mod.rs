//! File-to-table synchronization.
//!
//! Watches a directory, validates CSV files and pushes their contents to
//! the storage gateway according to each file's sync mode.

pub mod analyzer;
pub mod compression;
pub mod engine;
pub mod guard;
pub mod handlers;
pub mod mapping;
pub mod readiness;
pub mod retry;
pub mod sink;
pub mod state;
pub mod watcher;

use std::path::Path;

use crate::error::{Result, SyncError};

pub use analyzer::{analyze, CsvProfile};
pub use compression::{prepare_upload, CompressionLevel, PreparedUpload, TempArtifact};
pub use engine::{SkipReason, SyncEngine, SyncOutcome};
pub use guard::{ProcessingRegistry, ProcessingToken};
pub use handlers::{HandlerContext, SyncHandler, SyncTarget};
pub use mapping::MappingResolver;
pub use retry::{with_retry, RetryPolicy};
pub use sink::{BatchSink, HttpBatchSink, MemorySink};
pub use state::{SyncState, SyncStateStore};
pub use watcher::{DirectoryWatcher, FileEvent, FileEventKind};

/// Run file work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(path: &Path, operation: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        SyncError::from_io_error(std::io::Error::other(e.to_string()), operation, path)
    })?
}
