//! Error taxonomy for the sync engine.
//!
//! Every per-event failure is one of these variants. Only
//! [`SyncError::Configuration`] is fatal, and only at startup; everything
//! else aborts the current event and is logged at the dispatcher boundary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Reasons a CSV file is rejected before any remote call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsvValidationError {
    #[error("could not determine delimiter")]
    NoDialect,
    #[error("no header row detected")]
    NoHeader,
    #[error("header row is empty")]
    EmptyHeader,
    #[error("header {found:?} does not match table columns {expected:?}")]
    HeaderMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
}

/// Main error type for the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid mapping or settings. Raised while loading configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A remote store call failed after the retry executor gave up.
    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    /// The file is not a usable CSV file; retrying would not help.
    #[error("invalid CSV file {}: {source}", path.display())]
    CsvValidation {
        path: PathBuf,
        #[source]
        source: CsvValidationError,
    },

    /// Local file could not be read, written or opened.
    #[error("I/O error while {operation} {}: {source}", path.display())]
    Io {
        path: PathBuf,
        operation: String,
        #[source]
        source: io::Error,
    },

    /// A batch could not be delivered to the streaming endpoint.
    #[error("streaming to {endpoint} failed: {message}")]
    Streaming { endpoint: String, message: String },
}

impl SyncError {
    pub fn storage(operation: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Storage {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn csv(path: impl Into<PathBuf>, source: CsvValidationError) -> Self {
        SyncError::CsvValidation {
            path: path.into(),
            source,
        }
    }

    /// Create an Io error with context about the operation and path.
    pub fn from_io_error(err: io::Error, operation: &str, path: impl Into<PathBuf>) -> Self {
        SyncError::Io {
            path: path.into(),
            operation: operation.to_string(),
            source: err,
        }
    }

    /// Short machine-friendly name, used as the `event` field in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Configuration(_) => "configuration_error",
            SyncError::Storage { .. } => "storage_error",
            SyncError::CsvValidation { .. } => "csv_validation_error",
            SyncError::Io { .. } => "io_error",
            SyncError::Streaming { .. } => "streaming_error",
        }
    }
}
