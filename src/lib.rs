// Library module for kbc-sync
// Re-exports modules for use in integration tests and the daemon binary

pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod sync;

pub use config::{Config, FileMapping, MappingOptions, Settings, SyncMode};
pub use error::{CsvValidationError, Result, SyncError};
