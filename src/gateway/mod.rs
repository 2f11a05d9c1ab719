//! Remote storage gateway contract.
//!
//! The engine talks to the tabular store (buckets containing tables) only
//! through [`StorageGateway`]. Every call may fail with
//! [`SyncError::Storage`]; callers wrap each one in the retry executor.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;

use crate::error::{Result, SyncError};

pub use local::LocalGateway;
pub use memory::{GatewayCall, MemoryGateway, Payload};

/// Gateway type information for display and identification
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayKind {
    /// Tables stored as CSV files under a local directory.
    Local { root: PathBuf },
    /// In-process store, nothing leaves memory.
    Memory,
}

impl GatewayKind {
    pub fn short_name(&self) -> &'static str {
        match self {
            GatewayKind::Local { .. } => "local",
            GatewayKind::Memory => "memory",
        }
    }
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayKind::Local { root } => write!(f, "{} ({})", self.short_name(), root.display()),
            GatewayKind::Memory => f.write_str(self.short_name()),
        }
    }
}

/// A file handed to the gateway together with how to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub path: PathBuf,
    pub is_compressed: bool,
    pub delimiter: u8,
    pub enclosure: u8,
}

impl UploadFile {
    /// Plain comma-separated, double-quoted, uncompressed file.
    pub fn plain(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_compressed: false,
            delimiter: b',',
            enclosure: b'"',
        }
    }

    /// All records of the file, header first. Gzip is undone when flagged.
    pub fn read_rows(&self) -> io::Result<Vec<Vec<String>>> {
        let file = File::open(&self.path)?;
        let reader: Box<dyn Read> = if self.is_compressed {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .quote(self.enclosure)
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record.map_err(io::Error::from)?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(rows)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
}

/// Table details as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: String,
    pub columns: Vec<TableColumn>,
    #[serde(default)]
    pub primary_key: Vec<String>,
}

impl TableInfo {
    pub fn new(bucket_id: &str, table_id: &str, columns: &[String], primary_key: &[String]) -> Self {
        Self {
            id: table_full_id(bucket_id, table_id),
            columns: columns
                .iter()
                .map(|name| TableColumn { name: name.clone() })
                .collect(),
            primary_key: primary_key.to_vec(),
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// `in.c-shop` + `sales` → `in.c-shop.sales`
pub fn table_full_id(bucket_id: &str, table_id: &str) -> String {
    format!("{bucket_id}.{table_id}")
}

/// Stage prefix of a bucket id (`in.c-shop` → `in`); `in` when absent.
pub fn bucket_stage(bucket_id: &str) -> &str {
    match bucket_id.split_once('.') {
        Some((stage @ ("in" | "out"), _)) => stage,
        _ => "in",
    }
}

/// Operations the sync engine needs from the remote store.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn bucket_exists(&self, bucket_id: &str) -> Result<bool>;

    async fn create_bucket(
        &self,
        bucket_id: &str,
        stage: &str,
        description: Option<&str>,
    ) -> Result<()>;

    async fn table_exists(&self, bucket_id: &str, table_id: &str) -> Result<bool>;

    async fn get_table(&self, bucket_id: &str, table_id: &str) -> Result<TableInfo>;

    /// Create a table whose columns come from the file header.
    async fn create_table(
        &self,
        bucket_id: &str,
        table_id: &str,
        file: &UploadFile,
        primary_key: &[String],
    ) -> Result<TableInfo>;

    /// Replace (`incremental = false`) or append/upsert the file's rows.
    async fn load_table(
        &self,
        bucket_id: &str,
        table_id: &str,
        file: &UploadFile,
        incremental: bool,
    ) -> Result<()>;

    fn kind(&self) -> GatewayKind;
}

pub(crate) fn read_upload(operation: &str, file: &UploadFile) -> Result<Vec<Vec<String>>> {
    file.read_rows().map_err(|e| {
        SyncError::storage(operation, format!("cannot read {}: {e}", file.path.display()))
    })
}

/// Append `incoming` to `existing`; rows sharing a primary key replace the
/// older row in place.
pub(crate) fn merge_rows(
    columns: &[String],
    primary_key: &[String],
    mut existing: Vec<Vec<String>>,
    incoming: Vec<Vec<String>>,
) -> Vec<Vec<String>> {
    if primary_key.is_empty() {
        existing.extend(incoming);
        return existing;
    }

    let key_indexes: Vec<usize> = primary_key
        .iter()
        .filter_map(|k| columns.iter().position(|c| c == k))
        .collect();
    let key_of = |row: &[String]| -> Vec<String> {
        key_indexes
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or_default())
            .collect()
    };

    let mut positions: HashMap<Vec<String>, usize> = existing
        .iter()
        .enumerate()
        .map(|(i, row)| (key_of(row), i))
        .collect();
    for row in incoming {
        let key = key_of(&row);
        match positions.get(&key) {
            Some(&i) => existing[i] = row,
            None => {
                positions.insert(key, existing.len());
                existing.push(row);
            }
        }
    }
    existing
}
