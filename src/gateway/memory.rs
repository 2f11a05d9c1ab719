//! In-process gateway that records every call.
//!
//! Used by the integration tests and by `kbc-sync sync --dry-run`. Upload
//! files are read while the call is in progress, so a recorded
//! [`Payload`] is exactly what the store received even after the temp file
//! behind it is gone.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::gateway::{
    merge_rows, read_upload, table_full_id, GatewayKind, StorageGateway, TableInfo, UploadFile,
};

/// Contents of an upload as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub path: PathBuf,
    pub is_compressed: bool,
    /// Decoded records, header first.
    pub rows: Vec<Vec<String>>,
}

impl Payload {
    /// Records after the header.
    pub fn data_rows(&self) -> &[Vec<String>] {
        self.rows.get(1..).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    BucketExists {
        bucket_id: String,
    },
    CreateBucket {
        bucket_id: String,
        stage: String,
    },
    TableExists {
        bucket_id: String,
        table_id: String,
    },
    GetTable {
        bucket_id: String,
        table_id: String,
    },
    CreateTable {
        bucket_id: String,
        table_id: String,
        primary_key: Vec<String>,
        payload: Payload,
    },
    LoadTable {
        bucket_id: String,
        table_id: String,
        incremental: bool,
        payload: Payload,
    },
}

impl GatewayCall {
    pub fn operation(&self) -> &'static str {
        match self {
            GatewayCall::BucketExists { .. } => "bucket_exists",
            GatewayCall::CreateBucket { .. } => "create_bucket",
            GatewayCall::TableExists { .. } => "table_exists",
            GatewayCall::GetTable { .. } => "get_table",
            GatewayCall::CreateTable { .. } => "create_table",
            GatewayCall::LoadTable { .. } => "load_table",
        }
    }

    /// Payload of a create or load call.
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            GatewayCall::CreateTable { payload, .. } | GatewayCall::LoadTable { payload, .. } => {
                Some(payload)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct StoredTable {
    info: Option<TableInfo>,
    rows: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
struct MemoryStore {
    buckets: HashSet<String>,
    tables: HashMap<String, StoredTable>,
    calls: Vec<GatewayCall>,
    failures: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    store: Arc<Mutex<MemoryStore>>,
    latency: Duration,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before it takes effect.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn store(&self) -> MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pre-create a table with the given columns and no rows.
    pub fn seed_table(&self, bucket_id: &str, table_id: &str, columns: &[&str]) {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let mut store = self.store();
        store.buckets.insert(bucket_id.to_string());
        store.tables.insert(
            table_full_id(bucket_id, table_id),
            StoredTable {
                info: Some(TableInfo::new(bucket_id, table_id, &columns, &[])),
                rows: Vec::new(),
            },
        );
    }

    /// Make the next `times` calls of `operation` fail with a storage error.
    pub fn fail_next(&self, operation: &str, times: u32) {
        self.store().failures.insert(operation.to_string(), times);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.store().calls.clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.store()
            .calls
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    pub fn create_table_calls(&self) -> Vec<GatewayCall> {
        self.calls_for("create_table")
    }

    pub fn load_table_calls(&self) -> Vec<GatewayCall> {
        self.calls_for("load_table")
    }

    fn calls_for(&self, operation: &str) -> Vec<GatewayCall> {
        self.store()
            .calls
            .iter()
            .filter(|c| c.operation() == operation)
            .cloned()
            .collect()
    }

    /// Stored data rows of a table, `None` when it does not exist.
    pub fn table_rows(&self, bucket_id: &str, table_id: &str) -> Option<Vec<Vec<String>>> {
        self.store()
            .tables
            .get(&table_full_id(bucket_id, table_id))
            .map(|t| t.rows.clone())
    }

    /// Record the call, then consume an injected failure if one is pending.
    async fn enter(&self, call: GatewayCall) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let operation = call.operation();
        let mut store = self.store();
        store.calls.push(call);
        if let Some(remaining) = store.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::storage(operation, "injected failure"));
            }
        }
        Ok(())
    }

    fn payload(operation: &str, file: &UploadFile) -> Result<Payload> {
        Ok(Payload {
            path: file.path.clone(),
            is_compressed: file.is_compressed,
            rows: read_upload(operation, file)?,
        })
    }
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    async fn bucket_exists(&self, bucket_id: &str) -> Result<bool> {
        self.enter(GatewayCall::BucketExists {
            bucket_id: bucket_id.to_string(),
        })
        .await?;
        Ok(self.store().buckets.contains(bucket_id))
    }

    async fn create_bucket(
        &self,
        bucket_id: &str,
        stage: &str,
        _description: Option<&str>,
    ) -> Result<()> {
        self.enter(GatewayCall::CreateBucket {
            bucket_id: bucket_id.to_string(),
            stage: stage.to_string(),
        })
        .await?;
        self.store().buckets.insert(bucket_id.to_string());
        Ok(())
    }

    async fn table_exists(&self, bucket_id: &str, table_id: &str) -> Result<bool> {
        self.enter(GatewayCall::TableExists {
            bucket_id: bucket_id.to_string(),
            table_id: table_id.to_string(),
        })
        .await?;
        Ok(self
            .store()
            .tables
            .contains_key(&table_full_id(bucket_id, table_id)))
    }

    async fn get_table(&self, bucket_id: &str, table_id: &str) -> Result<TableInfo> {
        self.enter(GatewayCall::GetTable {
            bucket_id: bucket_id.to_string(),
            table_id: table_id.to_string(),
        })
        .await?;
        self.store()
            .tables
            .get(&table_full_id(bucket_id, table_id))
            .and_then(|t| t.info.clone())
            .ok_or_else(|| {
                SyncError::storage("get_table", format!("table {bucket_id}.{table_id} not found"))
            })
    }

    async fn create_table(
        &self,
        bucket_id: &str,
        table_id: &str,
        file: &UploadFile,
        primary_key: &[String],
    ) -> Result<TableInfo> {
        let payload = Self::payload("create_table", file)?;
        self.enter(GatewayCall::CreateTable {
            bucket_id: bucket_id.to_string(),
            table_id: table_id.to_string(),
            primary_key: primary_key.to_vec(),
            payload: payload.clone(),
        })
        .await?;

        let mut store = self.store();
        if !store.buckets.contains(bucket_id) {
            return Err(SyncError::storage(
                "create_table",
                format!("bucket {bucket_id} does not exist"),
            ));
        }
        let full_id = table_full_id(bucket_id, table_id);
        if store.tables.contains_key(&full_id) {
            return Err(SyncError::storage(
                "create_table",
                format!("table {full_id} already exists"),
            ));
        }
        let header = payload.rows.first().cloned().unwrap_or_default();
        let info = TableInfo::new(bucket_id, table_id, &header, primary_key);
        store.tables.insert(
            full_id,
            StoredTable {
                info: Some(info.clone()),
                rows: payload.data_rows().to_vec(),
            },
        );
        Ok(info)
    }

    async fn load_table(
        &self,
        bucket_id: &str,
        table_id: &str,
        file: &UploadFile,
        incremental: bool,
    ) -> Result<()> {
        let payload = Self::payload("load_table", file)?;
        self.enter(GatewayCall::LoadTable {
            bucket_id: bucket_id.to_string(),
            table_id: table_id.to_string(),
            incremental,
            payload: payload.clone(),
        })
        .await?;

        let mut store = self.store();
        let full_id = table_full_id(bucket_id, table_id);
        let table = store.tables.get_mut(&full_id).ok_or_else(|| {
            SyncError::storage("load_table", format!("table {full_id} not found"))
        })?;
        let incoming = payload.data_rows().to_vec();
        table.rows = if incremental {
            let (columns, primary_key) = table
                .info
                .as_ref()
                .map(|i| (i.column_names(), i.primary_key.clone()))
                .unwrap_or_default();
            merge_rows(&columns, &primary_key, std::mem::take(&mut table.rows), incoming)
        } else {
            incoming
        };
        Ok(())
    }

    fn kind(&self) -> GatewayKind {
        GatewayKind::Memory
    }
}
