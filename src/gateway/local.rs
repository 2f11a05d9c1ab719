use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::gateway::{merge_rows, read_upload, GatewayKind, StorageGateway, TableInfo, UploadFile};

/// Directory-backed table store.
///
/// Layout: `<root>/<bucket_id>/` per bucket, `<table_id>.csv` for the table
/// data (comma-separated, header first) and `<table_id>.json` for the table
/// manifest (columns, primary key).
#[derive(Debug, Clone)]
pub struct LocalGateway {
    pub root: PathBuf,
}

impl LocalGateway {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            SyncError::storage("open_store", format!("cannot create {}: {e}", root.display()))
        })?;
        Ok(Self { root })
    }

    fn bucket_dir(&self, bucket_id: &str) -> PathBuf {
        self.root.join(bucket_id)
    }

    fn data_path(&self, bucket_id: &str, table_id: &str) -> PathBuf {
        self.bucket_dir(bucket_id).join(format!("{table_id}.csv"))
    }

    fn manifest_path(&self, bucket_id: &str, table_id: &str) -> PathBuf {
        self.bucket_dir(bucket_id).join(format!("{table_id}.json"))
    }

    fn read_manifest(&self, bucket_id: &str, table_id: &str) -> Result<TableInfo> {
        let path = self.manifest_path(bucket_id, table_id);
        let content = fs::read_to_string(&path).map_err(|e| {
            SyncError::storage("get_table", format!("table {bucket_id}.{table_id} not found: {e}"))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            SyncError::storage("get_table", format!("corrupt manifest {}: {e}", path.display()))
        })
    }

    fn write_manifest(&self, bucket_id: &str, table_id: &str, info: &TableInfo) -> Result<()> {
        let path = self.manifest_path(bucket_id, table_id);
        let content = serde_json::to_string_pretty(info)
            .map_err(|e| SyncError::storage("write_manifest", e))?;
        fs::write(&path, content).map_err(|e| {
            SyncError::storage("write_manifest", format!("{}: {e}", path.display()))
        })
    }

    fn create_table_blocking(
        &self,
        bucket_id: &str,
        table_id: &str,
        file: &UploadFile,
        primary_key: &[String],
    ) -> Result<TableInfo> {
        if !self.bucket_dir(bucket_id).is_dir() {
            return Err(SyncError::storage(
                "create_table",
                format!("bucket {bucket_id} does not exist"),
            ));
        }
        if self.manifest_path(bucket_id, table_id).exists() {
            return Err(SyncError::storage(
                "create_table",
                format!("table {bucket_id}.{table_id} already exists"),
            ));
        }

        let mut rows = read_upload("create_table", file)?;
        if rows.is_empty() {
            return Err(SyncError::storage("create_table", "file has no header row"));
        }
        let header = rows.remove(0);
        for key in primary_key {
            if !header.contains(key) {
                return Err(SyncError::storage(
                    "create_table",
                    format!("primary key column '{key}' not in header"),
                ));
            }
        }

        let info = TableInfo::new(bucket_id, table_id, &header, primary_key);
        write_table(&self.data_path(bucket_id, table_id), &header, &rows)?;
        self.write_manifest(bucket_id, table_id, &info)?;
        Ok(info)
    }

    fn load_table_blocking(
        &self,
        bucket_id: &str,
        table_id: &str,
        file: &UploadFile,
        incremental: bool,
    ) -> Result<()> {
        let info = self.read_manifest(bucket_id, table_id)?;
        let columns = info.column_names();

        let mut incoming = read_upload("load_table", file)?;
        if incoming.is_empty() {
            return Err(SyncError::storage("load_table", "file has no header row"));
        }
        let header = incoming.remove(0);
        if header != columns {
            return Err(SyncError::storage(
                "load_table",
                format!("columns {header:?} do not match table columns {columns:?}"),
            ));
        }

        let data_path = self.data_path(bucket_id, table_id);
        let rows = if incremental {
            let existing = read_table(&data_path)?;
            merge_rows(&columns, &info.primary_key, existing, incoming)
        } else {
            incoming
        };
        write_table(&data_path, &columns, &rows)
    }
}

fn read_table(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut rows = read_upload("load_table", &UploadFile::plain(path))?;
    if !rows.is_empty() {
        rows.remove(0);
    }
    Ok(rows)
}

fn write_table(path: &Path, header: &[String], rows: &[Vec<String>]) -> Result<()> {
    let to_storage = |e: csv::Error| SyncError::storage("write_table", format!("{}: {e}", path.display()));
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(to_storage)?;
    writer.write_record(header).map_err(to_storage)?;
    for row in rows {
        writer.write_record(row).map_err(to_storage)?;
    }
    writer
        .flush()
        .map_err(|e| SyncError::storage("write_table", format!("{}: {e}", path.display())))
}

/// Run blocking store work off the async runtime.
async fn blocking<T, F>(operation: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::storage(operation, format!("worker failed: {e}")))?
}

#[async_trait]
impl StorageGateway for LocalGateway {
    async fn bucket_exists(&self, bucket_id: &str) -> Result<bool> {
        Ok(self.bucket_dir(bucket_id).is_dir())
    }

    async fn create_bucket(
        &self,
        bucket_id: &str,
        stage: &str,
        description: Option<&str>,
    ) -> Result<()> {
        let dir = self.bucket_dir(bucket_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            SyncError::storage("create_bucket", format!("{}: {e}", dir.display()))
        })?;
        tracing::debug!(
            bucket_id,
            stage,
            description = description.unwrap_or(""),
            dir = %dir.display(),
            "bucket directory ready"
        );
        Ok(())
    }

    async fn table_exists(&self, bucket_id: &str, table_id: &str) -> Result<bool> {
        Ok(self.manifest_path(bucket_id, table_id).is_file())
    }

    async fn get_table(&self, bucket_id: &str, table_id: &str) -> Result<TableInfo> {
        let this = self.clone();
        let (bucket, table) = (bucket_id.to_string(), table_id.to_string());
        blocking("get_table", move || this.read_manifest(&bucket, &table)).await
    }

    async fn create_table(
        &self,
        bucket_id: &str,
        table_id: &str,
        file: &UploadFile,
        primary_key: &[String],
    ) -> Result<TableInfo> {
        let this = self.clone();
        let (bucket, table) = (bucket_id.to_string(), table_id.to_string());
        let (file, primary_key) = (file.clone(), primary_key.to_vec());
        blocking("create_table", move || {
            this.create_table_blocking(&bucket, &table, &file, &primary_key)
        })
        .await
    }

    async fn load_table(
        &self,
        bucket_id: &str,
        table_id: &str,
        file: &UploadFile,
        incremental: bool,
    ) -> Result<()> {
        let this = self.clone();
        let (bucket, table) = (bucket_id.to_string(), table_id.to_string());
        let file = file.clone();
        blocking("load_table", move || {
            this.load_table_blocking(&bucket, &table, &file, incremental)
        })
        .await
    }

    fn kind(&self) -> GatewayKind {
        GatewayKind::Local {
            root: self.root.clone(),
        }
    }
}
