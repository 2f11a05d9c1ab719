//! Per-mode sync behaviour.
//!
//! A [`SyncHandler`] turns one accepted file event into remote calls. Every
//! gateway call and every streaming post goes through
//! [`with_retry`](crate::sync::retry::with_retry); any error that survives
//! the retries aborts the event and is returned to the engine.

use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{MappingOptions, SyncMode};
use crate::error::{Result, SyncError};
use crate::gateway::{bucket_stage, StorageGateway, UploadFile};
use crate::sync::analyzer::{count_data_rows, CsvProfile};
use crate::sync::compression::{prepare_upload, PreparedUpload, TempArtifact};
use crate::sync::retry::{with_retry, RetryPolicy};
use crate::sync::run_blocking;
use crate::sync::sink::BatchSink;
use crate::sync::state::SyncStateStore;

const BUCKET_DESCRIPTION: &str = "Created by kbc-sync";

/// Shared dependencies of all handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub gateway: Arc<dyn StorageGateway>,
    pub sink: Arc<dyn BatchSink>,
    pub state: SyncStateStore,
    pub retry: RetryPolicy,
    pub compression_threshold: u64,
}

/// The file being synced and where it goes.
#[derive(Debug, Clone, Copy)]
pub struct SyncTarget<'a> {
    pub path: &'a Path,
    pub bucket_id: &'a str,
    pub table_id: &'a str,
    pub options: &'a MappingOptions,
    pub profile: &'a CsvProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncHandler {
    /// Replace the table contents on every change.
    FullLoad,
    /// Send only the rows past the watermark.
    Incremental,
    /// Post the file in line batches to an HTTP endpoint.
    Streaming,
}

impl SyncHandler {
    pub fn for_mode(mode: SyncMode) -> Self {
        match mode {
            SyncMode::FullLoad => SyncHandler::FullLoad,
            SyncMode::Incremental => SyncHandler::Incremental,
            SyncMode::Streaming => SyncHandler::Streaming,
        }
    }

    pub fn mode(&self) -> SyncMode {
        match self {
            SyncHandler::FullLoad => SyncMode::FullLoad,
            SyncHandler::Incremental => SyncMode::Incremental,
            SyncHandler::Streaming => SyncMode::Streaming,
        }
    }

    /// Whether this mode keeps a remote table in the storage gateway.
    pub fn uses_table(&self) -> bool {
        !matches!(self, SyncHandler::Streaming)
    }

    pub async fn handle_created(&self, ctx: &HandlerContext, target: &SyncTarget<'_>) -> Result<()> {
        match self {
            SyncHandler::FullLoad => {
                let prepared = prepare(ctx, target.path).await?;
                create_table(ctx, target, &upload_file(&prepared, target.profile)).await
            }
            SyncHandler::Incremental => {
                // The watermark is the row count of the uploaded snapshot.
                let (_slice, prepared, total) = snapshot(ctx, target, 0, None).await?;
                create_table(ctx, target, &upload_file(&prepared, target.profile)).await?;
                ctx.state.set_watermark(target.path, total);
                tracing::debug!(path = %target.path.display(), watermark = total, "watermark set");
                Ok(())
            }
            SyncHandler::Streaming => {
                let batch = Vec::with_capacity(batch_size(target.options));
                stream_file(ctx, target, batch).await
            }
        }
    }

    pub async fn handle_modified(&self, ctx: &HandlerContext, target: &SyncTarget<'_>) -> Result<()> {
        match self {
            SyncHandler::FullLoad => {
                let prepared = prepare(ctx, target.path).await?;
                load_table(ctx, target, &upload_file(&prepared, target.profile), false).await
            }
            SyncHandler::Incremental => load_new_rows(ctx, target).await,
            SyncHandler::Streaming => {
                let batch = Vec::with_capacity(batch_size(target.options));
                stream_file(ctx, target, batch).await
            }
        }
    }
}

fn batch_size(options: &MappingOptions) -> usize {
    options.batch_size.max(1)
}

fn upload_file(prepared: &PreparedUpload, profile: &CsvProfile) -> UploadFile {
    UploadFile {
        path: prepared.upload_path.clone(),
        is_compressed: prepared.is_compressed,
        delimiter: profile.delimiter,
        enclosure: profile.quote_char,
    }
}

async fn prepare(ctx: &HandlerContext, path: &Path) -> Result<PreparedUpload> {
    let owned = path.to_path_buf();
    let threshold = ctx.compression_threshold;
    run_blocking(path, "compressing", move || prepare_upload(&owned, threshold)).await
}

async fn data_rows(target: &SyncTarget<'_>) -> Result<u64> {
    let path = target.path.to_path_buf();
    let profile = target.profile.clone();
    run_blocking(target.path, "counting rows in", move || count_data_rows(&path, &profile)).await
}

async fn ensure_bucket(ctx: &HandlerContext, bucket_id: &str) -> Result<()> {
    let gateway = ctx.gateway.as_ref();
    let exists = with_retry(&ctx.retry, "bucket_exists", move || gateway.bucket_exists(bucket_id)).await?;
    if exists {
        return Ok(());
    }
    let stage = bucket_stage(bucket_id);
    with_retry(&ctx.retry, "create_bucket", move || {
        gateway.create_bucket(bucket_id, stage, Some(BUCKET_DESCRIPTION))
    })
    .await?;
    tracing::info!(event = "bucket_created", bucket_id, stage, "created bucket");
    Ok(())
}

async fn create_table(ctx: &HandlerContext, target: &SyncTarget<'_>, file: &UploadFile) -> Result<()> {
    ensure_bucket(ctx, target.bucket_id).await?;

    let gateway = ctx.gateway.as_ref();
    let (bucket_id, table_id) = (target.bucket_id, target.table_id);
    let primary_key = target.options.primary_key.as_slice();
    let table = with_retry(&ctx.retry, "create_table", move || {
        gateway.create_table(bucket_id, table_id, file, primary_key)
    })
    .await?;

    tracing::info!(
        event = "table_created",
        path = %target.path.display(),
        bucket_id,
        table_id,
        table = %table.id,
        compressed = file.is_compressed,
        "created table"
    );
    Ok(())
}

async fn load_table(
    ctx: &HandlerContext,
    target: &SyncTarget<'_>,
    file: &UploadFile,
    incremental: bool,
) -> Result<()> {
    let gateway = ctx.gateway.as_ref();
    let (bucket_id, table_id) = (target.bucket_id, target.table_id);
    with_retry(&ctx.retry, "load_table", move || {
        gateway.load_table(bucket_id, table_id, file, incremental)
    })
    .await?;

    tracing::info!(
        event = "table_loaded",
        path = %target.path.display(),
        bucket_id,
        table_id,
        incremental,
        compressed = file.is_compressed,
        "loaded table"
    );
    Ok(())
}

/// Upload rows `(watermark, total]` and advance the watermark.
///
/// A file that did not grow (or shrank) is left alone.
async fn load_new_rows(ctx: &HandlerContext, target: &SyncTarget<'_>) -> Result<()> {
    let total = data_rows(target).await?;
    let watermark = ctx.state.watermark(target.path);
    if total <= watermark {
        tracing::debug!(
            path = %target.path.display(),
            total,
            watermark,
            "no new rows"
        );
        return Ok(());
    }

    let (_slice, prepared, last) = snapshot(ctx, target, watermark, Some(total)).await?;
    if last <= watermark {
        return Ok(());
    }

    load_table(ctx, target, &upload_file(&prepared, target.profile), true).await?;
    ctx.state.set_watermark(target.path, last);
    tracing::info!(
        event = "rows_appended",
        path = %target.path.display(),
        rows = last - watermark,
        watermark = last,
        "appended new rows"
    );
    Ok(())
}

/// Copy data rows `(skip, until]` into a temp artifact and prepare it for
/// upload. Returns the artifact, the upload and the last row number read.
async fn snapshot(
    ctx: &HandlerContext,
    target: &SyncTarget<'_>,
    skip: u64,
    until: Option<u64>,
) -> Result<(TempArtifact, PreparedUpload, u64)> {
    let path = target.path.to_path_buf();
    let profile = target.profile.clone();
    let threshold = ctx.compression_threshold;
    run_blocking(target.path, "slicing", move || {
        let (slice, last) = write_slice(&path, &profile, skip, until)
            .map_err(|e| SyncError::from_io_error(e, "slicing", &path))?;
        let prepared = prepare_upload(slice.path(), threshold)?;
        Ok((slice, prepared, last))
    })
    .await
}

/// Write the header plus data rows `(skip, until]` (to the end of the file
/// when `until` is `None`) to a temp artifact, in the file's own dialect.
/// Returns the artifact and the number of the last row read.
fn write_slice(
    path: &Path,
    profile: &CsvProfile,
    skip: u64,
    until: Option<u64>,
) -> io::Result<(TempArtifact, u64)> {
    let mut reader = profile.reader_builder().from_path(path)?;
    let (file, artifact) = TempArtifact::create(".csv")?;
    let mut writer = profile.writer_builder().from_writer(file);

    writer.write_byte_record(reader.byte_headers()?)?;
    let mut record = csv::ByteRecord::new();
    let mut row = 0u64;
    while until.map_or(true, |until| row < until) && reader.read_byte_record(&mut record)? {
        row += 1;
        if row > skip {
            writer.write_byte_record(&record)?;
        }
    }
    writer.flush()?;
    Ok((artifact, row))
}

/// Send every non-empty line of the file, in order, `batch_size` lines at
/// a time. The first failed batch aborts the rest.
async fn stream_file(ctx: &HandlerContext, target: &SyncTarget<'_>, mut batch: Vec<String>) -> Result<()> {
    let endpoint = target
        .options
        .streaming_endpoint
        .as_deref()
        .ok_or_else(|| {
            SyncError::Configuration(format!(
                "mapping {} has no streaming_endpoint",
                target.path.display()
            ))
        })?;
    let size = batch_size(target.options);

    let file = tokio::fs::File::open(target.path)
        .await
        .map_err(|e| SyncError::from_io_error(e, "opening", target.path))?;
    let mut lines = BufReader::new(file).lines();

    let mut batches = 0usize;
    let mut sent = 0usize;
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| SyncError::from_io_error(e, "reading", target.path))?;
        let eof = line.is_none();
        if let Some(line) = line {
            let line = line.trim_end_matches('\r');
            if !line.trim().is_empty() {
                batch.push(line.to_string());
            }
        }

        if batch.len() >= size || (eof && !batch.is_empty()) {
            post_batch(ctx, endpoint, &batch).await?;
            batches += 1;
            sent += batch.len();
            batch.clear();
        }
        if eof {
            break;
        }
    }

    tracing::info!(
        event = "file_streamed",
        path = %target.path.display(),
        endpoint,
        batches,
        lines = sent,
        "streamed file"
    );
    Ok(())
}

async fn post_batch(ctx: &HandlerContext, endpoint: &str, lines: &[String]) -> Result<()> {
    let sink = ctx.sink.as_ref();
    with_retry(&ctx.retry, "post_batch", move || sink.post_batch(endpoint, lines)).await
}
