//! Upload preparation: size-gated gzip and temp artifact ownership.
//!
//! Files larger than the configured threshold are gzip-compressed into a
//! temp file before upload. Temp files are [`TempArtifact`]s and are
//! removed when dropped, so they cannot outlive the handler invocation that
//! created them.

use flate2::write::GzEncoder;
use flate2::Compression as GzipCompression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

use crate::error::{Result, SyncError};

/// Compression level (1-9, where 1 is fastest-lowest and 9 is slowest-highest).
#[derive(Debug, Clone, Copy)]
pub struct CompressionLevel(u8);

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

impl CompressionLevel {
    pub fn value(&self) -> u8 {
        self.0
    }
}

/// A generated file owned by one handler invocation; deleted on drop.
#[derive(Debug)]
pub struct TempArtifact {
    path: Option<TempPath>,
}

impl TempArtifact {
    /// Create an empty temp file with the given suffix.
    pub fn create(suffix: &str) -> io::Result<(File, TempArtifact)> {
        let named = tempfile::Builder::new()
            .prefix("kbc-sync-")
            .suffix(suffix)
            .tempfile()?;
        let (file, path) = named.into_parts();
        Ok((file, TempArtifact { path: Some(path) }))
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let removed = path.to_path_buf();
            if let Err(err) = path.close() {
                tracing::warn!(path = %removed.display(), error = %err, "failed to remove temporary file");
            }
        }
    }
}

/// The file to hand to the gateway, possibly a compressed temp copy.
#[derive(Debug)]
pub struct PreparedUpload {
    pub upload_path: PathBuf,
    pub is_compressed: bool,
    artifact: Option<TempArtifact>,
}

impl PreparedUpload {
    fn original(path: &Path) -> Self {
        Self {
            upload_path: path.to_path_buf(),
            is_compressed: false,
            artifact: None,
        }
    }

    pub fn artifact(&self) -> Option<&TempArtifact> {
        self.artifact.as_ref()
    }
}

/// Compress `path` when it is larger than `threshold_bytes`.
///
/// A file of exactly `threshold_bytes` is uploaded as-is.
pub fn prepare_upload(path: &Path, threshold_bytes: u64) -> Result<PreparedUpload> {
    let size = path
        .metadata()
        .map_err(|e| SyncError::from_io_error(e, "reading metadata of", path))?
        .len();
    if size <= threshold_bytes {
        return Ok(PreparedUpload::original(path));
    }

    let artifact = gzip_file(path, CompressionLevel::default())
        .map_err(|e| SyncError::from_io_error(e, "compressing", path))?;
    let compressed_size = artifact.path().metadata().map(|m| m.len()).unwrap_or(0);
    tracing::debug!(
        path = %path.display(),
        size = %humansize::format_size(size, humansize::BINARY),
        compressed_size = %humansize::format_size(compressed_size, humansize::BINARY),
        "compressed file for upload"
    );

    Ok(PreparedUpload {
        upload_path: artifact.path().to_path_buf(),
        is_compressed: true,
        artifact: Some(artifact),
    })
}

/// Gzip `path` into a new temp artifact.
pub fn gzip_file(path: &Path, level: CompressionLevel) -> io::Result<TempArtifact> {
    let (file, artifact) = TempArtifact::create(".csv.gz")?;
    let mut source = BufReader::new(File::open(path)?);
    let mut encoder = GzEncoder::new(
        BufWriter::new(file),
        GzipCompression::new(level.value() as u32),
    );
    io::copy(&mut source, &mut encoder)?;
    encoder.finish()?.flush()?;
    Ok(artifact)
}
