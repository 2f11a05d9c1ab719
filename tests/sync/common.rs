// Shared fixtures for the sync integration tests

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kbc_sync::config::{FileMapping, MappingOptions, SyncMode};
use kbc_sync::gateway::MemoryGateway;
use kbc_sync::sync::{HandlerContext, MemorySink, RetryPolicy, SyncEngine, SyncStateStore};
use tempfile::TempDir;

pub const BUCKET: &str = "in.c-shop";
pub const ENDPOINT: &str = "http://ingest.test/batches";

pub const SALES: &str = "id,product,amount\n1,apple,3.50\n2,pear,1.25\n3,plum,4.00\n";

/// Short waits so retry paths stay fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        backoff_factor: 2.0,
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub gateway: MemoryGateway,
    pub sink: MemorySink,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_gateway(MemoryGateway::new())
    }

    pub fn with_gateway(gateway: MemoryGateway) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            gateway,
            sink: MemorySink::new(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn append(&self, name: &str, content: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(self.path(name))
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    pub fn mapping(&self, name: &str, table: &str, mode: SyncMode) -> FileMapping {
        FileMapping::new(self.path(name), BUCKET, table, mode)
    }

    pub fn streaming_mapping(&self, name: &str, batch_size: usize) -> FileMapping {
        self.mapping(name, name, SyncMode::Streaming).with_options(MappingOptions {
            batch_size,
            streaming_endpoint: Some(ENDPOINT.to_string()),
            ..MappingOptions::default()
        })
    }

    pub fn context(&self, compression_threshold: u64) -> HandlerContext {
        HandlerContext {
            gateway: Arc::new(self.gateway.clone()),
            sink: Arc::new(self.sink.clone()),
            state: SyncStateStore::new(),
            retry: fast_retry(),
            compression_threshold,
        }
    }

    /// Engine without debounce and with a 50 MiB compression threshold.
    pub fn engine(&self, mappings: Vec<FileMapping>) -> SyncEngine {
        SyncEngine::new(mappings, self.context(50 * 1024 * 1024), Duration::ZERO)
    }

    pub fn engine_with(
        &self,
        mappings: Vec<FileMapping>,
        compression_threshold: u64,
        debounce: Duration,
    ) -> SyncEngine {
        SyncEngine::new(mappings, self.context(compression_threshold), debounce)
    }
}

pub fn rows(lines: &[&str]) -> Vec<Vec<String>> {
    lines
        .iter()
        .map(|line| line.split(',').map(str::to_string).collect())
        .collect()
}

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}
