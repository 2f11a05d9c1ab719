//! Delivery of line batches for streaming mappings.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Receives newline-joined batches of CSV lines.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn post_batch(&self, endpoint: &str, lines: &[String]) -> Result<()>;
}

/// POSTs each batch as `text/plain` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBatchSink {
    client: reqwest::Client,
}

impl HttpBatchSink {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Streaming {
                endpoint: String::new(),
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BatchSink for HttpBatchSink {
    async fn post_batch(&self, endpoint: &str, lines: &[String]) -> Result<()> {
        let failed = |message: String| SyncError::Streaming {
            endpoint: endpoint.to_string(),
            message,
        };

        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(lines.join("\n"))
            .send()
            .await
            .map_err(|e| failed(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("request failed with status: {status}")));
        }
        tracing::debug!(endpoint, lines = lines.len(), %status, "batch delivered");
        Ok(())
    }
}

/// Keeps delivered batches in memory instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkState>>,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    batches: Vec<(String, Vec<String>)>,
    attempts: usize,
    failures: u32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemorySinkState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `times` posts fail.
    pub fn fail_next(&self, times: u32) {
        self.state().failures = times;
    }

    /// Delivered batches with their endpoint, in order.
    pub fn batches(&self) -> Vec<(String, Vec<String>)> {
        self.state().batches.clone()
    }

    /// Posts attempted, failed ones included.
    pub fn attempts(&self) -> usize {
        self.state().attempts
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn post_batch(&self, endpoint: &str, lines: &[String]) -> Result<()> {
        let mut state = self.state();
        state.attempts += 1;
        if state.failures > 0 {
            state.failures -= 1;
            return Err(SyncError::Streaming {
                endpoint: endpoint.to_string(),
                message: "injected failure".to_string(),
            });
        }
        state.batches.push((endpoint.to_string(), lines.to_vec()));
        Ok(())
    }
}
