//! Event dispatcher and per-event sync pipeline.
//!
//! Each accepted [`FileEvent`] runs through:
//! single-flight guard → mapping lookup → debounce → readiness → CSV
//! analysis (which starts the debounce window) → effective event kind → header check → mode handler.
//! Errors abort only the event that raised them and are logged here, at
//! the dispatcher boundary.

use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::config::{Config, FileMapping};
use crate::error::{Result, SyncError};
use crate::gateway::StorageGateway;
use crate::sync::analyzer::{analyze, check_header, CsvProfile};
use crate::sync::guard::ProcessingRegistry;
use crate::sync::handlers::{HandlerContext, SyncHandler, SyncTarget};
use crate::sync::mapping::MappingResolver;
use crate::sync::readiness::is_ready;
use crate::sync::retry::with_retry;
use crate::sync::run_blocking;
use crate::sync::sink::BatchSink;
use crate::sync::state::SyncStateStore;
use crate::sync::watcher::{DirectoryWatcher, FileEvent, FileEventKind};

/// Why an event was dropped without doing any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another pipeline holds the path.
    Busy,
    /// No enabled mapping for the path.
    Unmapped,
    /// Too soon after the previous sync of the path.
    Debounced,
    /// The file could not be opened for reading and writing.
    NotReady,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Busy => "busy",
            SkipReason::Unmapped => "unmapped",
            SkipReason::Debounced => "debounced",
            SkipReason::NotReady => "not_ready",
        }
    }
}

/// Result of one successfully handled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The handler ran for the given effective event kind.
    Synced(FileEventKind),
    Skipped(SkipReason),
}

struct EngineInner {
    resolver: MappingResolver,
    registry: ProcessingRegistry,
    ctx: HandlerContext,
    debounce: Duration,
}

/// Routes file events to the sync handlers.
///
/// Cheap to clone; clones share the processing registry and sync state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(mappings: Vec<FileMapping>, ctx: HandlerContext, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                resolver: MappingResolver::new(mappings),
                registry: ProcessingRegistry::new(),
                ctx,
                debounce,
            }),
        }
    }

    pub fn from_config(
        config: &Config,
        gateway: Arc<dyn StorageGateway>,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        let settings = &config.default_settings;
        tracing::info!(event = "gateway_selected", gateway = %gateway.kind(), "using table store");
        let ctx = HandlerContext {
            gateway,
            sink,
            state: SyncStateStore::new(),
            retry: settings.retry_policy(),
            compression_threshold: settings.compression_threshold_bytes(),
        };
        Self::new(config.mappings.clone(), ctx, settings.debounce())
    }

    pub fn state(&self) -> &SyncStateStore {
        &self.inner.ctx.state
    }

    pub fn registry(&self) -> &ProcessingRegistry {
        &self.inner.registry
    }

    /// Run the full pipeline for one event.
    pub async fn process(&self, event: FileEvent) -> Result<SyncOutcome> {
        let path = event.path.as_path();
        let Some(_token) = self.inner.registry.try_acquire(path) else {
            return Ok(SyncOutcome::Skipped(SkipReason::Busy));
        };
        let Some(mapping) = self.inner.resolver.resolve(path) else {
            return Ok(SyncOutcome::Skipped(SkipReason::Unmapped));
        };

        let ctx = &self.inner.ctx;
        let now = Utc::now();
        if ctx.state.is_debounced(path, now, self.inner.debounce) {
            return Ok(SyncOutcome::Skipped(SkipReason::Debounced));
        }

        let owned = path.to_path_buf();
        if !run_blocking(path, "checking", move || Ok(is_ready(&owned))).await? {
            return Ok(SyncOutcome::Skipped(SkipReason::NotReady));
        }

        let owned = path.to_path_buf();
        let profile = run_blocking(path, "analyzing", move || analyze(&owned)).await?;
        // Events that never got this far do not start a debounce window.
        ctx.state.mark_sync(path, now);

        let handler = SyncHandler::for_mode(mapping.sync_mode);
        let kind = self.effective_kind(handler, mapping, event.kind).await?;
        if kind == FileEventKind::Modified {
            self.check_header(handler, mapping, &profile).await?;
        }

        tracing::info!(
            event = "file_event",
            path = %path.display(),
            bucket_id = %mapping.bucket_id,
            table_id = %mapping.table_id,
            kind = kind.as_str(),
            mode = %mapping.sync_mode,
            "processing file"
        );

        let target = SyncTarget {
            path,
            bucket_id: &mapping.bucket_id,
            table_id: &mapping.table_id,
            options: &mapping.options,
            profile: &profile,
        };
        match kind {
            FileEventKind::Created => handler.handle_created(ctx, &target).await?,
            FileEventKind::Modified => handler.handle_modified(ctx, &target).await?,
        }

        ctx.state.set_cached_header(path, profile.header);
        Ok(SyncOutcome::Synced(kind))
    }

    /// A create for a table that already exists is handled as a
    /// modification, and a modification of a missing table as a create.
    async fn effective_kind(
        &self,
        handler: SyncHandler,
        mapping: &FileMapping,
        kind: FileEventKind,
    ) -> Result<FileEventKind> {
        if !handler.uses_table() {
            return Ok(kind);
        }
        let ctx = &self.inner.ctx;
        let gateway = ctx.gateway.as_ref();
        let (bucket_id, table_id) = (mapping.bucket_id.as_str(), mapping.table_id.as_str());
        let exists = with_retry(&ctx.retry, "table_exists", move || {
            gateway.table_exists(bucket_id, table_id)
        })
        .await?;

        Ok(match (kind, exists) {
            (FileEventKind::Created, true) => FileEventKind::Modified,
            (FileEventKind::Modified, false) => FileEventKind::Created,
            (kind, _) => kind,
        })
    }

    /// Compare the file header with the cached header, falling back to the
    /// remote table columns (cached afterwards).
    async fn check_header(
        &self,
        handler: SyncHandler,
        mapping: &FileMapping,
        profile: &CsvProfile,
    ) -> Result<()> {
        let ctx = &self.inner.ctx;
        let path = mapping.file_path.as_path();
        let expected = match ctx.state.cached_header(path) {
            Some(header) => header,
            None if handler.uses_table() => {
                let gateway = ctx.gateway.as_ref();
                let (bucket_id, table_id) = (mapping.bucket_id.as_str(), mapping.table_id.as_str());
                let table = with_retry(&ctx.retry, "get_table", move || {
                    gateway.get_table(bucket_id, table_id)
                })
                .await?;
                let columns = table.column_names();
                ctx.state.set_cached_header(path, columns.clone());
                columns
            }
            None => return Ok(()),
        };
        check_header(&expected, &profile.header).map_err(|e| SyncError::csv(path, e))
    }

    /// Process one event, logging the result. Never fails.
    pub async fn handle_event(&self, event: FileEvent) -> Option<SyncOutcome> {
        let path = event.path.clone();
        match self.process(event).await {
            Ok(SyncOutcome::Skipped(reason)) => {
                tracing::debug!(path = %path.display(), reason = reason.as_str(), "event skipped");
                Some(SyncOutcome::Skipped(reason))
            }
            Ok(outcome) => {
                tracing::info!(event = "sync_completed", path = %path.display(), "sync completed");
                Some(outcome)
            }
            Err(err) => {
                self.log_failure(&path, &err);
                None
            }
        }
    }

    fn log_failure(&self, path: &Path, err: &SyncError) {
        let (bucket_id, table_id) = self
            .inner
            .resolver
            .resolve(path)
            .map(|m| (m.bucket_id.as_str(), m.table_id.as_str()))
            .unwrap_or_default();
        tracing::error!(
            event = err.kind(),
            path = %path.display(),
            bucket_id,
            table_id,
            error = %err,
            "sync failed"
        );
    }

    /// Spawn the pipeline for `event` onto `tasks`.
    pub fn dispatch(&self, tasks: &mut JoinSet<()>, event: FileEvent) {
        let engine = self.clone();
        tasks.spawn(async move {
            engine.handle_event(event).await;
        });
    }

    /// Sync one mapped file now, as if it had been modified.
    pub async fn sync_path(&self, path: impl Into<PathBuf>) -> Result<SyncOutcome> {
        self.process(FileEvent::modified(path)).await
    }

    /// Dispatch watcher events until `shutdown` resolves or the watcher
    /// closes, then unsubscribe and wait up to `grace` for in-flight
    /// pipelines. Returns how many were abandoned.
    pub async fn run<S>(&self, mut watcher: DirectoryWatcher, shutdown: S, grace: Duration) -> usize
    where
        S: Future<Output = ()>,
    {
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(event = "shutdown", "stop requested");
                    break;
                }
                event = watcher.next_event() => match event {
                    Some(event) => self.dispatch(&mut tasks, event),
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            }
        }

        drop(watcher);
        drain(tasks, grace).await
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            tracing::error!(event = "pipeline_panicked", error = %err, "sync task panicked");
        }
    }
}

async fn drain(mut tasks: JoinSet<()>, grace: Duration) -> usize {
    let in_flight = tasks.len();
    if in_flight > 0 {
        tracing::info!(in_flight, grace_ms = grace.as_millis() as u64, "waiting for in-flight syncs");
    }

    let finished = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
    })
    .await;

    if finished.is_ok() {
        return 0;
    }
    let abandoned = tasks.len();
    tasks.shutdown().await;
    tracing::warn!(event = "shutdown", abandoned, "abandoned in-flight syncs");
    abandoned
}
