//! Command-line interface for kbc-sync
//!
//! # Usage Examples
//!
//! ```bash
//! # Watch the configured directory until Ctrl-C
//! kbc-sync --config config.json run
//!
//! # Sync every enabled mapping once
//! kbc-sync --config config.json sync
//!
//! # Show what syncing one file would send, without touching the store
//! kbc-sync --config config.json sync data/sales.csv --dry-run
//!
//! # Validate the configuration
//! kbc-sync --config config.toml check
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kbc_sync::config::{default_config_path, Config, CONFIG_FILE_ENV};
use kbc_sync::gateway::{GatewayCall, LocalGateway, MemoryGateway, StorageGateway};
use kbc_sync::logging;
use kbc_sync::sync::{
    BatchSink, DirectoryWatcher, HttpBatchSink, MemorySink, SyncEngine, SyncOutcome,
};

#[derive(Parser)]
#[command(name = "kbc-sync")]
#[command(about = "Keep tables in sync with CSV files in a watched directory")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (JSON or TOML). Falls back to $KBC_SYNC_CONFIG,
    /// then ~/.config/kbc-sync/config.json
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Root directory of the local table store
    #[arg(long, global = true, value_name = "DIR", default_value = ".kbc-sync-store")]
    store_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the directory and sync changes until interrupted
    Run,
    /// Sync one mapped file, or every enabled mapping, once
    Sync {
        /// Mapped file to sync
        file: Option<PathBuf>,

        /// Run against an in-memory store and print the calls instead
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate the configuration and list the mappings
    Check,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config)?;
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    match cli.command {
        Commands::Check => {
            print_check(&config_path, &config);
            Ok(())
        }
        Commands::Run => {
            init_logging(&config)?;
            log_config(&config_path, &config);
            run_daemon(&config, &cli.store_dir).await
        }
        Commands::Sync { file, dry_run } => {
            init_logging(&config)?;
            log_config(&config_path, &config);
            sync_once(&config, &cli.store_dir, file, dry_run).await
        }
    }
}

fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    if let Some(path) = std::env::var_os(CONFIG_FILE_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    match default_config_path() {
        Some(path) if path.exists() => Ok(path),
        _ => bail!("no configuration file; pass --config or set {CONFIG_FILE_ENV}"),
    }
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let settings = &config.default_settings;
    logging::init(&settings.log_level, settings.log_file.as_deref())
        .context("failed to initialize logging")
}

fn log_config(path: &Path, config: &Config) {
    let settings = &config.default_settings;
    tracing::info!(
        event = "config_loaded",
        path = %path.display(),
        watched_directory = %settings.watched_directory.display(),
        mappings = config.mappings.len(),
        enabled = config.enabled_mappings().count(),
        compression_threshold = %humansize::format_size(settings.compression_threshold_bytes(), humansize::BINARY),
        max_retries = settings.max_retries,
        "configuration loaded"
    );
    for mapping in &config.mappings {
        tracing::debug!(
            path = %mapping.file_path.display(),
            bucket_id = %mapping.bucket_id,
            table_id = %mapping.table_id,
            mode = %mapping.sync_mode,
            enabled = mapping.enabled,
            "mapping"
        );
    }
}

async fn run_daemon(config: &Config, store_dir: &Path) -> anyhow::Result<()> {
    let settings = &config.default_settings;
    let gateway: Arc<dyn StorageGateway> =
        Arc::new(LocalGateway::new(store_dir).context("failed to open table store")?);
    let sink: Arc<dyn BatchSink> = Arc::new(HttpBatchSink::new(HttpBatchSink::DEFAULT_TIMEOUT)?);
    let engine = SyncEngine::from_config(config, gateway, sink);

    let watcher = DirectoryWatcher::new(&settings.watched_directory)
        .context("failed to start directory watcher")?;
    let abandoned = engine
        .run(watcher, shutdown_signal(), settings.shutdown_grace())
        .await;

    tracing::info!(event = "stopped", abandoned, "daemon stopped");
    Ok(())
}

async fn sync_once(
    config: &Config,
    store_dir: &Path,
    file: Option<PathBuf>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let paths: Vec<PathBuf> = match file {
        Some(file) => {
            let file = file
                .canonicalize()
                .with_context(|| format!("cannot resolve {}", file.display()))?;
            if !config.enabled_mappings().any(|m| m.file_path == file) {
                bail!("{} has no enabled mapping", file.display());
            }
            vec![file]
        }
        None => config.enabled_mappings().map(|m| m.file_path.clone()).collect(),
    };

    let memory = MemoryGateway::new();
    let gateway: Arc<dyn StorageGateway>;
    let sink: Arc<dyn BatchSink>;
    if dry_run {
        gateway = Arc::new(memory.clone());
        sink = Arc::new(MemorySink::new());
    } else {
        gateway = Arc::new(LocalGateway::new(store_dir).context("failed to open table store")?);
        sink = Arc::new(HttpBatchSink::new(HttpBatchSink::DEFAULT_TIMEOUT)?);
    }
    let engine = SyncEngine::from_config(config, gateway, sink);

    let mut failed = 0usize;
    for path in &paths {
        match engine.sync_path(path.clone()).await {
            Ok(SyncOutcome::Synced(kind)) => {
                println!("{} {} ({})", "synced".green(), path.display(), kind.as_str());
            }
            Ok(SyncOutcome::Skipped(reason)) => {
                println!("{} {} ({})", "skipped".yellow(), path.display(), reason.as_str());
            }
            Err(err) => {
                failed += 1;
                println!("{} {}: {err}", "failed".red(), path.display());
            }
        }
    }

    if dry_run {
        for call in memory.calls() {
            println!("  {}", describe_call(&call));
        }
    }
    if failed > 0 {
        bail!("{failed} of {} file(s) failed to sync", paths.len());
    }
    Ok(())
}

fn describe_call(call: &GatewayCall) -> String {
    match call {
        GatewayCall::BucketExists { bucket_id } => format!("bucket_exists {bucket_id}"),
        GatewayCall::CreateBucket { bucket_id, stage } => {
            format!("create_bucket {bucket_id} (stage {stage})")
        }
        GatewayCall::TableExists { bucket_id, table_id } => {
            format!("table_exists {bucket_id}.{table_id}")
        }
        GatewayCall::GetTable { bucket_id, table_id } => format!("get_table {bucket_id}.{table_id}"),
        GatewayCall::CreateTable {
            bucket_id,
            table_id,
            payload,
            ..
        } => format!(
            "create_table {bucket_id}.{table_id} ({} rows{})",
            payload.data_rows().len(),
            if payload.is_compressed { ", gzip" } else { "" }
        ),
        GatewayCall::LoadTable {
            bucket_id,
            table_id,
            incremental,
            payload,
        } => format!(
            "load_table {bucket_id}.{table_id} ({} rows, {})",
            payload.data_rows().len(),
            if *incremental { "incremental" } else { "full" }
        ),
    }
}

fn print_check(path: &Path, config: &Config) {
    let settings = &config.default_settings;
    println!("{} {}", "Configuration OK:".green().bold(), path.display());
    println!("  watched directory: {}", settings.watched_directory.display());
    println!("  log level: {}", settings.log_level);
    println!(
        "  compression threshold: {}",
        humansize::format_size(settings.compression_threshold_bytes(), humansize::BINARY)
    );
    println!(
        "  retries: {} (delay {}s..{}s, x{})",
        settings.max_retries,
        settings.initial_retry_delay,
        settings.max_retry_delay,
        settings.retry_backoff
    );
    println!("{}", "Mappings:".bold());
    if config.mappings.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for mapping in &config.mappings {
        let status = if mapping.enabled {
            "enabled".green()
        } else {
            "disabled".yellow()
        };
        println!(
            "  [{status}] {} -> {}.{} ({})",
            mapping.file_path.display(),
            mapping.bucket_id,
            mapping.table_id,
            mapping.sync_mode.as_str().cyan()
        );
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
