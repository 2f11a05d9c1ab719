// Tests for the watcher-driven run loop

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kbc_sync::config::{FileMapping, SyncMode};
use kbc_sync::gateway::MemoryGateway;
use kbc_sync::sync::{DirectoryWatcher, HandlerContext, MemorySink, SyncEngine, SyncStateStore};

use super::common::{fast_retry, BUCKET, SALES};

fn engine(gateway: &MemoryGateway, path: &Path) -> SyncEngine {
    let ctx = HandlerContext {
        gateway: Arc::new(gateway.clone()),
        sink: Arc::new(MemorySink::new()),
        state: SyncStateStore::new(),
        retry: fast_retry(),
        compression_threshold: u64::MAX,
    };
    let mapping = FileMapping::new(path, BUCKET, "sales", SyncMode::FullLoad);
    SyncEngine::new(vec![mapping], ctx, Duration::ZERO)
}

#[tokio::test]
async fn test_run_syncs_new_file_and_stops_on_signal() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let path = root.join("sales.csv");

    let gateway = MemoryGateway::new();
    let engine = engine(&gateway, &path);

    let watcher = DirectoryWatcher::new(&root).unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let runner = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .run(
                    watcher,
                    async {
                        let _ = stop_rx.await;
                    },
                    Duration::from_secs(5),
                )
                .await
        }
    });

    std::fs::write(&path, SALES).unwrap();
    // Events that land while the first pipeline holds the path are dropped,
    // so keep touching the file until one of them syncs it.
    let synced = tokio::time::timeout(Duration::from_secs(10), async {
        while gateway.count("create_table") == 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            std::io::Write::write_all(&mut file, b"\n").unwrap();
        }
    })
    .await;
    assert!(synced.is_ok(), "file was never synced");

    stop_tx.send(()).unwrap();
    let abandoned = runner.await.unwrap();
    assert_eq!(abandoned, 0);
    assert_eq!(gateway.table_rows(BUCKET, "sales").unwrap().len(), 3);
}

#[tokio::test]
async fn test_shutdown_abandons_pipelines_past_grace() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let path = root.join("sales.csv");
    std::fs::write(&path, SALES).unwrap();

    // Every gateway call outlives the grace period.
    let gateway = MemoryGateway::new().with_latency(Duration::from_secs(30));
    let engine = engine(&gateway, &path);

    let watcher = DirectoryWatcher::new(&root).unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let runner = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .run(
                    watcher,
                    async {
                        let _ = stop_rx.await;
                    },
                    Duration::from_millis(200),
                )
                .await
        }
    });

    let held = tokio::time::timeout(Duration::from_secs(10), async {
        while !engine.registry().is_processing(&path) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            std::io::Write::write_all(&mut file, b"4,fig,2.00\n").unwrap();
        }
    })
    .await;
    assert!(held.is_ok(), "no pipeline started");

    stop_tx.send(()).unwrap();
    let abandoned = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run did not return within the grace period")
        .unwrap();
    assert_eq!(abandoned, 1);
    assert!(!engine.registry().is_processing(&path));
    assert!(gateway.calls().is_empty());
}
