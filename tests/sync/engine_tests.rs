// Tests for the per-event pipeline in sync::engine

use std::time::Duration;

use kbc_sync::config::SyncMode;
use kbc_sync::gateway::{GatewayCall, MemoryGateway};
use kbc_sync::sync::{FileEvent, FileEventKind, SkipReason, SyncOutcome};
use kbc_sync::{CsvValidationError, SyncError};

use super::common::{rows, strings, Harness, BUCKET, ENDPOINT, SALES};

#[tokio::test]
async fn test_incremental_sales_end_to_end() {
    let h = Harness::new();
    let path = h.write("sales.csv", SALES);
    let engine = h.engine(vec![h.mapping("sales.csv", "sales", SyncMode::Incremental)]);

    let outcome = engine.process(FileEvent::created(&path)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced(FileEventKind::Created));
    assert_eq!(engine.state().watermark(&path), 3);

    let creates = h.gateway.create_table_calls();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].payload().unwrap().data_rows().len(), 3);
    assert_eq!(h.gateway.count("create_bucket"), 1);

    h.append("sales.csv", "4,fig,2.00\n5,kiwi,0.75\n");
    let outcome = engine.process(FileEvent::modified(&path)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced(FileEventKind::Modified));

    let loads = h.gateway.load_table_calls();
    assert_eq!(loads.len(), 1);
    match &loads[0] {
        GatewayCall::LoadTable {
            bucket_id,
            table_id,
            incremental,
            payload,
        } => {
            assert_eq!(bucket_id, BUCKET);
            assert_eq!(table_id, "sales");
            assert!(*incremental);
            assert_eq!(
                payload.rows,
                rows(&["id,product,amount", "4,fig,2.00", "5,kiwi,0.75"])
            );
        }
        other => panic!("unexpected call {other:?}"),
    }
    assert_eq!(engine.state().watermark(&path), 5);
    assert_eq!(h.gateway.table_rows(BUCKET, "sales").unwrap().len(), 5);
}

#[tokio::test]
async fn test_disabled_mapping_never_reaches_gateway() {
    let h = Harness::new();
    let path = h.write("sales.csv", SALES);
    let engine = h.engine(vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad).disabled()]);

    for event in [FileEvent::created(&path), FileEvent::modified(&path)] {
        let outcome = engine.process(event).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Unmapped));
    }
    assert!(h.gateway.calls().is_empty());
}

#[tokio::test]
async fn test_unmapped_path_is_ignored() {
    let h = Harness::new();
    let other = h.write("other.csv", SALES);
    let engine = h.engine(vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)]);

    let outcome = engine.process(FileEvent::created(&other)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Unmapped));
    assert!(h.gateway.calls().is_empty());
}

#[tokio::test]
async fn test_file_without_dialect_makes_no_remote_calls() {
    let h = Harness::new();
    let path = h.write("broken.csv", "a,b,c\n1,2\n");
    let engine = h.engine(vec![h.mapping("broken.csv", "broken", SyncMode::FullLoad)]);

    let err = engine.process(FileEvent::created(&path)).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::CsvValidation {
            source: CsvValidationError::NoDialect,
            ..
        }
    ));
    assert!(h.gateway.calls().is_empty());
    assert!(!engine.registry().is_processing(&path));
}

#[tokio::test]
async fn test_missing_file_is_not_ready() {
    let h = Harness::new();
    let path = h.path("sales.csv");
    let engine = h.engine(vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)]);

    let outcome = engine.process(FileEvent::created(&path)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::NotReady));
    assert!(h.gateway.calls().is_empty());
}

#[tokio::test]
async fn test_held_path_is_skipped_as_busy() {
    let h = Harness::new();
    let path = h.write("sales.csv", SALES);
    let engine = h.engine(vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)]);

    let token = engine.registry().try_acquire(&path).unwrap();
    let outcome = engine.process(FileEvent::modified(&path)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Busy));
    assert!(h.gateway.calls().is_empty());

    drop(token);
    let outcome = engine.process(FileEvent::modified(&path)).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Synced(_)));
}

#[tokio::test]
async fn test_concurrent_events_for_one_path_run_once() {
    let h = Harness::with_gateway(MemoryGateway::new().with_latency(Duration::from_millis(50)));
    let path = h.write("sales.csv", SALES);
    let engine = h.engine(vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)]);

    let (first, second) = tokio::join!(
        engine.process(FileEvent::created(&path)),
        engine.process(FileEvent::modified(&path)),
    );
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, SyncOutcome::Synced(_)));
    assert_eq!(outcomes[0], SyncOutcome::Skipped(SkipReason::Busy));
    assert_eq!(outcomes[1], SyncOutcome::Synced(FileEventKind::Created));
    assert_eq!(h.gateway.count("create_table"), 1);
    assert_eq!(engine.registry().in_flight(), 0);
}

#[tokio::test]
async fn test_different_paths_run_concurrently() {
    let h = Harness::new();
    let a = h.write("a.csv", SALES);
    let b = h.write("b.csv", SALES);
    let engine = h.engine(vec![
        h.mapping("a.csv", "a", SyncMode::FullLoad),
        h.mapping("b.csv", "b", SyncMode::FullLoad),
    ]);

    let (first, second) = tokio::join!(
        engine.process(FileEvent::created(&a)),
        engine.process(FileEvent::created(&b)),
    );
    assert_eq!(first.unwrap(), SyncOutcome::Synced(FileEventKind::Created));
    assert_eq!(second.unwrap(), SyncOutcome::Synced(FileEventKind::Created));
    assert_eq!(h.gateway.count("create_table"), 2);
}

#[tokio::test]
async fn test_debounce_drops_rapid_repeat() {
    let h = Harness::new();
    let path = h.write("sales.csv", SALES);
    let engine = h.engine_with(
        vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)],
        u64::MAX,
        Duration::from_secs(60),
    );

    let first = engine.process(FileEvent::created(&path)).await.unwrap();
    assert!(matches!(first, SyncOutcome::Synced(_)));
    let second = engine.process(FileEvent::modified(&path)).await.unwrap();
    assert_eq!(second, SyncOutcome::Skipped(SkipReason::Debounced));
    assert_eq!(h.gateway.count("load_table"), 0);
}

#[tokio::test]
async fn test_failed_analysis_does_not_start_debounce_window() {
    let h = Harness::new();
    let path = h.write("sales.csv", "");
    let engine = h.engine_with(
        vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)],
        u64::MAX,
        Duration::from_secs(1),
    );

    let err = engine.process(FileEvent::created(&path)).await.unwrap_err();
    assert!(matches!(err, SyncError::CsvValidation { .. }));

    h.write("sales.csv", SALES);
    let outcome = engine.process(FileEvent::modified(&path)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced(FileEventKind::Created));
    assert_eq!(h.gateway.count("create_table"), 1);
}

#[tokio::test]
async fn test_not_ready_event_does_not_start_debounce_window() {
    let h = Harness::new();
    let path = h.path("sales.csv");
    let engine = h.engine_with(
        vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)],
        u64::MAX,
        Duration::from_secs(1),
    );

    let outcome = engine.process(FileEvent::created(&path)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::NotReady));

    h.write("sales.csv", SALES);
    let outcome = engine.process(FileEvent::modified(&path)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced(FileEventKind::Created));
}

#[tokio::test]
async fn test_create_for_existing_table_is_handled_as_modify() {
    let h = Harness::new();
    h.gateway.seed_table(BUCKET, "sales", &["id", "product", "amount"]);
    let path = h.write("sales.csv", SALES);
    let engine = h.engine(vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)]);

    let outcome = engine.process(FileEvent::created(&path)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced(FileEventKind::Modified));
    assert_eq!(h.gateway.count("create_table"), 0);
    assert_eq!(h.gateway.count("get_table"), 1);
    assert_eq!(h.gateway.count("load_table"), 1);

    // the header is cached now
    engine.process(FileEvent::modified(&path)).await.unwrap();
    assert_eq!(h.gateway.count("get_table"), 1);
    assert_eq!(h.gateway.count("load_table"), 2);
}

#[tokio::test]
async fn test_modify_for_missing_table_is_handled_as_create() {
    let h = Harness::new();
    let path = h.write("sales.csv", SALES);
    let engine = h.engine(vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)]);

    let outcome = engine.process(FileEvent::modified(&path)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced(FileEventKind::Created));
    assert_eq!(h.gateway.count("create_table"), 1);
    assert_eq!(h.gateway.count("load_table"), 0);
}

#[tokio::test]
async fn test_header_change_aborts_modification() {
    let h = Harness::new();
    let path = h.write("sales.csv", SALES);
    let engine = h.engine(vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)]);
    engine.process(FileEvent::created(&path)).await.unwrap();

    h.write("sales.csv", "id,name,amount\n1,apple,3.50\n2,pear,1.25\n");
    let err = engine.process(FileEvent::modified(&path)).await.unwrap_err();
    match err {
        SyncError::CsvValidation {
            source: CsvValidationError::HeaderMismatch { expected, found },
            ..
        } => {
            assert_eq!(expected, strings(&["id", "product", "amount"]));
            assert_eq!(found, strings(&["id", "name", "amount"]));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(h.gateway.count("load_table"), 0);
}

#[tokio::test]
async fn test_compressed_upload_removed_after_failed_call() {
    let h = Harness::new();
    let path = h.write("sales.csv", SALES);
    let engine = h.engine_with(
        vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)],
        16,
        Duration::ZERO,
    );
    h.gateway.fail_next("create_table", 3);

    let err = engine.process(FileEvent::created(&path)).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage { .. }));

    let creates = h.gateway.create_table_calls();
    assert_eq!(creates.len(), 3);
    for call in &creates {
        let payload = call.payload().unwrap();
        assert!(payload.is_compressed);
        assert_eq!(payload.data_rows().len(), 3);
        assert!(!payload.path.exists());
    }
    assert!(path.exists());
}

#[tokio::test]
async fn test_compressed_upload_removed_after_success() {
    let h = Harness::new();
    let path = h.write("sales.csv", SALES);
    let engine = h.engine_with(
        vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)],
        16,
        Duration::ZERO,
    );

    engine.process(FileEvent::created(&path)).await.unwrap();
    let creates = h.gateway.create_table_calls();
    let payload = creates[0].payload().unwrap();
    assert!(payload.is_compressed);
    assert_ne!(payload.path, path);
    assert!(!payload.path.exists());
}

#[tokio::test]
async fn test_transient_gateway_failures_are_retried() {
    let h = Harness::new();
    let path = h.write("sales.csv", SALES);
    let engine = h.engine(vec![h.mapping("sales.csv", "sales", SyncMode::FullLoad)]);
    engine.process(FileEvent::created(&path)).await.unwrap();

    h.gateway.fail_next("load_table", 2);
    let outcome = engine.process(FileEvent::modified(&path)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced(FileEventKind::Modified));
    assert_eq!(h.gateway.count("load_table"), 3);
}

#[tokio::test]
async fn test_streaming_mapping_posts_batches_only() {
    let h = Harness::new();
    let path = h.write("events.csv", "ts,msg\n1,a\n\n2,b\n3,c\n");
    let engine = h.engine(vec![h.streaming_mapping("events.csv", 2)]);

    let outcome = engine.process(FileEvent::created(&path)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced(FileEventKind::Created));
    assert_eq!(
        h.sink.batches(),
        vec![
            (ENDPOINT.to_string(), strings(&["ts,msg", "1,a"])),
            (ENDPOINT.to_string(), strings(&["2,b", "3,c"])),
        ]
    );
    assert!(h.gateway.calls().is_empty());
}

#[tokio::test]
async fn test_failed_batch_aborts_stream() {
    let h = Harness::new();
    let path = h.write("events.csv", "ts,msg\n1,a\n2,b\n3,c\n");
    let engine = h.engine(vec![h.streaming_mapping("events.csv", 2)]);
    h.sink.fail_next(3);

    let err = engine.process(FileEvent::modified(&path)).await.unwrap_err();
    assert!(matches!(err, SyncError::Streaming { .. }));
    assert_eq!(h.sink.attempts(), 3);
    assert!(h.sink.batches().is_empty());
}

#[tokio::test]
async fn test_failed_event_does_not_stop_later_events() {
    let h = Harness::new();
    let broken = h.write("broken.csv", "a,b,c\n1,2\n");
    let sales = h.write("sales.csv", SALES);
    let engine = h.engine(vec![
        h.mapping("broken.csv", "broken", SyncMode::FullLoad),
        h.mapping("sales.csv", "sales", SyncMode::FullLoad),
    ]);

    assert_eq!(engine.handle_event(FileEvent::created(&broken)).await, None);
    assert_eq!(
        engine.handle_event(FileEvent::created(&sales)).await,
        Some(SyncOutcome::Synced(FileEventKind::Created))
    );
}
