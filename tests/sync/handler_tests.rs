// Tests for the sync mode handlers in sync::handlers

use kbc_sync::config::{MappingOptions, SyncMode};
use kbc_sync::gateway::GatewayCall;
use kbc_sync::sync::{analyze, HandlerContext, SyncHandler, SyncTarget};

use super::common::{strings, Harness, BUCKET, ENDPOINT, SALES};

const LARGE_THRESHOLD: u64 = 50 * 1024 * 1024;

async fn created(handler: SyncHandler, ctx: &HandlerContext, h: &Harness, name: &str, options: &MappingOptions) {
    let path = h.path(name);
    let profile = analyze(&path).unwrap();
    let target = SyncTarget {
        path: &path,
        bucket_id: BUCKET,
        table_id: name,
        options,
        profile: &profile,
    };
    handler.handle_created(ctx, &target).await.unwrap();
}

async fn modified(handler: SyncHandler, ctx: &HandlerContext, h: &Harness, name: &str, options: &MappingOptions) {
    let path = h.path(name);
    let profile = analyze(&path).unwrap();
    let target = SyncTarget {
        path: &path,
        bucket_id: BUCKET,
        table_id: name,
        options,
        profile: &profile,
    };
    handler.handle_modified(ctx, &target).await.unwrap();
}

#[tokio::test]
async fn test_full_load_reloads_on_every_modification() {
    let h = Harness::new();
    h.write("sales", SALES);
    let ctx = h.context(LARGE_THRESHOLD);
    let options = MappingOptions::default();

    created(SyncHandler::FullLoad, &ctx, &h, "sales", &options).await;
    for _ in 0..3 {
        modified(SyncHandler::FullLoad, &ctx, &h, "sales", &options).await;
    }

    assert_eq!(h.gateway.count("create_table"), 1);
    let loads = h.gateway.load_table_calls();
    assert_eq!(loads.len(), 3);
    assert!(loads
        .iter()
        .all(|c| matches!(c, GatewayCall::LoadTable { incremental: false, .. })));
    assert_eq!(h.gateway.table_rows(BUCKET, "sales").unwrap().len(), 3);
}

#[tokio::test]
async fn test_bucket_created_only_when_missing() {
    let h = Harness::new();
    h.write("a", SALES);
    h.write("b", SALES);
    let ctx = h.context(LARGE_THRESHOLD);
    let options = MappingOptions::default();

    created(SyncHandler::FullLoad, &ctx, &h, "a", &options).await;
    created(SyncHandler::FullLoad, &ctx, &h, "b", &options).await;

    assert_eq!(h.gateway.count("bucket_exists"), 2);
    let buckets: Vec<_> = h
        .gateway
        .calls()
        .into_iter()
        .filter(|c| matches!(c, GatewayCall::CreateBucket { .. }))
        .collect();
    assert_eq!(
        buckets,
        vec![GatewayCall::CreateBucket {
            bucket_id: BUCKET.to_string(),
            stage: "in".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_incremental_without_growth_sends_nothing() {
    let h = Harness::new();
    h.write("sales", SALES);
    let ctx = h.context(LARGE_THRESHOLD);
    let options = MappingOptions::default();

    created(SyncHandler::Incremental, &ctx, &h, "sales", &options).await;
    modified(SyncHandler::Incremental, &ctx, &h, "sales", &options).await;
    modified(SyncHandler::Incremental, &ctx, &h, "sales", &options).await;

    assert_eq!(h.gateway.count("load_table"), 0);
    assert_eq!(ctx.state.watermark(&h.path("sales")), 3);
}

#[tokio::test]
async fn test_incremental_shrink_is_ignored() {
    let h = Harness::new();
    h.write("sales", SALES);
    let ctx = h.context(LARGE_THRESHOLD);
    let options = MappingOptions::default();

    created(SyncHandler::Incremental, &ctx, &h, "sales", &options).await;
    h.write("sales", "id,product,amount\n1,apple,3.50\n");
    modified(SyncHandler::Incremental, &ctx, &h, "sales", &options).await;

    assert_eq!(h.gateway.count("load_table"), 0);
    assert_eq!(ctx.state.watermark(&h.path("sales")), 3);
}

#[tokio::test]
async fn test_incremental_upserts_by_primary_key() {
    let h = Harness::new();
    h.write("sales", SALES);
    let ctx = h.context(LARGE_THRESHOLD);
    let options = MappingOptions {
        primary_key: strings(&["id"]),
        ..MappingOptions::default()
    };

    created(SyncHandler::Incremental, &ctx, &h, "sales", &options).await;
    h.append("sales", "2,pear,9.99\n4,fig,2.00\n");
    modified(SyncHandler::Incremental, &ctx, &h, "sales", &options).await;

    let creates = h.gateway.create_table_calls();
    assert!(matches!(
        &creates[0],
        GatewayCall::CreateTable { primary_key, .. } if primary_key == &strings(&["id"])
    ));
    let stored = h.gateway.table_rows(BUCKET, "sales").unwrap();
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[1], strings(&["2", "pear", "9.99"]));
    assert_eq!(ctx.state.watermark(&h.path("sales")), 5);
}

#[tokio::test]
async fn test_incremental_failure_keeps_watermark() {
    let h = Harness::new();
    h.write("sales", SALES);
    let ctx = h.context(LARGE_THRESHOLD);
    let options = MappingOptions::default();

    created(SyncHandler::Incremental, &ctx, &h, "sales", &options).await;
    h.append("sales", "4,fig,2.00\n");
    h.gateway.fail_next("load_table", 3);

    let path = h.path("sales");
    let profile = analyze(&path).unwrap();
    let target = SyncTarget {
        path: &path,
        bucket_id: BUCKET,
        table_id: "sales",
        options: &options,
        profile: &profile,
    };
    assert!(SyncHandler::Incremental
        .handle_modified(&ctx, &target)
        .await
        .is_err());
    assert_eq!(ctx.state.watermark(&path), 3);

    // the same rows go out on the next change
    SyncHandler::Incremental
        .handle_modified(&ctx, &target)
        .await
        .unwrap();
    let loads = h.gateway.load_table_calls();
    assert_eq!(loads.last().unwrap().payload().unwrap().data_rows().len(), 1);
    assert_eq!(ctx.state.watermark(&path), 4);
}

#[tokio::test]
async fn test_streaming_flushes_partial_batch() {
    let h = Harness::new();
    h.write("events", "ts,msg\n1,a\n2,b\n\n3,c\n4,d\n");
    let ctx = h.context(LARGE_THRESHOLD);
    let options = MappingOptions {
        batch_size: 2,
        streaming_endpoint: Some(ENDPOINT.to_string()),
        ..MappingOptions::default()
    };

    modified(SyncHandler::Streaming, &ctx, &h, "events", &options).await;

    let sizes: Vec<usize> = h.sink.batches().iter().map(|(_, b)| b.len()).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(h.sink.batches()[2].1, strings(&["4,d"]));
}

#[tokio::test]
async fn test_streaming_resends_whole_file() {
    let h = Harness::new();
    h.write("events", "ts,msg\n1,a\n");
    let ctx = h.context(LARGE_THRESHOLD);
    let options = MappingOptions {
        batch_size: 10,
        streaming_endpoint: Some(ENDPOINT.to_string()),
        ..MappingOptions::default()
    };

    created(SyncHandler::Streaming, &ctx, &h, "events", &options).await;
    h.append("events", "2,b\n");
    modified(SyncHandler::Streaming, &ctx, &h, "events", &options).await;

    let batches = h.sink.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1].1, strings(&["ts,msg", "1,a", "2,b"]));
}

#[test]
fn test_handler_follows_mode() {
    assert_eq!(SyncHandler::for_mode(SyncMode::Incremental), SyncHandler::Incremental);
    assert_eq!(SyncHandler::for_mode(SyncMode::Streaming).mode(), SyncMode::Streaming);
}
