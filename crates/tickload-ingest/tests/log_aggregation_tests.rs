//! Shard log aggregation during a real run

mod common;

use common::Workspace;
use tickload_ingest::log_aggregator::LogAggregator;
use tickload_ingest::orchestrator::WorkerOrchestrator;
use tracing_subscriber::layer::SubscriberExt;

#[tokio::test]
async fn test_shard_records_reach_single_sink_tagged_by_shard() {
    let ws = Workspace::new();
    ws.trade_file("20170501", &[("DE0001", 100000, 0, 1.0)]);
    ws.trade_file("20170601", &[("DE0002", 100000, 0, 2.0)]);

    let (aggregator, layer) = LogAggregator::start(1024, Vec::new());
    let subscriber = tracing_subscriber::registry().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);

    let summary = WorkerOrchestrator::new(ws.config("201705", "201706")).run().await;
    drop(guard);

    let (stats, sink) = aggregator.finish().await.unwrap();
    let text = String::from_utf8(sink).unwrap();

    assert!(summary.is_success());
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.written as usize, text.lines().count());

    for shard in ["201705", "201706"] {
        let tagged = format!(" - {shard} - Shard finished");
        assert!(
            text.lines().any(|line| line.starts_with("INFO: ") && line.contains(&tagged)),
            "no finish line for {shard} in:\n{text}"
        );
    }
    // run-level records carry no shard
    assert!(text.lines().any(|line| line.contains(" - - - Ingestion run completed")));
}

#[tokio::test]
async fn test_month_without_files_is_reported_as_warning() {
    let ws = Workspace::new();
    ws.trade_file("20170501", &[("DE0001", 100000, 0, 1.0)]);

    let (aggregator, layer) = LogAggregator::start(1024, Vec::new());
    let subscriber = tracing_subscriber::registry().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);

    let summary = WorkerOrchestrator::new(ws.config("201705", "201706")).run().await;
    drop(guard);

    let (_, sink) = aggregator.finish().await.unwrap();
    let text = String::from_utf8(sink).unwrap();

    assert!(summary.is_success());
    assert!(
        text.lines()
            .any(|line| line.starts_with("WARN: ") && line.contains(" - 201706 - No files for shard")),
        "no empty-shard warning in:\n{text}"
    );
    assert!(
        text.lines()
            .any(|line| line.starts_with("WARN: ") && line.contains(" - 201705 - ") && line.contains("book")),
        "no missing-kind warning in:\n{text}"
    );
}
