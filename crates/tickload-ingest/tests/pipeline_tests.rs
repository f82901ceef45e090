//! End-to-end ingestion tests against the embedded engine
//!
//! Tests that a run:
//! 1. Appends every extract to its date partition in canonical column order
//! 2. Leaves the source tree untouched and the staging area empty
//! 3. Honours the duplicate policies on reruns
//! 4. Confines engine failures to the shard they happen in

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{init_tracing, Fault, FaultyLauncher, Workspace};
use tickload_common::{DataKind, PartitionDate, ShardKey};
use tickload_ingest::config::DuplicatePolicy;
use tickload_ingest::orchestrator::{FileOutcome, ShardState, WorkerOrchestrator};
use tickload_ingest::partition::PartitionLocation;
use tickload_ingest::schema;
use tickload_ingest::IngestError;

fn location(ws: &Workspace, kind: DataKind, file_name: &str) -> PartitionLocation {
    PartitionLocation::new(
        ws.database_dir().join(kind.table_name()),
        PartitionDate::from_file_name(file_name).unwrap(),
        kind.table_name(),
    )
}

fn may_trades(ws: &Workspace) {
    ws.trade_file(
        "20170501",
        &[
            ("DE0002", 93015, 250, 101.5),
            ("DE0001", 93016, 0, 0.0),
            ("DE0001", 160000, 999, 99.25),
        ],
    );
}

#[tokio::test]
async fn test_run_ingests_trades_and_books_into_date_partitions() -> Result<()> {
    init_tracing();
    let ws = Workspace::new();
    may_trades(&ws);
    ws.book_file("20170502", &[("DE0001", 80000, 5, 10.0), ("DE0003", 80001, 0, 0.0)]);
    ws.trade_file("20170601", &[("DE0004", 120000, 0, 55.0)]);

    let summary = WorkerOrchestrator::new(ws.config("201705", "201706")).run().await;

    assert!(summary.is_success(), "{summary:?}");
    assert_eq!(summary.files_ingested(), 3);
    assert_eq!(summary.rows_appended(), 4);

    let trades = location(&ws, DataKind::Trade, "20170501");
    assert_eq!(
        trades.table_dir(),
        ws.database_dir().join("trades").join("2017.05.01").join("trades")
    );
    assert_eq!(
        trades.column_order()?,
        Some(schema::schema(DataKind::Trade).canonical_columns())
    );
    // the zero-price row is gone and rows are grouped by symbol
    assert_eq!(trades.read_column("sym")?, vec!["DE0001", "DE0002"]);
    assert_eq!(
        trades.read_column("time")?,
        vec!["2017.05.01D16:00:00.000999000", "2017.05.01D09:30:15.000250000"]
    );
    assert_eq!(trades.read_column("Price")?, vec!["99.25", "101.5"]);

    let books = location(&ws, DataKind::Book, "20170502");
    assert_eq!(
        books.table_dir(),
        ws.database_dir().join("books").join("2017.05.02").join("books")
    );
    assert_eq!(books.row_count()?, 1);
    assert_eq!(books.read_column("Bid_Px_Lev_0")?, vec!["10"]);
    assert_eq!(
        books.column_order()?,
        Some(schema::schema(DataKind::Book).canonical_columns())
    );

    let june = location(&ws, DataKind::Trade, "20170601");
    assert_eq!(june.row_count()?, 1);

    // sources untouched, no extraction artifacts left behind
    assert!(ws.feed_dir().join("20170501_EUX_MKtrade.csv.gz").is_file());
    assert!(ws.feed_dir().join("20170502_EUX_Book.csv.gz").is_file());
    assert!(ws.leftover_payloads(&ws.feed_dir()).is_empty());
    assert_eq!(std::fs::read_dir(ws.staging_dir())?.count(), 0);

    for shard in &summary.shards {
        assert_eq!(shard.final_state, ShardState::Terminated);
    }
    Ok(())
}

#[tokio::test]
async fn test_in_place_extraction_removes_payload() -> Result<()> {
    let ws = Workspace::new();
    may_trades(&ws);

    let mut config = ws.config("201705", "201705");
    config.staging_dir = None;
    let summary = WorkerOrchestrator::new(config).run().await;

    assert!(summary.is_success());
    assert!(ws.feed_dir().join("20170501_EUX_MKtrade.csv.gz").is_file());
    assert!(ws.leftover_payloads(&ws.feed_dir()).is_empty());
    assert!(!ws.staging_dir().exists());
    Ok(())
}

#[tokio::test]
async fn test_second_run_appends_rows_again() -> Result<()> {
    let ws = Workspace::new();
    may_trades(&ws);
    let orchestrator = WorkerOrchestrator::new(ws.config("201705", "201705"));

    orchestrator.run().await;
    let summary = orchestrator.run().await;

    assert_eq!(summary.files_ingested(), 1);
    let trades = location(&ws, DataKind::Trade, "20170501");
    assert_eq!(trades.row_count()?, 4);
    assert_eq!(trades.read_column("sym")?, vec!["DE0001", "DE0002", "DE0001", "DE0002"]);
    Ok(())
}

#[tokio::test]
async fn test_skip_ingested_files_guards_reruns() -> Result<()> {
    let ws = Workspace::new();
    may_trades(&ws);
    let mut config = ws.config("201705", "201705");
    config.duplicate_policy = DuplicatePolicy::SkipIngestedFiles;
    let orchestrator = WorkerOrchestrator::new(config);

    let first = orchestrator.run().await;
    assert_eq!(first.files_ingested(), 1);

    let second = orchestrator.run().await;
    assert_eq!(second.files_ingested(), 0);
    assert_eq!(second.files_skipped(), 1);
    assert!(second.is_success());

    let trades = location(&ws, DataKind::Trade, "20170501");
    assert_eq!(trades.row_count()?, 2);

    // a changed extract under the same name is ingested again
    ws.trade_file("20170501", &[("DE0009", 100000, 1, 12.0)]);
    let third = orchestrator.run().await;
    assert_eq!(third.files_ingested(), 1);
    assert_eq!(trades.row_count()?, 3);
    Ok(())
}

#[tokio::test]
async fn test_skip_existing_partition_guards_reruns() -> Result<()> {
    let ws = Workspace::new();
    may_trades(&ws);
    let mut config = ws.config("201705", "201705");
    config.duplicate_policy = DuplicatePolicy::SkipExistingPartition;
    let orchestrator = WorkerOrchestrator::new(config);

    orchestrator.run().await;
    let second = orchestrator.run().await;

    assert_eq!(second.files_skipped(), 1);
    assert_eq!(location(&ws, DataKind::Trade, "20170501").row_count()?, 2);
    Ok(())
}

#[tokio::test]
async fn test_empty_month_starts_no_engine() {
    let ws = Workspace::new();
    may_trades(&ws);
    ws.trade_file("20170703", &[("DE0001", 100000, 0, 1.0)]);

    let launcher = Arc::new(FaultyLauncher::new());
    let orchestrator = WorkerOrchestrator::with_launcher(ws.config("201705", "201707"), launcher.clone());
    let summary = orchestrator.run().await;

    assert!(summary.is_success());
    let expected: Vec<ShardKey> = vec!["201705".parse().unwrap(), "201707".parse().unwrap()];
    assert_eq!(launcher.launched(), expected);

    let june = summary
        .shards
        .iter()
        .find(|s| s.shard.to_string() == "201706")
        .unwrap();
    assert!(june.files.is_empty());
    assert_eq!(june.port, None);
    assert_eq!(june.final_state, ShardState::Terminated);
    assert_eq!(june.missing_kinds, DataKind::ALL.to_vec());
    assert!(june.is_success());

    let may = summary.shards.iter().find(|s| s.shard.to_string() == "201705").unwrap();
    assert_eq!(may.missing_kinds, vec![DataKind::Order, DataKind::Book]);
}

#[tokio::test]
async fn test_lost_connection_drains_shard_and_spares_siblings() {
    init_tracing();
    let ws = Workspace::new();
    may_trades(&ws);
    ws.trade_file("20170502", &[("DE0001", 100000, 0, 1.0)]);
    ws.book_file("20170503", &[("DE0001", 100000, 0, 10.0)]);
    ws.trade_file("20170601", &[("DE0004", 120000, 0, 55.0)]);

    let launcher = Arc::new(FaultyLauncher::new().with_fault("201705", Fault::DropOnLoad(2)));
    let orchestrator = WorkerOrchestrator::with_launcher(ws.config("201705", "201706"), launcher.clone());
    let summary = orchestrator.run().await;

    let may = &summary.shards[0];
    assert!(matches!(may.error, Some(IngestError::EngineCommunication(_))));
    assert_eq!(may.files_ingested(), 1);
    assert_eq!(may.files_failed(), 1);
    // the book file is never attempted once the engine is gone
    assert_eq!(may.files.len(), 2);
    assert_eq!(may.final_state, ShardState::Terminated);

    let june = &summary.shards[1];
    assert!(june.is_success());
    assert_eq!(june.files_ingested(), 1);

    // both engines were torn down
    assert_eq!(launcher.closed(), 2);
    assert!(!location(&ws, DataKind::Book, "20170503").exists());
    assert_eq!(location(&ws, DataKind::Trade, "20170601").row_count().unwrap(), 1);
}

#[tokio::test]
async fn test_engine_startup_failure_spares_siblings() {
    let ws = Workspace::new();
    may_trades(&ws);
    ws.trade_file("20170601", &[("DE0004", 120000, 0, 55.0)]);

    let launcher = Arc::new(FaultyLauncher::new().with_fault("201705", Fault::Refuse));
    let orchestrator = WorkerOrchestrator::with_launcher(ws.config("201705", "201706"), launcher.clone());
    let summary = orchestrator.run().await;

    let may = &summary.shards[0];
    assert!(matches!(may.error, Some(IngestError::EngineStartupTimeout { .. })));
    assert!(may.files.is_empty());
    assert_eq!(may.final_state, ShardState::Terminated);

    assert!(summary.shards[1].is_success());
    assert_eq!(summary.failed_shards().count(), 1);
    assert!(!summary.is_success());
}

#[tokio::test]
async fn test_stalled_shard_times_out_and_is_torn_down() {
    let ws = Workspace::new();
    may_trades(&ws);

    let launcher =
        Arc::new(FaultyLauncher::new().with_fault("201705", Fault::StallLoad(Duration::from_secs(30))));
    let mut config = ws.config("201705", "201705");
    config.shard_timeout_secs = 1;
    let orchestrator = WorkerOrchestrator::with_launcher(config, launcher.clone());

    let summary = orchestrator.run().await;

    let may = &summary.shards[0];
    assert!(matches!(may.error, Some(IngestError::ShardTimeout { .. })));
    assert_eq!(may.final_state, ShardState::Terminated);
    assert_eq!(launcher.closed(), 1);
    assert!(!location(&ws, DataKind::Trade, "20170501").exists());
}

#[tokio::test]
async fn test_corrupt_extract_fails_only_that_file() -> Result<()> {
    let ws = Workspace::new();
    std::fs::write(ws.feed_dir().join("20170501_EUX_MKtrade.csv.gz"), b"not a gzip stream")?;
    ws.trade_file("20170502", &[("DE0001", 100000, 0, 1.0)]);

    let summary = WorkerOrchestrator::new(ws.config("201705", "201705")).run().await;

    let may = &summary.shards[0];
    assert!(may.error.is_none());
    assert_eq!(may.files_failed(), 1);
    assert_eq!(may.files_ingested(), 1);
    assert!(matches!(
        &may.files[0].outcome,
        FileOutcome::Failed { reason } if reason.contains("Extraction")
    ));

    // the staged copy of the failed file is kept for inspection
    assert!(ws.staging_dir().join("20170501_EUX_MKtrade.csv.gz").is_file());
    assert!(ws.feed_dir().join("20170501_EUX_MKtrade.csv.gz").is_file());
    Ok(())
}

#[tokio::test]
async fn test_malformed_payload_fails_file_and_keeps_partition_clean() -> Result<()> {
    let ws = Workspace::new();
    common::write_gz(
        &ws.feed_dir().join("20170501_EUX_MKtrade.csv.gz"),
        &[
            common::TRADE_HEADER.to_string(),
            "DE0001|20170501|100000|0|0|10|not-a-price|1000".to_string(),
        ],
    );

    let summary = WorkerOrchestrator::new(ws.config("201705", "201705")).run().await;

    let may = &summary.shards[0];
    assert!(may.error.is_none());
    assert_eq!(may.files_failed(), 1);
    assert!(!location(&ws, DataKind::Trade, "20170501").exists());
    // decompressed payload retained next to the staged copy
    assert_eq!(ws.leftover_payloads(&ws.staging_dir()).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_quoted_line_break_fails_file_instead_of_shifting_rows() -> Result<()> {
    let ws = Workspace::new();
    common::write_gz(
        &ws.feed_dir().join("20170501_EUX_MKtrade.csv.gz"),
        &[
            common::TRADE_HEADER.to_string(),
            "DE0001|20170501|100000|0|0|10|1.5|1000".to_string(),
            "\"DE\nX\"|20170501|100001|0|0|10|2.5|1000".to_string(),
        ],
    );

    let summary = WorkerOrchestrator::new(ws.config("201705", "201705")).run().await;

    let may = &summary.shards[0];
    assert!(may.error.is_none());
    assert_eq!(may.files_failed(), 1);
    match &may.files[0].outcome {
        FileOutcome::Failed { reason } => assert!(reason.contains("could not load"), "{reason}"),
        other => panic!("expected a load failure, got {other:?}"),
    }
    assert!(!location(&ws, DataKind::Trade, "20170501").exists());
    Ok(())
}

#[tokio::test]
async fn test_missing_source_directory_is_reported() {
    let ws = Workspace::new();
    may_trades(&ws);
    let mut config = ws.config("201705", "201705");
    config.source_dirs = vec!["XEUR".to_string(), common::FEED.to_string()];

    let summary = WorkerOrchestrator::new(config).run().await;

    assert_eq!(summary.directory_errors.len(), 1);
    assert!(matches!(summary.directory_errors[0], IngestError::DirectoryNotFound(_)));
    assert_eq!(summary.files_ingested(), 1);
    assert!(!summary.is_success());
}

#[tokio::test]
async fn test_reordered_source_columns_land_in_canonical_order() -> Result<()> {
    let ws = Workspace::new();
    common::write_gz(
        &ws.feed_dir().join("20170501_EUX_MKtrade.csv.gz"),
        &[
            "ISIN|Date|TimeSec|TimeMM|MarketTime|Volume|Price|Qty".to_string(),
            "DE0001|20170501|100000|0|0|500|5.5|7".to_string(),
        ],
    );

    let summary = WorkerOrchestrator::new(ws.config("201705", "201705")).run().await;
    assert!(summary.is_success());

    let trades = location(&ws, DataKind::Trade, "20170501");
    assert_eq!(
        trades.column_order()?,
        Some(vec![
            "sym".to_string(),
            "time".to_string(),
            "Price".to_string(),
            "Qty".to_string(),
            "Volume".to_string()
        ])
    );
    assert_eq!(trades.read_column("Qty")?, vec!["7"]);
    assert_eq!(trades.read_column("Volume")?, vec!["500"]);
    Ok(())
}

#[tokio::test]
async fn test_disjoint_files_for_one_date_are_unioned() -> Result<()> {
    let ws = Workspace::new();
    may_trades(&ws);
    let second_feed = ws.source_root().join("XEUR");
    std::fs::create_dir_all(&second_feed)?;
    common::write_gz(
        &second_feed.join("20170501_XEUR_MKtrade.csv.gz"),
        &[
            common::TRADE_HEADER.to_string(),
            "DE0007|20170501|110000|0|0|10|7.0|1000".to_string(),
        ],
    );

    let mut config = ws.config("201705", "201705");
    config.source_dirs = vec![common::FEED.to_string(), "XEUR".to_string()];
    let summary = WorkerOrchestrator::new(config).run().await;

    assert!(summary.is_success());
    let trades = location(&ws, DataKind::Trade, "20170501");
    assert_eq!(trades.read_column("sym")?, vec!["DE0001", "DE0002", "DE0007"]);
    Ok(())
}
