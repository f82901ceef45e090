//! tickload Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads daily exchange extracts into a date-partitioned columnar database.
//!
//! # Pipeline
//!
//! - **Catalog**: finds the compressed extracts of a month shard ([`catalog`])
//! - **Staging**: copies and decompresses an extract ([`staging`])
//! - **Sink**: loads, transforms and appends a payload through an engine ([`sink`])
//! - **Cleanup**: removes extraction artifacts after success ([`cleanup`])
//! - **Orchestrator**: one engine per month shard, shards in parallel ([`orchestrator`])
//! - **Log aggregation**: a single writer for the logs of every shard ([`log_aggregator`])
//!
//! Engines are reached through the [`engine::Engine`] trait: either a `q`
//! process spoken to over IPC, or the in-process [`engine::LocalEngine`].
//!
//! # Example
//!
//! ```no_run
//! use tickload_ingest::config::IngestConfig;
//! use tickload_ingest::orchestrator::WorkerOrchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load(None)?;
//!     let summary = WorkerOrchestrator::new(config).run().await;
//!     println!("{} files ingested", summary.files_ingested());
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod log_aggregator;
pub mod orchestrator;
pub mod partition;
pub mod schema;
pub mod sink;
pub mod staging;

pub use catalog::{FileCatalog, SourceFile};
pub use cleanup::{CleanupManager, CleanupReport, CleanupWarning};
pub use config::{DuplicatePolicy, EngineBackend, IngestConfig};
pub use error::{IngestError, Result};
pub use log_aggregator::{LogAggregator, LogRecord};
pub use orchestrator::{RunSummary, ShardOutcome, ShardState, WorkerOrchestrator};
pub use sink::{IngestReport, IngestRequest, IngestSink};
pub use staging::{StagingCopy, StagingExtractor};
