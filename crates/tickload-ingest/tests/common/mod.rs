//! Shared fixtures for the ingest integration tests
//!
//! Builds a throwaway source tree of gzipped extracts and a configuration
//! that runs every shard against the embedded engine. [`FaultyLauncher`]
//! wraps the embedded engine to inject startup failures, lost connections
//! and stalls.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use tickload_common::ShardKey;
use tickload_ingest::config::{DuplicatePolicy, EngineBackend, IngestConfig};
use tickload_ingest::engine::{
    Engine, EngineCommand, EngineError, EngineLauncher, EngineReply, EngineWorker, LocalEngine,
};
use tickload_ingest::IngestError;

pub const FEED: &str = "EUX";

pub const TRADE_HEADER: &str = "ISIN|Date|TimeSec|TimeMM|MarketTime|Qty|Price|Volume";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tickload_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn book_header() -> String {
    let mut header = String::from("ISIN|Date|TimeSec|TimeMM");
    for level in 0..5 {
        header.push_str(&format!(
            "|Bid_Px_Lev_{level}|Bid_Qty_Lev_{level}|Ask_Px_Lev_{level}|Ask_Qty_Lev_{level}"
        ));
    }
    header
}

/// One book row with every level priced from `bid`
pub fn book_row(isin: &str, date: &str, hhmmss: u32, ms: u32, bid: f64) -> String {
    let mut row = format!("{isin}|{date}|{hhmmss}|{ms}");
    for level in 0..5 {
        let step = level as f64 * 0.5;
        row.push_str(&format!("|{}|100|{}|200", bid - step, bid + 1.0 + step));
    }
    row
}

/// Write `lines` as a gzip file
pub fn write_gz(path: &Path, lines: &[String]) {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for line in lines {
        writeln!(encoder, "{line}").unwrap();
    }
    let mut file = File::create(path).unwrap();
    file.write_all(&encoder.finish().unwrap()).unwrap();
}

/// Temporary source tree, database and staging directory
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("m_data").join(FEED)).unwrap();
        Self { dir }
    }

    pub fn source_root(&self) -> PathBuf {
        self.dir.path().join("m_data")
    }

    pub fn feed_dir(&self) -> PathBuf {
        self.source_root().join(FEED)
    }

    pub fn database_dir(&self) -> PathBuf {
        self.dir.path().join("db")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    /// Write a trade extract; each row is `(isin, hhmmss, ms, price)`
    pub fn trade_file(&self, day: &str, rows: &[(&str, u32, u32, f64)]) -> PathBuf {
        let name = format!("{day}_{FEED}_MKtrade.csv.gz");
        let mut lines = vec![TRADE_HEADER.to_string()];
        lines.extend(
            rows.iter()
                .map(|(isin, hhmmss, ms, price)| format!("{isin}|{day}|{hhmmss}|{ms}|0|10|{price}|1000")),
        );
        let path = self.feed_dir().join(name);
        write_gz(&path, &lines);
        path
    }

    /// Write a book extract; each row is `(isin, hhmmss, ms, best bid)`
    pub fn book_file(&self, day: &str, rows: &[(&str, u32, u32, f64)]) -> PathBuf {
        let name = format!("{day}_{FEED}_Book.csv.gz");
        let mut lines = vec![book_header()];
        lines.extend(
            rows.iter()
                .map(|(isin, hhmmss, ms, bid)| book_row(isin, day, *hhmmss, *ms, *bid)),
        );
        let path = self.feed_dir().join(name);
        write_gz(&path, &lines);
        path
    }

    /// Local-engine configuration covering `first..=last`
    pub fn config(&self, first: &str, last: &str) -> IngestConfig {
        let mut config = IngestConfig {
            source_root: self.source_root(),
            source_dirs: vec![FEED.to_string()],
            database_dir: self.database_dir(),
            staging_dir: Some(self.staging_dir()),
            first_shard: first.parse().unwrap(),
            last_shard: last.parse().unwrap(),
            max_parallel_shards: 2,
            duplicate_policy: DuplicatePolicy::Allow,
            ..IngestConfig::default()
        };
        config.engine.backend = EngineBackend::Local;
        config.validate().unwrap();
        config
    }

    /// Files left anywhere under `dir` whose name ends with `.csv`
    pub fn leftover_payloads(&self, dir: &Path) -> Vec<PathBuf> {
        if !dir.exists() {
            return Vec::new();
        }
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "csv"))
            .collect()
    }
}

/// Fault injected into one shard's engine
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// The engine never becomes ready
    Refuse,
    /// The connection drops on the n-th load (1-based)
    DropOnLoad(usize),
    /// Every load hangs for this long
    StallLoad(Duration),
}

/// Launches embedded engines, injecting faults into selected shards
#[derive(Default)]
pub struct FaultyLauncher {
    faults: HashMap<ShardKey, Fault>,
    launched: Mutex<Vec<ShardKey>>,
    closed: Arc<AtomicUsize>,
}

impl FaultyLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(mut self, shard: &str, fault: Fault) -> Self {
        self.faults.insert(shard.parse().unwrap(), fault);
        self
    }

    pub fn launched(&self) -> Vec<ShardKey> {
        let mut shards = self.launched.lock().unwrap().clone();
        shards.sort();
        shards
    }

    /// Engines whose connection was closed during teardown
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLauncher for FaultyLauncher {
    async fn launch(&self, shard: ShardKey, port: u16) -> tickload_ingest::Result<EngineWorker> {
        let fault = self.faults.get(&shard).copied();
        if let Some(Fault::Refuse) = fault {
            return Err(IngestError::EngineStartupTimeout {
                port,
                attempts: 1,
                reason: "connection refused".to_string(),
            });
        }

        self.launched.lock().unwrap().push(shard);
        let engine = FaultyEngine {
            inner: LocalEngine::new(),
            fault,
            loads: 0,
            closed: Arc::clone(&self.closed),
        };
        Ok(EngineWorker::new(shard, port, Box::new(engine), None, Duration::from_secs(1)))
    }

    fn name(&self) -> &'static str {
        "faulty"
    }
}

struct FaultyEngine {
    inner: LocalEngine,
    fault: Option<Fault>,
    loads: usize,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Engine for FaultyEngine {
    async fn execute(&mut self, command: &EngineCommand) -> Result<EngineReply, EngineError> {
        if let EngineCommand::Load { .. } = command {
            self.loads += 1;
            match self.fault {
                Some(Fault::DropOnLoad(n)) if n == self.loads => {
                    self.inner.close().await;
                    return Err(EngineError::ConnectionLost("connection reset by peer".to_string()));
                },
                Some(Fault::StallLoad(delay)) => tokio::time::sleep(delay).await,
                _ => {},
            }
        }
        self.inner.execute(command).await
    }

    fn protocol_version(&self) -> u8 {
        self.inner.protocol_version()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await;
    }
}
