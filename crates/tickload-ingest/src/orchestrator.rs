//! Shard orchestration
//!
//! Work is partitioned by calendar month. Each shard runs as its own tokio
//! task with a private engine on a port derived from the month, and moves
//! through a fixed lifecycle:
//!
//! ```text
//! Idle -> EngineStarting -> EngineReady -> Ingesting -> Draining -> Terminated
//! ```
//!
//! Discovery happens while idle, so a month without files never starts an
//! engine. Files are ingested one at a time in kind order (trades, orders,
//! books) and name order. Whatever happens during ingestion, the engine is
//! torn down before the shard reports its outcome, and a failing shard never
//! affects its siblings.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tickload_common::checksum::sha256_file;
use tickload_common::{DataKind, ShardKey};
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};

use crate::catalog::{FileCatalog, SourceFile};
use crate::cleanup::{CleanupManager, CleanupWarning};
use crate::config::{DuplicatePolicy, IngestConfig};
use crate::engine::{derive_port, Engine, EngineLauncher};
use crate::error::{IngestError, Result};
use crate::partition::PartitionLocation;
use crate::sink::{IngestReport, IngestRequest, IngestSink};
use crate::staging::StagingExtractor;

/// Lifecycle of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Idle,
    EngineStarting,
    EngineReady,
    Ingesting,
    Draining,
    Terminated,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardState::Idle => "idle",
            ShardState::EngineStarting => "engine_starting",
            ShardState::EngineReady => "engine_ready",
            ShardState::Ingesting => "ingesting",
            ShardState::Draining => "draining",
            ShardState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// What happened to one source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Ingested {
        report: IngestReport,
        cleanup_warnings: Vec<CleanupWarning>,
    },
    /// Left alone by the duplicate guard
    Skipped { reason: String },
    /// Failed; extraction artifacts were kept for inspection
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResult {
    pub file_name: String,
    pub kind: DataKind,
    pub outcome: FileOutcome,
}

/// Result of one shard of one source directory
#[derive(Debug)]
pub struct ShardOutcome {
    pub shard: ShardKey,
    pub source_dir: PathBuf,
    /// Port of the engine, when one was started
    pub port: Option<u16>,
    pub files: Vec<FileResult>,
    /// Kinds with no file for this month; reported, not a failure
    pub missing_kinds: Vec<DataKind>,
    /// Error that stopped the shard early
    pub error: Option<IngestError>,
    pub final_state: ShardState,
}

impl ShardOutcome {
    fn new(shard: ShardKey, source_dir: &Path) -> Self {
        Self {
            shard,
            source_dir: source_dir.to_path_buf(),
            port: None,
            files: Vec::new(),
            missing_kinds: Vec::new(),
            error: None,
            final_state: ShardState::Idle,
        }
    }

    fn count(&self, predicate: impl Fn(&FileOutcome) -> bool) -> usize {
        self.files.iter().filter(|f| predicate(&f.outcome)).count()
    }

    pub fn files_ingested(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Ingested { .. }))
    }

    pub fn files_skipped(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Skipped { .. }))
    }

    pub fn files_failed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Failed { .. }))
    }

    /// Rows appended across all ingested files, as reported by the engine
    pub fn rows_appended(&self) -> u64 {
        self.files
            .iter()
            .filter_map(|f| match &f.outcome {
                FileOutcome::Ingested { report, .. } => report.rows_kept,
                _ => None,
            })
            .sum()
    }

    pub fn cleanup_warnings(&self) -> impl Iterator<Item = &CleanupWarning> {
        self.files.iter().flat_map(|f| match &f.outcome {
            FileOutcome::Ingested {
                cleanup_warnings, ..
            } => cleanup_warnings.as_slice(),
            _ => &[][..],
        })
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.files_failed() == 0
    }
}

/// Outcome of a whole run
#[derive(Debug, Default)]
pub struct RunSummary {
    pub shards: Vec<ShardOutcome>,
    /// Source directories that could not be processed at all
    pub directory_errors: Vec<IngestError>,
}

impl RunSummary {
    pub fn files_ingested(&self) -> usize {
        self.shards.iter().map(ShardOutcome::files_ingested).sum()
    }

    pub fn files_skipped(&self) -> usize {
        self.shards.iter().map(ShardOutcome::files_skipped).sum()
    }

    pub fn files_failed(&self) -> usize {
        self.shards.iter().map(ShardOutcome::files_failed).sum()
    }

    pub fn rows_appended(&self) -> u64 {
        self.shards.iter().map(ShardOutcome::rows_appended).sum()
    }

    pub fn failed_shards(&self) -> impl Iterator<Item = &ShardOutcome> {
        self.shards.iter().filter(|s| !s.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.directory_errors.is_empty() && self.shards.iter().all(ShardOutcome::is_success)
    }
}

/// Runs the shards of every configured source directory
#[derive(Clone)]
pub struct WorkerOrchestrator {
    config: Arc<IngestConfig>,
    launcher: Arc<dyn EngineLauncher>,
    catalog: FileCatalog,
    extractor: StagingExtractor,
    sink: IngestSink,
    cleanup: CleanupManager,
}

impl WorkerOrchestrator {
    /// Create an orchestrator using the launcher of the configured backend
    pub fn new(config: IngestConfig) -> Self {
        let launcher = config.engine.launcher();
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: IngestConfig, launcher: Arc<dyn EngineLauncher>) -> Self {
        let extractor = StagingExtractor::new(config.staging_dir.clone());
        Self {
            config: Arc::new(config),
            launcher,
            catalog: FileCatalog::new(),
            extractor,
            sink: IngestSink::new(),
            cleanup: CleanupManager::new(),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Process every source directory in turn
    pub async fn run(&self) -> RunSummary {
        let shards = self.config.shards();
        info!(
            directories = self.config.source_dirs.len(),
            shards = shards.len(),
            engine = self.launcher.name(),
            max_parallel = self.config.max_parallel_shards,
            "Starting ingestion run"
        );

        let mut summary = RunSummary::default();

        for name in &self.config.source_dirs {
            let dir = self.config.source_dir(name);
            if !dir.is_dir() {
                let e = IngestError::DirectoryNotFound(dir);
                error!("Skipping source directory: {}", e);
                summary.directory_errors.push(e);
                continue;
            }

            info!(directory = %dir.display(), "Processing source directory");
            let outcomes = self.run_directory(&dir, &shards).await;
            summary.shards.extend(outcomes);
        }

        let failed_shards = summary.failed_shards().count();
        info!(
            "Ingestion run completed: {} files ingested, {} skipped, {} failed, {} rows, {} shards with errors",
            summary.files_ingested(),
            summary.files_skipped(),
            summary.files_failed(),
            summary.rows_appended(),
            failed_shards
        );

        summary
    }

    /// Run the given shards of one directory in parallel, bounded by `max_parallel_shards`
    pub async fn run_directory(&self, dir: &Path, shards: &[ShardKey]) -> Vec<ShardOutcome> {
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_shards));

        let tasks = shards.iter().map(|&shard| {
            let this = self.clone();
            let dir = dir.to_path_buf();
            let permits = Arc::clone(&permits);
            let span = info_span!("shard", shard = %shard);

            let handle = tokio::spawn(
                async move {
                    // the semaphore is never closed
                    let _permit = permits.acquire_owned().await.ok();
                    this.run_shard(shard, &dir).await
                }
                .instrument(span),
            );
            async move { (shard, handle.await) }
        });

        join_all(tasks)
            .await
            .into_iter()
            .map(|(shard, joined)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(shard = %shard, "Shard task failed: {}", e);
                    let mut outcome = ShardOutcome::new(shard, dir);
                    outcome.error = Some(IngestError::TaskFailed(e.to_string()));
                    outcome.final_state = ShardState::Terminated;
                    outcome
                },
            })
            .collect()
    }

    /// Drive one shard through its whole lifecycle
    pub async fn run_shard(&self, shard: ShardKey, dir: &Path) -> ShardOutcome {
        let mut outcome = ShardOutcome::new(shard, dir);
        let mut state = ShardState::Idle;

        let files = match self.discover(shard, dir, &mut outcome.missing_kinds) {
            Ok(files) => files,
            Err(e) => {
                error!("Discovery failed: {}", e);
                outcome.error = Some(e);
                transition(&mut state, ShardState::Terminated);
                outcome.final_state = state;
                return outcome;
            },
        };

        if files.is_empty() {
            warn!(dir = %dir.display(), "No files for shard, engine not started");
            transition(&mut state, ShardState::Terminated);
            outcome.final_state = state;
            return outcome;
        }

        transition(&mut state, ShardState::EngineStarting);
        let started = match derive_port(self.config.engine.base_port, shard) {
            Ok(port) => {
                outcome.port = Some(port);
                self.launcher.launch(shard, port).await
            },
            Err(e) => Err(e),
        };
        let mut worker = match started {
            Ok(worker) => worker,
            Err(e) => {
                error!("Engine failed to start: {}", e);
                outcome.error = Some(e);
                transition(&mut state, ShardState::Terminated);
                outcome.final_state = state;
                return outcome;
            },
        };
        transition(&mut state, ShardState::EngineReady);

        transition(&mut state, ShardState::Ingesting);
        let limit = self.config.shard_timeout();
        let ingested = tokio::time::timeout(
            limit,
            self.ingest_files(worker.engine_mut(), &files, &mut outcome.files),
        )
        .await;

        match ingested {
            Ok(Ok(())) => {},
            Ok(Err(fatal)) => {
                error!("Shard stopped early: {}", fatal);
                outcome.error = Some(fatal);
            },
            Err(_) => {
                error!(timeout = ?limit, "Shard timed out, draining");
                outcome.error = Some(IngestError::ShardTimeout {
                    shard,
                    timeout: limit,
                });
            },
        }

        transition(&mut state, ShardState::Draining);
        worker.terminate().await;
        transition(&mut state, ShardState::Terminated);
        outcome.final_state = state;

        info!(
            ingested = outcome.files_ingested(),
            skipped = outcome.files_skipped(),
            failed = outcome.files_failed(),
            rows = outcome.rows_appended(),
            "Shard finished"
        );
        outcome
    }

    /// All files of the shard in processing order, noting kinds with none
    fn discover(&self, shard: ShardKey, dir: &Path, missing: &mut Vec<DataKind>) -> Result<Vec<SourceFile>> {
        let mut files = Vec::new();
        for kind in self.config.ordered_kinds() {
            let found = self.catalog.discover(dir, shard, kind)?;
            if found.is_empty() {
                let e = IngestError::NoFilesMatched {
                    shard,
                    kind,
                    dir: dir.to_path_buf(),
                };
                warn!("{}", e);
                missing.push(kind);
            }
            files.extend(found);
        }
        Ok(files)
    }

    /// Ingest files one after another; returns early only on a fatal error
    async fn ingest_files<E>(&self, engine: &mut E, files: &[SourceFile], results: &mut Vec<FileResult>) -> Result<()>
    where
        E: Engine + ?Sized,
    {
        for file in files {
            let span = info_span!("file", file = %file.file_name);
            let result = self.ingest_file(engine, file).instrument(span).await;

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) if e.is_fatal_for_shard() => {
                    error!(file = %file.file_name, "File failed, engine unusable: {}", e);
                    results.push(FileResult {
                        file_name: file.file_name.clone(),
                        kind: file.kind,
                        outcome: FileOutcome::Failed {
                            reason: e.to_string(),
                        },
                    });
                    return Err(e);
                },
                Err(e) => {
                    error!(file = %file.file_name, "File failed: {}", e);
                    FileOutcome::Failed {
                        reason: e.to_string(),
                    }
                },
            };

            results.push(FileResult {
                file_name: file.file_name.clone(),
                kind: file.kind,
                outcome,
            });
        }
        Ok(())
    }

    /// Duplicate guard, extraction, ingest and cleanup of one file
    async fn ingest_file<E>(&self, engine: &mut E, file: &SourceFile) -> Result<FileOutcome>
    where
        E: Engine + ?Sized,
    {
        let root = self.config.partition_root(file.kind);
        let location = PartitionLocation::new(&root, file.date, file.kind.table_name());

        let digest = match self.config.duplicate_policy {
            DuplicatePolicy::Allow => None,
            DuplicatePolicy::SkipExistingPartition => {
                let partition = location.clone();
                if on_blocking_pool(move || Ok::<_, IngestError>(partition.exists())).await? {
                    info!(partition = %location.table_dir().display(), "Partition exists, skipping file");
                    return Ok(FileOutcome::Skipped {
                        reason: format!("partition {} already exists", location.table_dir().display()),
                    });
                }
                None
            },
            DuplicatePolicy::SkipIngestedFiles => {
                let path = file.path.clone();
                let digest = on_blocking_pool(move || sha256_file(&path)).await?;
                let ledger = location.clone();
                let (name, sha256) = (file.file_name.clone(), digest.clone());
                if on_blocking_pool(move || ledger.ledger_contains(&name, &sha256)).await? {
                    info!(sha256 = %digest, "File already ingested, skipping");
                    return Ok(FileOutcome::Skipped {
                        reason: format!("sha256 {digest} already ingested"),
                    });
                }
                Some(digest)
            },
        };

        let extractor = self.extractor.clone();
        let source = file.clone();
        let copy = on_blocking_pool(move || extractor.extract(&source)).await?;

        let request = IngestRequest {
            kind: file.kind,
            payload: copy.decompressed.clone(),
            date: file.date,
            root,
        };

        let report = match self.sink.ingest(engine, &request).await {
            Ok(report) => report,
            Err(e) => {
                for artifact in copy.artifacts() {
                    warn!(path = %artifact.display(), "Keeping artifact of failed file");
                }
                return Err(e);
            },
        };

        if let Some(digest) = digest {
            let name = file.file_name.clone();
            if let Err(e) = on_blocking_pool(move || location.record_ingested(&name, &digest)).await {
                warn!(error = %e, "Failed to record file in ingest ledger");
            }
        }

        let manager = self.cleanup.clone();
        let cleanup = on_blocking_pool(move || Ok::<_, IngestError>(manager.cleanup(&copy))).await?;
        Ok(FileOutcome::Ingested {
            report,
            cleanup_warnings: cleanup.warnings,
        })
    }
}

/// Run filesystem work off the async workers
async fn on_blocking_pool<T, E, F>(work: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    IngestError: From<E>,
{
    let done = tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| IngestError::TaskFailed(e.to_string()))?;
    Ok(done?)
}

fn transition(state: &mut ShardState, next: ShardState) {
    info!(from = %state, to = %next, "Shard state change");
    *state = next;
}
