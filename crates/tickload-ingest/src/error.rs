//! Error types for the ingest pipeline

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tickload_common::{DataKind, ShardKey, TickloadError};

use crate::engine::EngineError;

/// Result type alias for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors raised by the ingest pipeline
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Source directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("No {kind} files for shard {shard} in {}", .dir.display())]
    NoFilesMatched {
        shard: ShardKey,
        kind: DataKind,
        dir: PathBuf,
    },

    /// Staging or decompression failed; `staged` is the copy left behind, if any
    #[error("Extraction of {} failed: {reason}", .file.display())]
    ExtractionFailed {
        file: PathBuf,
        staged: Option<PathBuf>,
        reason: String,
    },

    #[error("Engine could not load {}: {reason}", .path.display())]
    LoadParse { path: PathBuf, reason: String },

    #[error("Engine communication failed: {0}")]
    EngineCommunication(#[from] EngineError),

    #[error("Append to partition {} failed: {reason}", .partition.display())]
    PartitionWrite { partition: PathBuf, reason: String },

    #[error("Failed to spawn engine '{program}': {source}")]
    EngineSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine on port {port} not ready after {attempts} attempts: {reason}")]
    EngineStartupTimeout { port: u16, attempts: u32, reason: String },

    #[error("Shard {shard} exceeded its {timeout:?} time limit")]
    ShardTimeout { shard: ShardKey, timeout: Duration },

    #[error("Invalid file pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] TickloadError),
}

impl IngestError {
    /// Whether the shard cannot continue with its current engine
    pub fn is_fatal_for_shard(&self) -> bool {
        match self {
            IngestError::EngineCommunication(e) => e.is_connection_lost(),
            IngestError::EngineSpawn { .. }
            | IngestError::EngineStartupTimeout { .. }
            | IngestError::ShardTimeout { .. } => true,
            _ => false,
        }
    }
}
