//! Transform-and-append sequence for one extract
//!
//! Every file goes through the same fixed command sequence:
//!
//! 1. load the decompressed payload with the kind's positional schema
//! 2. add `sym` and the reconstructed event `time`
//! 3. drop rows matching the kind's sentinel
//! 4. drop the helper columns
//! 5. reorder to the canonical column order
//! 6. append to the date partition, keyed by `sym`
//! 7. unbind the transient table
//!
//! [`plan`] builds the sequence without touching an engine, and
//! [`IngestSink::ingest`] runs it strictly in order.

use std::path::{Path, PathBuf};

use tickload_common::{DataKind, PartitionDate};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineCommand, EngineError, PartitionAppendRequest};
use crate::error::{IngestError, Result};
use crate::partition::PartitionLocation;
use crate::schema::{self, DELIMITER, SYMBOL_COLUMN, SYMBOL_SOURCE, TIME_COLUMN};

/// One decompressed payload to append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub kind: DataKind,
    /// Decompressed, delimited payload
    pub payload: PathBuf,
    pub date: PartitionDate,
    /// Partitioned database directory of the kind's table
    pub root: PathBuf,
}

impl IngestRequest {
    pub fn location(&self) -> PartitionLocation {
        PartitionLocation::new(&self.root, self.date, self.kind.table_name())
    }
}

/// Outcome of a successful ingest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub table: String,
    pub partition: PathBuf,
    /// Rows parsed from the payload, when the engine reported them
    pub rows_loaded: Option<u64>,
    /// Rows left after the sentinel filter, when the engine reported them
    pub rows_kept: Option<u64>,
}

/// Command sequence ingesting `payload` into the `date` partition under `root`
pub fn plan(kind: DataKind, payload: &Path, date: PartitionDate, root: &Path) -> Vec<EngineCommand> {
    let schema = schema::schema(kind);
    let table = schema.table().to_string();

    vec![
        EngineCommand::Load {
            table: table.clone(),
            path: payload.to_path_buf(),
            types: schema.types(),
            delimiter: DELIMITER,
        },
        EngineCommand::ReconstructTime {
            table: table.clone(),
            symbol_source: SYMBOL_SOURCE.to_string(),
            symbol_column: SYMBOL_COLUMN.to_string(),
            time_column: TIME_COLUMN.to_string(),
            fields: schema.time_fields(),
        },
        EngineCommand::DropRows {
            table: table.clone(),
            predicate: schema.sentinel.clone(),
        },
        EngineCommand::DropColumns {
            table: table.clone(),
            columns: schema.helper_columns.clone(),
        },
        EngineCommand::Reorder {
            table: table.clone(),
            columns: schema.canonical_columns(),
        },
        EngineCommand::AppendPartition(PartitionAppendRequest {
            root: root.to_path_buf(),
            date,
            partition_column: SYMBOL_COLUMN.to_string(),
            table: table.clone(),
        }),
        EngineCommand::Reset { table },
    ]
}

/// Drives the ingest sequence against an engine
#[derive(Debug, Clone, Default)]
pub struct IngestSink;

impl IngestSink {
    pub fn new() -> Self {
        Self
    }

    /// Run the full sequence for one payload
    ///
    /// The first failing step aborts the file. Unless the connection was lost,
    /// a reset is then attempted so the next file starts from a clean session.
    pub async fn ingest<E>(&self, engine: &mut E, request: &IngestRequest) -> Result<IngestReport>
    where
        E: Engine + ?Sized,
    {
        let table = request.kind.table_name();
        let location = request.location();
        let mut report = IngestReport {
            table: table.to_string(),
            partition: location.table_dir(),
            rows_loaded: None,
            rows_kept: None,
        };

        for command in plan(request.kind, &request.payload, request.date, &request.root) {
            debug!(table, command = command.name(), "Executing engine command");

            let reply = match engine.execute(&command).await {
                Ok(reply) => reply,
                Err(e) if matches!(command, EngineCommand::Reset { .. }) && !e.is_connection_lost() => {
                    // the rows are already appended; a stale binding is replaced by the next load
                    warn!(table, error = %e, "Failed to reset engine table after append");
                    continue;
                },
                Err(e) => {
                    let lost = e.is_connection_lost();
                    let error = classify(&command, e, request, &location);
                    if !lost {
                        self.reset_after_failure(engine, table).await;
                    }
                    return Err(error);
                },
            };

            match command {
                EngineCommand::Load { .. } => report.rows_loaded = reply.as_count(),
                EngineCommand::DropRows { .. } => report.rows_kept = reply.as_count(),
                _ => {},
            }
        }

        info!(
            table,
            partition = %report.partition.display(),
            rows_loaded = report.rows_loaded,
            rows_kept = report.rows_kept,
            "Payload appended"
        );
        Ok(report)
    }

    async fn reset_after_failure<E>(&self, engine: &mut E, table: &str)
    where
        E: Engine + ?Sized,
    {
        let reset = EngineCommand::Reset {
            table: table.to_string(),
        };
        if let Err(e) = engine.execute(&reset).await {
            warn!(table, error = %e, "Best-effort reset after failure did not succeed");
        }
    }
}

/// Map an engine error to the failure kind of the step that raised it
fn classify(
    command: &EngineCommand,
    error: EngineError,
    request: &IngestRequest,
    location: &PartitionLocation,
) -> IngestError {
    if error.is_connection_lost() {
        return IngestError::EngineCommunication(error);
    }
    match command {
        EngineCommand::Load { .. } => IngestError::LoadParse {
            path: request.payload.clone(),
            reason: error.to_string(),
        },
        EngineCommand::AppendPartition(_) => IngestError::PartitionWrite {
            partition: location.table_dir(),
            reason: error.to_string(),
        },
        _ => IngestError::EngineCommunication(error),
    }
}
