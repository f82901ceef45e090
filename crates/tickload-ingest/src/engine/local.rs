//! Embedded engine
//!
//! Implements the command set in-process against the on-disk partition
//! layout. Commands run on the blocking pool since loading and appending are
//! plain file I/O. A blocking task keeps running when its caller gives up on
//! it, so closing the engine refuses appends not yet started and waits for
//! the one in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::command::EngineCommand;
use super::relation::Relation;
use super::{Engine, EngineError, EngineReply};
use crate::partition;

/// Protocol version reported by the embedded engine
const LOCAL_PROTOCOL_VERSION: u8 = 3;

#[derive(Debug, Default)]
struct LocalSession {
    bindings: HashMap<String, Relation>,
}

impl LocalSession {
    fn relation_mut(&mut self, table: &str) -> Result<&mut Relation, EngineError> {
        self.bindings
            .get_mut(table)
            .ok_or_else(|| EngineError::Remote(format!("{table}: no such table")))
    }

    fn apply(&mut self, command: &EngineCommand, closed: &AtomicBool) -> Result<EngineReply, EngineError> {
        match command {
            EngineCommand::Load {
                table,
                path,
                types,
                delimiter,
            } => {
                let relation = Relation::load_delimited(path, types, *delimiter)?;
                let rows = relation.len();
                self.bindings.insert(table.clone(), relation);
                Ok(EngineReply::Long(rows as i64))
            },
            EngineCommand::ReconstructTime {
                table,
                symbol_source,
                symbol_column,
                time_column,
                fields,
            } => {
                self.relation_mut(table)?
                    .reconstruct_time(symbol_source, symbol_column, time_column, fields)?;
                Ok(EngineReply::Unit)
            },
            EngineCommand::DropRows { table, predicate } => {
                let relation = self.relation_mut(table)?;
                relation.delete_where(predicate)?;
                Ok(EngineReply::Long(relation.len() as i64))
            },
            EngineCommand::DropColumns { table, columns } => {
                self.relation_mut(table)?.drop_columns(columns)?;
                Ok(EngineReply::Unit)
            },
            EngineCommand::Reorder { table, columns } => {
                self.relation_mut(table)?.reorder(columns)?;
                Ok(EngineReply::Unit)
            },
            EngineCommand::AppendPartition(request) => {
                if closed.load(Ordering::SeqCst) {
                    return Err(EngineError::NotConnected);
                }
                let relation = self.relation_mut(&request.table)?;
                relation.sort_by_symbol(&request.partition_column)?;
                let location =
                    partition::PartitionLocation::new(&request.root, request.date, &request.table);
                let rows = partition::append_relation(&location, relation)?;
                debug!(
                    table = %request.table,
                    partition = %location.table_dir().display(),
                    rows,
                    "Partition appended"
                );
                Ok(EngineReply::Symbol(request.table.clone()))
            },
            EngineCommand::Reset { table } => {
                self.bindings.remove(table);
                Ok(EngineReply::Unit)
            },
            EngineCommand::Ping => Ok(EngineReply::Bool(true)),
            EngineCommand::Shutdown => {
                self.bindings.clear();
                Ok(EngineReply::Unit)
            },
        }
    }
}

/// Engine session evaluated in the current process
#[derive(Debug, Clone)]
pub struct LocalEngine {
    session: Arc<Mutex<LocalSession>>,
    /// Set by `close`, read under the session lock
    closed: Arc<AtomicBool>,
    connected: bool,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEngine {
    pub fn new() -> Self {
        Self {
            session: Arc::new(Mutex::new(LocalSession::default())),
            closed: Arc::new(AtomicBool::new(false)),
            connected: true,
        }
    }

    /// Names of the relations currently bound in the session, sorted
    pub fn bound_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.session.lock() {
            Ok(session) => session.bindings.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().bindings.keys().cloned().collect(),
        };
        names.sort();
        names
    }
}

#[async_trait]
impl Engine for LocalEngine {
    async fn execute(&mut self, command: &EngineCommand) -> Result<EngineReply, EngineError> {
        if !self.connected {
            return Err(EngineError::NotConnected);
        }
        command.validate()?;

        let session = Arc::clone(&self.session);
        let closed = Arc::clone(&self.closed);
        let owned = command.clone();
        let reply = tokio::task::spawn_blocking(move || {
            let mut session = session
                .lock()
                .map_err(|_| EngineError::TaskFailed("engine session poisoned".to_string()))?;
            session.apply(&owned, &closed)
        })
        .await
        .map_err(|e| EngineError::TaskFailed(e.to_string()))??;

        if matches!(command, EngineCommand::Shutdown) {
            self.connected = false;
        }
        Ok(reply)
    }

    fn protocol_version(&self) -> u8 {
        LOCAL_PROTOCOL_VERSION
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) {
        self.connected = false;
        self.closed.store(true, Ordering::SeqCst);

        // taking the lock waits out a command still running on the blocking pool
        let session = Arc::clone(&self.session);
        if let Err(e) = tokio::task::spawn_blocking(move || drop(session.lock())).await {
            debug!(error = %e, "Waiting for in-flight engine command failed");
        }
    }
}
