//! Engine abstraction
//!
//! An engine holds the transient relation for the file being ingested and
//! owns the partitioned database on disk. The pipeline only talks to it
//! through [`EngineCommand`] values, so the same ingest sequence runs against
//! a spawned `q` process ([`QIpcEngine`]) or the embedded [`LocalEngine`].

pub mod command;
pub mod ipc;
pub mod local;
pub mod process;
pub mod relation;

use async_trait::async_trait;
use thiserror::Error;

pub use command::{
    ColumnType, Comparison, EngineCommand, PartitionAppendRequest, RowPredicate, TimeFields,
};
pub use ipc::QIpcEngine;
pub use local::LocalEngine;
pub use process::{
    derive_port, EngineLauncher, EngineWorker, LocalLauncher, QProcessLauncher, RetryPolicy,
};

/// Errors raised while talking to an engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine evaluated the command and signalled an error
    #[error("engine error: {0}")]
    Remote(String),

    /// The transport failed; the session must be considered dead
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("engine is not connected")]
    NotConnected,

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("engine task failed: {0}")]
    TaskFailed(String),
}

impl EngineError {
    /// Whether the session is unusable after this error
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, EngineError::ConnectionLost(_) | EngineError::NotConnected)
    }
}

/// Value returned by an engine for a command
#[derive(Debug, Clone, PartialEq)]
pub enum EngineReply {
    /// Generic null, returned by statements evaluated for their side effect
    Unit,
    Bool(bool),
    Long(i64),
    Float(f64),
    Symbol(String),
    Text(String),
    /// A value of a type the pipeline never inspects, tagged with its type code
    Other(i8),
}

impl EngineReply {
    /// Row count carried by the reply, if it is an integral atom
    pub fn as_count(&self) -> Option<u64> {
        match self {
            EngineReply::Long(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }
}

/// A session able to execute engine commands
#[async_trait]
pub trait Engine: Send {
    /// Execute one command and wait for its reply
    ///
    /// Commands that expect no reply resolve to [`EngineReply::Unit`] once sent.
    async fn execute(&mut self, command: &EngineCommand) -> Result<EngineReply, EngineError>;

    /// Protocol version agreed during the handshake
    fn protocol_version(&self) -> u8;

    fn is_connected(&self) -> bool;

    /// Close the session; further commands fail with [`EngineError::NotConnected`]
    ///
    /// Once this returns, no command issued earlier may still write to a partition.
    async fn close(&mut self);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_count() {
        assert_eq!(EngineReply::Long(42).as_count(), Some(42));
        assert_eq!(EngineReply::Long(-1).as_count(), None);
        assert_eq!(EngineReply::Unit.as_count(), None);
    }

    #[test]
    fn test_connection_lost_classification() {
        assert!(EngineError::NotConnected.is_connection_lost());
        assert!(EngineError::ConnectionLost("reset".into()).is_connection_lost());
        assert!(!EngineError::Remote("type".into()).is_connection_lost());
    }
}
