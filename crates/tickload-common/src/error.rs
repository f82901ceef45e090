//! Error types for tickload

use thiserror::Error;

/// Result type alias for tickload operations
pub type Result<T> = std::result::Result<T, TickloadError>;

/// Main error type shared by the tickload crates
#[derive(Error, Debug)]
pub enum TickloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid shard key '{0}': expected YYYYMM")]
    InvalidShardKey(String),

    #[error("Invalid partition date '{0}': expected YYYYMMDD")]
    InvalidDate(String),

    #[error("Unknown data kind: {0}")]
    UnknownKind(String),
}
