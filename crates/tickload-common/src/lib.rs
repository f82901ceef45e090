//! tickload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the tickload workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`TickloadError`] and the crate [`Result`] alias
//! - **Types**: data kinds, month shards and partition dates
//! - **Checksums**: file digests used by the ingest ledger
//! - **Logging**: `tracing` subscriber configuration shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use tickload_common::{PartitionDate, Result};
//!
//! fn partition_of(file_name: &str) -> Result<String> {
//!     let date = PartitionDate::from_file_name(file_name)?;
//!     Ok(date.to_string())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, TickloadError};
pub use types::{DataKind, PartitionDate, ShardKey};
