//! Common types used across tickload
//!
//! These are the identifiers every pipeline stage agrees on: the kind of
//! extract being loaded, the calendar-month shard it belongs to and the date
//! of the partition it is appended to.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TickloadError};

// ============================================================================
// Data kinds
// ============================================================================

/// Kind of market-data extract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    /// Executed trades (`*_MKtrade.csv.gz`)
    Trade,
    /// Order events (`*_Order.csv.gz`)
    Order,
    /// Order-book snapshots (`*_Book.csv.gz`)
    Book,
}

impl DataKind {
    /// All kinds, in the order a shard ingests them
    pub const ALL: [DataKind; 3] = [DataKind::Trade, DataKind::Order, DataKind::Book];

    /// Name of the partitioned table this kind is appended to
    pub fn table_name(self) -> &'static str {
        match self {
            DataKind::Trade => "trades",
            DataKind::Order => "orders",
            DataKind::Book => "books",
        }
    }

    /// File name suffix identifying the kind, compression suffix included
    pub fn file_suffix(self) -> &'static str {
        match self {
            DataKind::Trade => "_MKtrade.csv.gz",
            DataKind::Order => "_Order.csv.gz",
            DataKind::Book => "_Book.csv.gz",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Trade => write!(f, "trade"),
            DataKind::Order => write!(f, "order"),
            DataKind::Book => write!(f, "book"),
        }
    }
}

impl FromStr for DataKind {
    type Err = TickloadError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trade" | "trades" => Ok(DataKind::Trade),
            "order" | "orders" => Ok(DataKind::Order),
            "book" | "books" => Ok(DataKind::Book),
            _ => Err(TickloadError::UnknownKind(s.to_string())),
        }
    }
}

// ============================================================================
// Shards
// ============================================================================

/// A calendar month, the unit of parallel work
///
/// Rendered as `YYYYMM`, which is also the file name prefix every extract of
/// that month starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardKey {
    year: i32,
    month: u32,
}

impl ShardKey {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) || !(1000..=9999).contains(&year) {
            return Err(TickloadError::InvalidShardKey(format!("{year:04}{month:02}")));
        }
        Ok(Self { year, month })
    }

    /// Const constructor for keys written out in source
    ///
    /// An out-of-range value used in a `const` item fails to compile.
    pub const fn from_parts(year: i32, month: u32) -> Self {
        assert!(
            month >= 1 && month <= 12 && year >= 1000 && year <= 9999,
            "shard key out of range"
        );
        Self { year, month }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Months elapsed since year 0, used to order and spread shards
    pub fn ordinal(&self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month) - 1
    }

    /// The following calendar month
    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }

    /// Every month from `from` to `to`, both inclusive
    ///
    /// Returns an empty list when `to` precedes `from`.
    pub fn range(from: ShardKey, to: ShardKey) -> Vec<ShardKey> {
        let mut shards = Vec::new();
        let mut current = from;
        while current <= to {
            shards.push(current);
            current = current.next();
        }
        shards
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

impl FromStr for ShardKey {
    type Err = TickloadError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TickloadError::InvalidShardKey(s.to_string()));
        }
        let year = s[..4]
            .parse()
            .map_err(|_| TickloadError::InvalidShardKey(s.to_string()))?;
        let month = s[4..]
            .parse()
            .map_err(|_| TickloadError::InvalidShardKey(s.to_string()))?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for ShardKey {
    type Error = TickloadError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ShardKey> for String {
    fn from(value: ShardKey) -> Self {
        value.to_string()
    }
}

// ============================================================================
// Partition dates
// ============================================================================

/// Date of the partition an extract is appended to
///
/// Parsed from the `YYYYMMDD` file name prefix and rendered the way the
/// partition directories are named (`YYYY.MM.DD`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionDate(NaiveDate);

impl PartitionDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Parse the leading `YYYYMMDD` of a file name such as `20170501_EUX_Book.csv.gz`
    pub fn from_file_name(file_name: &str) -> Result<Self> {
        let prefix = file_name.split('_').next().unwrap_or(file_name);
        NaiveDate::parse_from_str(prefix, "%Y%m%d")
            .map(Self)
            .map_err(|_| TickloadError::InvalidDate(prefix.to_string()))
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }

    /// Shard the date falls into
    pub fn shard(&self) -> ShardKey {
        ShardKey {
            year: self.0.year(),
            month: self.0.month(),
        }
    }
}

impl fmt::Display for PartitionDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y.%m.%d"))
    }
}
