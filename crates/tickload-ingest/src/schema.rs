//! Per-kind extract layouts
//!
//! Column names come from each extract's header row; the types are
//! positional and fixed per kind. The table below also fixes the sentinel
//! filter, the helper columns removed after the time reconstruction and the
//! canonical column order written to the partitions.

use std::sync::LazyLock;

use tickload_common::DataKind;

use crate::engine::{ColumnType, Comparison, RowPredicate, TimeFields};

/// Field delimiter of every extract
pub const DELIMITER: char = '|';

/// Identifier column copied into [`SYMBOL_COLUMN`]
pub const SYMBOL_SOURCE: &str = "ISIN";

/// Partitioning key of every table
pub const SYMBOL_COLUMN: &str = "sym";

pub const TIME_COLUMN: &str = "time";

pub const DATE_FIELD: &str = "Date";

/// `HHMMSS` wall-clock field
pub const HHMMSS_FIELD: &str = "TimeSec";

/// Sub-second field
pub const SUBSECOND_FIELD: &str = "TimeMM";

const MARKET_TIME_FIELD: &str = "MarketTime";

/// Depth of the order book extracts
pub const BOOK_LEVELS: usize = 5;

/// Layout of one kind of extract
#[derive(Debug, Clone, PartialEq)]
pub struct KindSchema {
    pub kind: DataKind,
    /// Expected source columns in file order
    pub columns: Vec<(String, ColumnType)>,
    /// Rows matching this are dropped before the append
    pub sentinel: RowPredicate,
    /// Source columns removed once `sym` and `time` exist
    pub helper_columns: Vec<String>,
    /// Columns kept after `sym` and `time`, in canonical order
    pub payload_columns: Vec<String>,
}

impl KindSchema {
    pub fn table(&self) -> &'static str {
        self.kind.table_name()
    }

    /// Positional load types
    pub fn types(&self) -> Vec<ColumnType> {
        self.columns.iter().map(|(_, t)| *t).collect()
    }

    /// Type string as written in a q load, e.g. `SDIIIIFI`
    pub fn type_string(&self) -> String {
        self.columns.iter().map(|(_, t)| t.type_char()).collect()
    }

    /// Column order of the partitioned table
    pub fn canonical_columns(&self) -> Vec<String> {
        [SYMBOL_COLUMN.to_string(), TIME_COLUMN.to_string()]
            .into_iter()
            .chain(self.payload_columns.iter().cloned())
            .collect()
    }

    pub fn time_fields(&self) -> TimeFields {
        TimeFields {
            subsecond: SUBSECOND_FIELD.to_string(),
            date: DATE_FIELD.to_string(),
            hhmmss: HHMMSS_FIELD.to_string(),
        }
    }
}

static SCHEMAS: LazyLock<[KindSchema; 3]> =
    LazyLock::new(|| [trade_schema(), order_schema(), book_schema()]);

/// Layout of `kind`
pub fn schema(kind: DataKind) -> &'static KindSchema {
    match kind {
        DataKind::Trade => &SCHEMAS[0],
        DataKind::Order => &SCHEMAS[1],
        DataKind::Book => &SCHEMAS[2],
    }
}

fn named(columns: &[(&str, ColumnType)]) -> Vec<(String, ColumnType)> {
    columns.iter().map(|(n, t)| (n.to_string(), *t)).collect()
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn time_prefix() -> Vec<(&'static str, ColumnType)> {
    vec![
        (SYMBOL_SOURCE, ColumnType::Symbol),
        (DATE_FIELD, ColumnType::Date),
        (HHMMSS_FIELD, ColumnType::Int),
        (SUBSECOND_FIELD, ColumnType::Int),
    ]
}

fn trade_schema() -> KindSchema {
    let mut columns = time_prefix();
    columns.extend([
        (MARKET_TIME_FIELD, ColumnType::Int),
        ("Qty", ColumnType::Int),
        ("Price", ColumnType::Float),
        ("Volume", ColumnType::Int),
    ]);
    KindSchema {
        kind: DataKind::Trade,
        columns: named(&columns),
        sentinel: RowPredicate {
            column: "Price".to_string(),
            comparison: Comparison::Eq,
            value: 0.0,
        },
        helper_columns: strings(&[SYMBOL_SOURCE, SUBSECOND_FIELD, DATE_FIELD, HHMMSS_FIELD, MARKET_TIME_FIELD]),
        payload_columns: strings(&["Price", "Qty", "Volume"]),
    }
}

fn order_schema() -> KindSchema {
    let mut columns = time_prefix();
    columns.extend([
        (MARKET_TIME_FIELD, ColumnType::Int),
        ("Side", ColumnType::Symbol),
        ("Price", ColumnType::Float),
        ("Qty", ColumnType::Int),
    ]);
    KindSchema {
        kind: DataKind::Order,
        columns: named(&columns),
        sentinel: RowPredicate {
            column: "Qty".to_string(),
            comparison: Comparison::Eq,
            value: 0.0,
        },
        helper_columns: strings(&[SYMBOL_SOURCE, SUBSECOND_FIELD, DATE_FIELD, HHMMSS_FIELD, MARKET_TIME_FIELD]),
        payload_columns: strings(&["Side", "Price", "Qty"]),
    }
}

/// Book level column names in file order
pub fn book_level_columns() -> Vec<String> {
    (0..BOOK_LEVELS)
        .flat_map(|level| {
            [
                format!("Bid_Px_Lev_{level}"),
                format!("Bid_Qty_Lev_{level}"),
                format!("Ask_Px_Lev_{level}"),
                format!("Ask_Qty_Lev_{level}"),
            ]
        })
        .collect()
}

fn book_schema() -> KindSchema {
    let levels = book_level_columns();
    let mut columns = named(&time_prefix());
    columns.extend(levels.iter().map(|name| (name.clone(), ColumnType::Float)));
    KindSchema {
        kind: DataKind::Book,
        columns,
        sentinel: RowPredicate {
            column: "Bid_Px_Lev_0".to_string(),
            comparison: Comparison::Le,
            value: 0.0,
        },
        helper_columns: strings(&[SYMBOL_SOURCE, SUBSECOND_FIELD, DATE_FIELD, HHMMSS_FIELD]),
        payload_columns: levels,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_type_strings() {
        assert_eq!(schema(DataKind::Trade).type_string(), "SDIIIIFI");
        assert_eq!(schema(DataKind::Order).type_string(), "SDIIISFI");
        assert_eq!(schema(DataKind::Book).type_string(), format!("SDII{}", "F".repeat(20)));
    }

    #[test]
    fn test_projection_leaves_exactly_canonical_columns() {
        for kind in DataKind::ALL {
            let s = schema(kind);
            let mut remaining: BTreeSet<String> = s.columns.iter().map(|(n, _)| n.clone()).collect();
            remaining.insert(SYMBOL_COLUMN.to_string());
            remaining.insert(TIME_COLUMN.to_string());
            for helper in &s.helper_columns {
                assert!(remaining.remove(helper), "{kind}: helper {helper} not in source");
            }
            let canonical: BTreeSet<String> = s.canonical_columns().into_iter().collect();
            assert_eq!(remaining, canonical, "{kind}");
        }
    }

    #[test]
    fn test_book_canonical_order() {
        let columns = schema(DataKind::Book).canonical_columns();
        assert_eq!(columns.len(), 22);
        assert_eq!(&columns[..4], &["sym", "time", "Bid_Px_Lev_0", "Bid_Qty_Lev_0"]);
        assert_eq!(columns[21], "Ask_Qty_Lev_4");
    }
}
