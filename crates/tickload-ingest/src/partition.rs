//! On-disk partition layout
//!
//! A table partition lives at `<root>/<YYYY.MM.DD>/<table>/`. The `.d` file
//! lists the column order, one name per line, and every column is stored in
//! a file of the same name holding one rendered value per line. Appends add
//! lines to every column file or to none of them; a partition whose `.d`
//! disagrees with the incoming columns is never written to.
//!
//! The `.ingested` ledger next to the columns records which source files were
//! appended, for the optional duplicate guard.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tickload_common::PartitionDate;
use tracing::warn;

use crate::engine::relation::Relation;
use crate::engine::EngineError;

/// Name of the column order file
pub const COLUMN_ORDER_FILE: &str = ".d";

/// Name of the ingest ledger file
pub const LEDGER_FILE: &str = ".ingested";

/// Address of one table partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLocation {
    pub root: PathBuf,
    pub date: PartitionDate,
    pub table: String,
}

impl PartitionLocation {
    pub fn new(root: impl Into<PathBuf>, date: PartitionDate, table: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            date,
            table: table.into(),
        }
    }

    pub fn date_dir(&self) -> PathBuf {
        self.root.join(self.date.to_string())
    }

    pub fn table_dir(&self) -> PathBuf {
        self.date_dir().join(&self.table)
    }

    pub fn exists(&self) -> bool {
        self.table_dir().join(COLUMN_ORDER_FILE).is_file()
    }

    /// Established column order, or `None` for a partition not yet written
    pub fn column_order(&self) -> std::io::Result<Option<Vec<String>>> {
        let path = self.table_dir().join(COLUMN_ORDER_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        read_lines(&path).map(Some)
    }

    /// Rendered values of one column
    pub fn read_column(&self, column: &str) -> std::io::Result<Vec<String>> {
        read_lines(&self.table_dir().join(column))
    }

    /// Number of rows stored, zero for a partition not yet written
    pub fn row_count(&self) -> std::io::Result<usize> {
        match self.column_order()? {
            Some(columns) => match columns.first() {
                Some(first) => Ok(self.read_column(first)?.len()),
                None => Ok(0),
            },
            None => Ok(0),
        }
    }

    fn ledger_path(&self) -> PathBuf {
        self.table_dir().join(LEDGER_FILE)
    }

    /// Whether the ledger holds an entry for this source file digest
    pub fn ledger_contains(&self, file_name: &str, sha256: &str) -> std::io::Result<bool> {
        let path = self.ledger_path();
        if !path.is_file() {
            return Ok(false);
        }
        // a renamed copy of the same bytes is still a duplicate
        Ok(read_lines(&path)?.iter().any(|line| match line.split_once('\t') {
            Some((_, digest)) => digest.eq_ignore_ascii_case(sha256),
            None => line == file_name,
        }))
    }

    /// Record a source file as appended to this partition
    pub fn record_ingested(&self, file_name: &str, sha256: &str) -> std::io::Result<()> {
        fs::create_dir_all(self.table_dir())?;
        let mut ledger = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.ledger_path())?;
        writeln!(ledger, "{file_name}\t{sha256}")?;
        ledger.sync_all()
    }
}

/// Append every row of `relation` to the partition, returning the rows written
///
/// The first append establishes the column order; later appends must carry
/// exactly the same columns in the same order. Either every column file
/// gains the new rows or none does, and `.d` is written only once all
/// columns of a new partition are in place.
pub fn append_relation(location: &PartitionLocation, relation: &Relation) -> Result<usize, EngineError> {
    let columns = relation.column_names();
    if columns.is_empty() {
        return Err(EngineError::Remote(format!("{}: no columns to append", location.table)));
    }

    let dir = location.table_dir();
    let order = location.column_order()?;
    if let Some(existing) = &order {
        if *existing != columns {
            return Err(EngineError::Remote(format!(
                "mismatch: partition {} has columns [{}], relation has [{}]",
                dir.display(),
                existing.join(","),
                columns.join(",")
            )));
        }
    }

    let bodies = render_columns(relation)?;

    fs::create_dir_all(&dir)?;
    let mut touched = Vec::with_capacity(bodies.len());
    let appended = relation
        .columns()
        .iter()
        .zip(&bodies)
        .try_for_each(|(column, body)| append_column(&dir.join(&column.name), body, &mut touched));

    let finished = appended.and_then(|()| match order {
        Some(_) => Ok(()),
        None => write_column_order(&dir, &columns),
    });

    if let Err(error) = finished {
        roll_back(&touched);
        return Err(error.into());
    }

    Ok(relation.len())
}

/// Column file contents to append, one line per row
///
/// A value holding a line break would shift every later row of its column.
fn render_columns(relation: &Relation) -> Result<Vec<String>, EngineError> {
    relation
        .columns()
        .iter()
        .map(|column| {
            let mut body = String::new();
            for row in 0..column.data.len() {
                let value = column.data.render(row);
                if value.contains(['\n', '\r']) {
                    return Err(EngineError::Remote(format!(
                        "{}: row {row} holds a line break",
                        column.name
                    )));
                }
                body.push_str(&value);
                body.push('\n');
            }
            Ok(body)
        })
        .collect()
}

/// Column file and its length before the append, `None` if it was created
type Touched = (PathBuf, Option<u64>);

fn append_column(path: &Path, body: &str, touched: &mut Vec<Touched>) -> std::io::Result<()> {
    let before = match fs::metadata(path) {
        Ok(meta) => Some(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    touched.push((path.to_path_buf(), before));
    file.write_all(body.as_bytes())?;
    file.flush()
}

fn write_column_order(dir: &Path, columns: &[String]) -> std::io::Result<()> {
    let mut order = NamedTempFile::new_in(dir)?;
    for name in columns {
        writeln!(order, "{name}")?;
    }
    order.flush()?;
    order.persist(dir.join(COLUMN_ORDER_FILE)).map_err(|e| e.error)?;
    Ok(())
}

fn roll_back(touched: &[Touched]) {
    for (path, before) in touched {
        let restored = match before {
            Some(len) => OpenOptions::new().write(true).open(path).and_then(|f| f.set_len(*len)),
            None => fs::remove_file(path),
        };
        if let Err(e) = restored {
            warn!(path = %path.display(), error = %e, "Could not roll back partial column append");
        }
    }
}

fn read_lines(path: &Path) -> std::io::Result<Vec<String>> {
    BufReader::new(File::open(path)?).lines().collect()
}
