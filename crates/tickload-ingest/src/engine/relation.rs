//! In-memory column store used by the embedded engine
//!
//! A [`Relation`] is an ordered list of named, typed columns of equal length.
//! Nulls follow the engine's conventions: `i64::MIN` for integers, NaN for
//! floats and `None` for dates and timestamps. Nulls compare below every
//! other value.

use std::cmp::Ordering;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

use super::command::{ColumnType, Comparison, RowPredicate, TimeFields};
use super::EngineError;

/// Integer null
pub const INT_NULL: i64 = i64::MIN;

const DATE_FORMATS: [&str; 3] = ["%Y.%m.%d", "%Y-%m-%d", "%Y%m%d"];

/// Column storage
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Symbol(Vec<String>),
    Date(Vec<Option<NaiveDate>>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Timestamp(Vec<Option<NaiveDateTime>>),
}

impl ColumnData {
    fn with_capacity(column_type: ColumnType, capacity: usize) -> Self {
        match column_type {
            ColumnType::Symbol => ColumnData::Symbol(Vec::with_capacity(capacity)),
            ColumnType::Date => ColumnData::Date(Vec::with_capacity(capacity)),
            ColumnType::Int => ColumnData::Int(Vec::with_capacity(capacity)),
            ColumnType::Float => ColumnData::Float(Vec::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Symbol(v) => v.len(),
            ColumnData::Date(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Timestamp(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn type_name(&self) -> &'static str {
        match self {
            ColumnData::Symbol(_) => "symbol",
            ColumnData::Date(_) => "date",
            ColumnData::Int(_) => "int",
            ColumnData::Float(_) => "float",
            ColumnData::Timestamp(_) => "timestamp",
        }
    }

    fn push_field(&mut self, raw: &str) -> Result<(), String> {
        let raw = raw.trim();
        match self {
            ColumnData::Symbol(v) => v.push(raw.to_string()),
            ColumnData::Date(v) => {
                if raw.is_empty() {
                    v.push(None);
                } else {
                    let date = DATE_FORMATS
                        .iter()
                        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                        .ok_or_else(|| format!("'{raw}' is not a date"))?;
                    v.push(Some(date));
                }
            },
            ColumnData::Int(v) => {
                if raw.is_empty() {
                    v.push(INT_NULL);
                } else {
                    v.push(raw.parse().map_err(|_| format!("'{raw}' is not an integer"))?);
                }
            },
            ColumnData::Float(v) => {
                if raw.is_empty() {
                    v.push(f64::NAN);
                } else {
                    v.push(raw.parse().map_err(|_| format!("'{raw}' is not a number"))?);
                }
            },
            ColumnData::Timestamp(_) => return Err("timestamps cannot be loaded".to_string()),
        }
        Ok(())
    }

    /// Keep only the rows whose mask entry is true
    fn retain(&mut self, mask: &[bool]) {
        fn keep<T>(values: &mut Vec<T>, mask: &[bool]) {
            let mut flags = mask.iter();
            values.retain(|_| flags.next().copied().unwrap_or(false));
        }
        match self {
            ColumnData::Symbol(v) => keep(v, mask),
            ColumnData::Date(v) => keep(v, mask),
            ColumnData::Int(v) => keep(v, mask),
            ColumnData::Float(v) => keep(v, mask),
            ColumnData::Timestamp(v) => keep(v, mask),
        }
    }

    /// Reorder rows so that row `i` becomes the old row `order[i]`
    fn permute(&mut self, order: &[usize]) {
        fn apply<T: Clone>(values: &mut Vec<T>, order: &[usize]) {
            *values = order.iter().map(|&i| values[i].clone()).collect();
        }
        match self {
            ColumnData::Symbol(v) => apply(v, order),
            ColumnData::Date(v) => apply(v, order),
            ColumnData::Int(v) => apply(v, order),
            ColumnData::Float(v) => apply(v, order),
            ColumnData::Timestamp(v) => apply(v, order),
        }
    }

    /// Text form of one value as written to a partition column file
    ///
    /// Nulls render as an empty line.
    pub fn render(&self, row: usize) -> String {
        match self {
            ColumnData::Symbol(v) => v[row].clone(),
            ColumnData::Date(v) => v[row].map(|d| d.format("%Y.%m.%d").to_string()).unwrap_or_default(),
            ColumnData::Int(v) if v[row] == INT_NULL => String::new(),
            ColumnData::Int(v) => v[row].to_string(),
            ColumnData::Float(v) if v[row].is_nan() => String::new(),
            ColumnData::Float(v) => v[row].to_string(),
            ColumnData::Timestamp(v) => v[row]
                .map(|t| t.format("%Y.%m.%dD%H:%M:%S%.9f").to_string())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

/// A named table held by the embedded engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Relation {
    columns: Vec<Column>,
}

impl Relation {
    pub fn new(columns: Vec<Column>) -> Result<Self, EngineError> {
        if let Some(first) = columns.first() {
            let len = first.data.len();
            if let Some(bad) = columns.iter().find(|c| c.data.len() != len) {
                return Err(EngineError::Remote(format!("length: column {} differs", bad.name)));
            }
        }
        Ok(Self { columns })
    }

    /// Parse a delimited text file whose first line names the columns
    ///
    /// Every line, the header included, must have exactly one field per entry
    /// of `types`. Quotes are literal characters, so a field never spans lines.
    pub fn load_delimited(
        path: &Path,
        types: &[ColumnType],
        delimiter: char,
    ) -> Result<Self, EngineError> {
        let delimiter = u8::try_from(delimiter)
            .map_err(|_| EngineError::InvalidCommand(format!("delimiter {delimiter:?} is not ASCII")))?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .quoting(false)
            .flexible(true)
            .from_path(path)
            .map_err(|e| load_error(path, e))?;

        let headers = reader.headers().map_err(|e| load_error(path, e))?.clone();
        if headers.len() != types.len() {
            return Err(EngineError::Remote(format!(
                "{}: header has {} fields, schema expects {}",
                path.display(),
                headers.len(),
                types.len()
            )));
        }

        let mut data: Vec<ColumnData> = types.iter().map(|t| ColumnData::with_capacity(*t, 1024)).collect();

        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|e| load_error(path, e))?;
            let line = index + 2;
            if record.len() != types.len() {
                return Err(EngineError::Remote(format!(
                    "{}:{line}: expected {} fields, found {}",
                    path.display(),
                    types.len(),
                    record.len()
                )));
            }
            for (column, field) in data.iter_mut().zip(record.iter()) {
                column
                    .push_field(field)
                    .map_err(|reason| EngineError::Remote(format!("{}:{line}: {reason}", path.display())))?;
            }
        }

        let columns = headers
            .iter()
            .zip(data)
            .map(|(name, data)| Column {
                name: name.trim().to_string(),
                data,
            })
            .collect();

        Self::new(columns)
    }

    pub fn len(&self) -> usize {
        self.columns.first().map(|c| c.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn require(&self, name: &str) -> Result<&Column, EngineError> {
        self.column(name)
            .ok_or_else(|| EngineError::Remote(format!("{name}: no such column")))
    }

    /// Add or replace a column, keeping the position of a replaced one
    fn upsert(&mut self, column: Column) {
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
    }

    /// Copy the identifier column into the symbol column and add the event time
    pub fn reconstruct_time(
        &mut self,
        symbol_source: &str,
        symbol_column: &str,
        time_column: &str,
        fields: &TimeFields,
    ) -> Result<(), EngineError> {
        let symbols = self.require(symbol_source)?.data.clone();

        let dates = match &self.require(&fields.date)?.data {
            ColumnData::Date(v) => v.clone(),
            other => return Err(type_error(&fields.date, "date", other)),
        };
        let subseconds = self.int_column(&fields.subsecond)?;
        let hhmmss = self.int_column(&fields.hhmmss)?;

        let times = dates
            .iter()
            .zip(subseconds.iter().zip(hhmmss.iter()))
            .map(|(date, (&ms, &raw))| match date {
                Some(date) if ms != INT_NULL && raw != INT_NULL => reconstruct_event_time(*date, ms, raw),
                _ => None,
            })
            .collect();

        self.upsert(Column {
            name: symbol_column.to_string(),
            data: symbols,
        });
        self.upsert(Column {
            name: time_column.to_string(),
            data: ColumnData::Timestamp(times),
        });
        Ok(())
    }

    fn int_column(&self, name: &str) -> Result<Vec<i64>, EngineError> {
        match &self.require(name)?.data {
            ColumnData::Int(v) => Ok(v.clone()),
            other => Err(type_error(name, "int", other)),
        }
    }

    /// Delete rows matching the predicate, returning how many were removed
    pub fn delete_where(&mut self, predicate: &RowPredicate) -> Result<usize, EngineError> {
        let column = self.require(&predicate.column)?;
        let matches: Vec<bool> = match &column.data {
            ColumnData::Int(v) => v
                .iter()
                .map(|&x| {
                    let x = if x == INT_NULL { f64::NEG_INFINITY } else { x as f64 };
                    compare(x, predicate)
                })
                .collect(),
            ColumnData::Float(v) => v
                .iter()
                .map(|&x| compare(if x.is_nan() { f64::NEG_INFINITY } else { x }, predicate))
                .collect(),
            other => return Err(type_error(&predicate.column, "numeric", other)),
        };

        let removed = matches.iter().filter(|m| **m).count();
        if removed > 0 {
            let keep: Vec<bool> = matches.iter().map(|m| !m).collect();
            for column in &mut self.columns {
                column.data.retain(&keep);
            }
        }
        Ok(removed)
    }

    pub fn drop_columns(&mut self, names: &[String]) -> Result<(), EngineError> {
        for name in names {
            self.require(name)?;
        }
        self.columns.retain(|c| !names.contains(&c.name));
        Ok(())
    }

    /// Move the named columns to the front in the given order
    pub fn reorder(&mut self, names: &[String]) -> Result<(), EngineError> {
        for name in names {
            self.require(name)?;
        }
        let mut front = Vec::with_capacity(self.columns.len());
        for name in names {
            if let Some(pos) = self.columns.iter().position(|c| &c.name == name) {
                front.push(self.columns.remove(pos));
            }
        }
        front.append(&mut self.columns);
        self.columns = front;
        Ok(())
    }

    /// Stable sort of every column by a symbol column
    pub fn sort_by_symbol(&mut self, key: &str) -> Result<(), EngineError> {
        let order: Vec<usize> = match &self.require(key)?.data {
            ColumnData::Symbol(symbols) => {
                let mut order: Vec<usize> = (0..symbols.len()).collect();
                order.sort_by(|&a, &b| symbols[a].cmp(&symbols[b]));
                order
            },
            other => return Err(type_error(key, "symbol", other)),
        };
        for column in &mut self.columns {
            column.data.permute(&order);
        }
        Ok(())
    }
}

/// Event time of a record
///
/// `subsecond` is scaled by 1000 and added as nanoseconds; `hhmmss` is a wall
/// clock time such as `93015` for 09:30:15, decomposed with floor division.
/// Returns `None` if the result leaves the representable range.
pub fn reconstruct_event_time(date: NaiveDate, subsecond: i64, hhmmss: i64) -> Option<NaiveDateTime> {
    let seconds = 3600 * hhmmss.div_euclid(10_000)
        + 60 * hhmmss.rem_euclid(10_000).div_euclid(100)
        + hhmmss.rem_euclid(100);
    let nanos = subsecond.checked_mul(1000)?;

    date.and_hms_opt(0, 0, 0)?
        .checked_add_signed(TimeDelta::try_seconds(seconds)?)?
        .checked_add_signed(TimeDelta::nanoseconds(nanos))
}

fn compare(value: f64, predicate: &RowPredicate) -> bool {
    let ordering = value.partial_cmp(&predicate.value).unwrap_or(Ordering::Less);
    match predicate.comparison {
        Comparison::Eq => ordering == Ordering::Equal,
        Comparison::Le => ordering != Ordering::Greater,
    }
}

fn type_error(column: &str, expected: &str, found: &ColumnData) -> EngineError {
    EngineError::Remote(format!(
        "type: column {column} is {}, expected {expected}",
        found.type_name()
    ))
}

fn load_error(path: &Path, error: csv::Error) -> EngineError {
    if let csv::ErrorKind::Io(_) = error.kind() {
        EngineError::Storage(std::io::Error::other(format!("{}: {error}", path.display())))
    } else {
        EngineError::Remote(format!("{}: {error}", path.display()))
    }
}
