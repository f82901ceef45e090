//! Typed engine commands
//!
//! Every statement the pipeline sends to an engine is built from an
//! [`EngineCommand`]. Table and column names are validated as identifiers and
//! paths are checked for characters that would terminate a `:path` symbol, so
//! a file name can never smuggle extra statements into the session.
//!
//! [`EngineCommand::render`] produces the q text sent over IPC; the embedded
//! engine interprets the command values directly.

use std::fmt;
use std::path::{Path, PathBuf};

use tickload_common::PartitionDate;

use super::EngineError;

/// Column types understood by the load step, named by their q type character
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Interned string (`S`)
    Symbol,
    /// Calendar date (`D`)
    Date,
    /// Integer (`I`)
    Int,
    /// Floating point (`F`)
    Float,
}

impl ColumnType {
    pub fn type_char(self) -> char {
        match self {
            ColumnType::Symbol => 'S',
            ColumnType::Date => 'D',
            ColumnType::Int => 'I',
            ColumnType::Float => 'F',
        }
    }
}

/// Comparison used by a row predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Le,
}

impl Comparison {
    fn operator(self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Le => "<=",
        }
    }
}

/// Rows matching this predicate are deleted
#[derive(Debug, Clone, PartialEq)]
pub struct RowPredicate {
    pub column: String,
    pub comparison: Comparison,
    pub value: f64,
}

impl fmt::Display for RowPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.column, self.comparison.operator(), render_number(self.value))
    }
}

/// Source columns feeding the event-time reconstruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeFields {
    /// Sub-second component, scaled by 1000 into nanoseconds
    pub subsecond: String,
    /// Trading date
    pub date: String,
    /// Wall-clock time encoded as an `HHMMSS` integer
    pub hhmmss: String,
}

/// Target of a partitioned append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAppendRequest {
    /// Database root holding one directory per date
    pub root: PathBuf,
    pub date: PartitionDate,
    /// Column the appended rows are sorted and attributed by
    pub partition_column: String,
    /// Name of the bound relation, which is also the on-disk table name
    pub table: String,
}

/// One engine operation
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Parse a delimited file with a header row into a relation bound to `table`
    Load {
        table: String,
        path: PathBuf,
        types: Vec<ColumnType>,
        delimiter: char,
    },
    /// Add the canonical symbol and event-time columns
    ReconstructTime {
        table: String,
        symbol_source: String,
        symbol_column: String,
        time_column: String,
        fields: TimeFields,
    },
    /// Delete the rows matching a predicate
    DropRows { table: String, predicate: RowPredicate },
    /// Remove columns from the relation
    DropColumns { table: String, columns: Vec<String> },
    /// Move the listed columns to the front, in order
    Reorder { table: String, columns: Vec<String> },
    /// Append the relation to a date partition
    AppendPartition(PartitionAppendRequest),
    /// Remove the relation binding from the session
    Reset { table: String },
    /// Liveness check
    Ping,
    /// Ask the engine process to exit; no reply is expected
    Shutdown,
}

impl EngineCommand {
    /// Short operation name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            EngineCommand::Load { .. } => "load",
            EngineCommand::ReconstructTime { .. } => "reconstruct_time",
            EngineCommand::DropRows { .. } => "drop_rows",
            EngineCommand::DropColumns { .. } => "drop_columns",
            EngineCommand::Reorder { .. } => "reorder",
            EngineCommand::AppendPartition(_) => "append_partition",
            EngineCommand::Reset { .. } => "reset",
            EngineCommand::Ping => "ping",
            EngineCommand::Shutdown => "shutdown",
        }
    }

    /// Whether the engine answers this command
    pub fn expects_reply(&self) -> bool {
        !matches!(self, EngineCommand::Shutdown)
    }

    /// Check every identifier and path the command carries
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            EngineCommand::Load {
                table,
                path,
                types,
                delimiter,
            } => {
                check_identifier(table)?;
                check_path(path)?;
                if types.is_empty() {
                    return Err(EngineError::InvalidCommand("load schema is empty".to_string()));
                }
                if !delimiter.is_ascii_graphic() || matches!(delimiter, '"' | '\\') {
                    return Err(EngineError::InvalidCommand(format!(
                        "unsupported delimiter {delimiter:?}"
                    )));
                }
                Ok(())
            },
            EngineCommand::ReconstructTime {
                table,
                symbol_source,
                symbol_column,
                time_column,
                fields,
            } => {
                for name in [
                    table,
                    symbol_source,
                    symbol_column,
                    time_column,
                    &fields.subsecond,
                    &fields.date,
                    &fields.hhmmss,
                ] {
                    check_identifier(name)?;
                }
                Ok(())
            },
            EngineCommand::DropRows { table, predicate } => {
                check_identifier(table)?;
                check_identifier(&predicate.column)?;
                if !predicate.value.is_finite() {
                    return Err(EngineError::InvalidCommand(
                        "predicate value must be finite".to_string(),
                    ));
                }
                Ok(())
            },
            EngineCommand::DropColumns { table, columns } | EngineCommand::Reorder { table, columns } => {
                check_identifier(table)?;
                if columns.is_empty() {
                    return Err(EngineError::InvalidCommand(format!(
                        "{} needs at least one column",
                        self.name()
                    )));
                }
                columns.iter().try_for_each(|c| check_identifier(c))
            },
            EngineCommand::AppendPartition(request) => {
                check_path(&request.root)?;
                check_identifier(&request.partition_column)?;
                check_identifier(&request.table)
            },
            EngineCommand::Reset { table } => check_identifier(table),
            EngineCommand::Ping | EngineCommand::Shutdown => Ok(()),
        }
    }

    /// Render the command as a q statement
    pub fn render(&self) -> Result<String, EngineError> {
        self.validate()?;

        let text = match self {
            EngineCommand::Load {
                table,
                path,
                types,
                delimiter,
            } => {
                let types: String = types.iter().map(|t| t.type_char()).collect();
                format!(
                    "{table}:(\"{types}\";enlist \"{delimiter}\") 0: `:{};count {table}",
                    q_path(path)
                )
            },
            EngineCommand::ReconstructTime {
                table,
                symbol_source,
                symbol_column,
                time_column,
                fields,
            } => {
                let TimeFields {
                    subsecond,
                    date,
                    hhmmss,
                } = fields;
                format!(
                    "update {symbol_column}:{symbol_source}, \
                     {time_column}:(1000*{subsecond})+{date}+`second$\
                     (3600*{hhmmss} div 10000)+(60*({hhmmss} mod 10000) div 100)+({hhmmss} mod 100) \
                     from `{table}"
                )
            },
            EngineCommand::DropRows { table, predicate } => {
                format!("delete from `{table} where {predicate};count {table}")
            },
            EngineCommand::DropColumns { table, columns } => {
                format!("delete {} from `{table}", columns.join(","))
            },
            EngineCommand::Reorder { table, columns } => {
                let symbols: String = columns.iter().map(|c| format!("`{c}")).collect();
                format!("{table}:{symbols} xcols {table}")
            },
            EngineCommand::AppendPartition(request) => format!(
                ".Q.dpft[`:{};{};`{};`{}]",
                q_path(&request.root),
                request.date,
                request.partition_column,
                request.table
            ),
            EngineCommand::Reset { table } => format!("delete {table} from `."),
            EngineCommand::Ping => "1b".to_string(),
            EngineCommand::Shutdown => "exit 0".to_string(),
        };

        Ok(text)
    }
}

/// Identifiers: a letter followed by letters, digits or underscores
fn check_identifier(name: &str) -> Result<(), EngineError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidCommand(format!("invalid identifier '{name}'")))
    }
}

fn check_path(path: &Path) -> Result<(), EngineError> {
    let text = path.to_string_lossy();
    if text.is_empty() {
        return Err(EngineError::InvalidCommand("empty path".to_string()));
    }
    if let Some(bad) = text
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || matches!(c, ';' | '"' | '`' | '[' | ']'))
    {
        return Err(EngineError::InvalidCommand(format!(
            "path '{text}' contains unsupported character {bad:?}"
        )));
    }
    Ok(())
}

/// Paths are sent with forward slashes on every platform
fn q_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn render_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
