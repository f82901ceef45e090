//! Source file discovery
//!
//! Extracts are named `<YYYYMMDD>_<feed><kind suffix>`, for example
//! `20170501_EUX_MKtrade.csv.gz`. A shard's files of one kind are those whose
//! name starts with the shard's `YYYYMM` and ends with the kind's suffix.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tickload_common::{DataKind, PartitionDate, ShardKey};
use tracing::{debug, trace};

use crate::error::{IngestError, Result};

/// A compressed extract found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub file_name: String,
    pub kind: DataKind,
    pub shard: ShardKey,
    pub date: PartitionDate,
}

/// File name pattern for one kind
///
/// Captures the year, month and day of the prefix.
pub fn kind_pattern(kind: DataKind) -> std::result::Result<Regex, regex::Error> {
    let pattern = format!(
        r"^(?P<year>\d{{4}})(?P<month>\d{{2}})(?P<day>\d{{2}})_\S+{}$",
        regex::escape(kind.file_suffix())
    );
    Regex::new(&pattern)
}

static PATTERNS: LazyLock<std::result::Result<[Regex; 3], regex::Error>> = LazyLock::new(|| {
    Ok([
        kind_pattern(DataKind::Trade)?,
        kind_pattern(DataKind::Order)?,
        kind_pattern(DataKind::Book)?,
    ])
});

fn compiled_pattern(kind: DataKind) -> Result<&'static Regex> {
    let patterns = PATTERNS.as_ref().map_err(|e| IngestError::Pattern(e.clone()))?;
    Ok(match kind {
        DataKind::Trade => &patterns[0],
        DataKind::Order => &patterns[1],
        DataKind::Book => &patterns[2],
    })
}

/// Lists the extracts of a source directory
#[derive(Debug, Clone, Default)]
pub struct FileCatalog;

impl FileCatalog {
    pub fn new() -> Self {
        Self
    }

    /// Files of `kind` belonging to `shard`, sorted by file name
    ///
    /// Names that match the kind pattern but do not carry a valid calendar
    /// date are skipped.
    pub fn discover(&self, directory: &Path, shard: ShardKey, kind: DataKind) -> Result<Vec<SourceFile>> {
        if !directory.is_dir() {
            return Err(IngestError::DirectoryNotFound(directory.to_path_buf()));
        }

        let pattern = compiled_pattern(kind)?;
        let mut files = Vec::new();

        for entry in std::fs::read_dir(directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                trace!(path = %entry.path().display(), "Skipping non UTF-8 file name");
                continue;
            };

            let Some(captures) = pattern.captures(&file_name) else {
                continue;
            };
            if format!("{}{}", &captures["year"], &captures["month"]) != shard.to_string() {
                continue;
            }

            let date = match PartitionDate::from_file_name(&file_name) {
                Ok(date) => date,
                Err(e) => {
                    debug!(file = %file_name, error = %e, "Skipping file with invalid date prefix");
                    continue;
                },
            };

            files.push(SourceFile {
                path: entry.path(),
                file_name,
                kind,
                shard,
                date,
            });
        }

        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        debug!(
            directory = %directory.display(),
            shard = %shard,
            kind = %kind,
            count = files.len(),
            "Catalog discovery complete"
        );
        Ok(files)
    }
}
