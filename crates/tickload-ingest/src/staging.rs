//! Staging and decompression of source extracts
//!
//! The source tree is treated as read-only: extracts are optionally copied to
//! a scratch directory first and decompressed next to that copy. Output is
//! streamed into a temporary file in the destination directory and renamed
//! into place once complete, so a failed extraction never leaves a partial
//! file under the final name.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::catalog::SourceFile;
use crate::error::{IngestError, Result};

/// Files produced while extracting one source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingCopy {
    pub original: PathBuf,
    /// Copy of the compressed file in the staging directory
    pub staged: Option<PathBuf>,
    pub decompressed: PathBuf,
}

impl StagingCopy {
    /// Artifacts created by the extraction, which the original is never part of
    pub fn artifacts(&self) -> Vec<&Path> {
        let mut paths = vec![self.decompressed.as_path()];
        if let Some(staged) = &self.staged {
            paths.push(staged.as_path());
        }
        paths
    }
}

/// Name of the decompressed output: the file name without its `.gz` suffix
pub fn decompressed_name(file_name: &str) -> String {
    file_name
        .strip_suffix(".gz")
        .unwrap_or(file_name)
        .to_string()
}

/// Copies and decompresses extracts
#[derive(Debug, Clone, Default)]
pub struct StagingExtractor {
    staging_dir: Option<PathBuf>,
}

impl StagingExtractor {
    pub fn new(staging_dir: Option<PathBuf>) -> Self {
        Self { staging_dir }
    }

    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging_dir.as_deref()
    }

    /// Stage (if configured) and decompress one file
    ///
    /// Blocking; run it on the blocking pool from async code.
    pub fn extract(&self, file: &SourceFile) -> Result<StagingCopy> {
        let staged = self.stage(file)?;
        let compressed = staged.as_deref().unwrap_or(&file.path);

        let output_dir = compressed
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let decompressed = output_dir.join(decompressed_name(&file.file_name));

        let failed = |reason: String| IngestError::ExtractionFailed {
            file: file.path.clone(),
            staged: staged.clone(),
            reason,
        };

        if decompressed == file.path {
            return Err(failed("decompressed name would overwrite the source".to_string()));
        }

        let bytes = decompress_gzip_file(compressed, &decompressed)
            .map_err(|e| failed(format!("decompression failed: {e}")))?;

        if !decompressed.is_file() {
            return Err(failed(format!(
                "decompressed output {} is missing",
                decompressed.display()
            )));
        }

        debug!(
            file = %file.file_name,
            output = %decompressed.display(),
            bytes,
            staged = staged.is_some(),
            "Extract decompressed"
        );

        Ok(StagingCopy {
            original: file.path.clone(),
            staged,
            decompressed,
        })
    }

    /// Copy the compressed file into the staging directory
    ///
    /// Returns `None` when no staging directory is configured or when it
    /// is the source directory itself.
    fn stage(&self, file: &SourceFile) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.staging_dir else {
            return Ok(None);
        };

        let failed = |reason: String| IngestError::ExtractionFailed {
            file: file.path.clone(),
            staged: None,
            reason,
        };

        std::fs::create_dir_all(dir)
            .map_err(|e| failed(format!("cannot create staging directory {}: {e}", dir.display())))?;

        if let (Ok(staging), Some(Ok(source))) = (
            dir.canonicalize(),
            file.path.parent().map(Path::canonicalize),
        ) {
            if staging == source {
                return Ok(None);
            }
        }

        let target = dir.join(&file.file_name);
        std::fs::copy(&file.path, &target)
            .map_err(|e| failed(format!("copy to {} failed: {e}", target.display())))?;
        Ok(Some(target))
    }
}

/// Decompress a gzip file (all members) to `destination`, returning the bytes written
pub fn decompress_gzip_file(source: &Path, destination: &Path) -> std::io::Result<u64> {
    let dir = destination.parent().unwrap_or_else(|| Path::new("."));
    let input = File::open(source)?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(input));

    let mut temp = NamedTempFile::new_in(dir)?;
    let bytes = {
        let mut writer = BufWriter::new(temp.as_file_mut());
        let bytes = std::io::copy(&mut decoder, &mut writer)?;
        writer.flush()?;
        bytes
    };
    temp.as_file().sync_all()?;
    temp.persist(destination).map_err(|e| e.error)?;
    Ok(bytes)
}
