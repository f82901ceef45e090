//! Removal of extraction artifacts
//!
//! Runs after a file was ingested successfully. A file that cannot be removed
//! is reported as a warning and never fails the file.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::staging::StagingCopy;

/// An artifact that is still on disk after cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub warnings: Vec<CleanupWarning>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanupManager;

impl CleanupManager {
    pub fn new() -> Self {
        Self
    }

    /// Delete the decompressed payload and the staged copy, never the original
    pub fn cleanup(&self, copy: &StagingCopy) -> CleanupReport {
        let mut report = CleanupReport::default();

        for path in copy.artifacts() {
            if same_file(path, &copy.original) {
                warn!(path = %path.display(), "Refusing to delete original source file");
                report.warnings.push(CleanupWarning {
                    path: path.to_path_buf(),
                    reason: "path is the original source file".to_string(),
                });
                continue;
            }
            match remove(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed extraction artifact");
                    report.removed.push(path.to_path_buf());
                },
                Err(reason) => {
                    warn!(path = %path.display(), reason = %reason, "Failed to remove extraction artifact");
                    report.warnings.push(CleanupWarning {
                        path: path.to_path_buf(),
                        reason,
                    });
                },
            }
        }

        report
    }
}

fn remove(path: &Path) -> Result<(), String> {
    match std::fs::remove_file(path) {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e.to_string()),
    }
    if path.exists() {
        return Err("file still present after removal".to_string());
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
