//! Removes local entries the remote no longer has.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::state::SyncedPathSet;
use crate::unicode::nfc_path;

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, io::Error)>,
}

impl CleanupReport {
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }
}

/// Delete every file and directory under `root` whose relative path is not
/// in `synced`. The walk is depth-first with contents before their
/// directory, so a directory is empty by the time its turn comes. Failures
/// are collected and the walk carries on.
pub fn remove_obsolete(root: &Path, synced: &SyncedPathSet) -> CleanupReport {
    let mut report = CleanupReport::default();
    if !root.is_dir() {
        return report;
    }

    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                tracing::warn!(path = %path.display(), error = %e, "Cannot inspect during cleanup");
                report.failed.push((path, io::Error::from(e)));
                continue;
            }
        };
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if synced.contains(&nfc_path(relative)) {
            continue;
        }

        let result = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        match result {
            Ok(()) => {
                tracing::info!(path = %entry.path().display(), "Removed obsolete entry");
                report.removed.push(entry.path().to_path_buf());
            }
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove obsolete entry");
                report.failed.push((entry.path().to_path_buf(), e));
            }
        }
    }

    report
}
