//! Per-resource sync pipelines.
//!
//! Each pipeline lists the remote, decides what is wanted, hands the work to
//! the download coordinator and, if asked to and the listing was complete,
//! removes local entries the remote no longer has.

pub mod drive;
pub mod photos;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::cleanup::remove_obsolete;
use crate::download::DownloadOptions;
use crate::retry::RetryConfig;
use crate::state::SyncedPathSet;
use crate::stats::{CycleStats, ErrorClass, ItemError};
use crate::types::Resource;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Session expired during {resource} sync ({auth_errors} auth errors)")]
    SessionExpired {
        resource: Resource,
        auth_errors: usize,
    },

    #[error("Cannot prepare destination {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Settings shared by both pipelines for one iteration.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub root: PathBuf,
    pub max_workers: usize,
    pub retry: RetryConfig,
    pub no_progress_bar: bool,
}

impl SyncContext {
    fn download_options(&self, resource: Resource) -> DownloadOptions {
        DownloadOptions {
            resource,
            max_workers: self.max_workers,
            retry: self.retry,
            no_progress_bar: self.no_progress_bar,
        }
    }
}

async fn prepare_destination(path: PathBuf) -> Result<PathBuf, SyncError> {
    match tokio::fs::create_dir_all(&path).await {
        Ok(()) => Ok(path),
        Err(source) => Err(SyncError::Destination { path, source }),
    }
}

/// Download failures caused by an expired session mean the whole cycle
/// has to be redone after logging in again.
fn check_session(stats: &CycleStats) -> Result<(), SyncError> {
    let auth_errors = stats
        .errors
        .iter()
        .filter(|e| e.class == ErrorClass::Authentication)
        .count();
    if auth_errors > 0 {
        return Err(SyncError::SessionExpired {
            resource: stats.resource,
            auth_errors,
        });
    }
    Ok(())
}

/// Run the cleanup pass if enabled and safe, folding its outcome into `stats`.
async fn cleanup(destination: PathBuf, synced: SyncedPathSet, enabled: bool, stats: &mut CycleStats) {
    if !enabled {
        return;
    }
    if !stats.listing_complete {
        tracing::warn!(
            resource = %stats.resource,
            "Listing was incomplete, skipping removal of obsolete files"
        );
        return;
    }
    let report = match tokio::task::spawn_blocking(move || remove_obsolete(&destination, &synced)).await {
        Ok(report) => report,
        Err(e) => {
            stats.record_error(ItemError::new("cleanup", ErrorClass::Cleanup, e));
            return;
        }
    };
    stats.removed += report.removed_count() as u64;
    for (path, error) in report.failed {
        stats.record_error(ItemError::new(
            path.display().to_string(),
            ErrorClass::Cleanup,
            error,
        ));
    }
}
