//! Decides whether a local copy already matches a remote item.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::remote::{ItemKind, RemoteItem};
use crate::types::SizeVariant;
use crate::unicode::nfc_os;

/// A local entry is up to date when it exists, its size matches and its
/// mtime is not older than the remote one (whole seconds). Packages compare
/// the summed size of every file below the package directory instead.
pub fn is_up_to_date(local: &Path, item: &RemoteItem) -> bool {
    matches_snapshot(local, item.kind, item.size, item.modified)
}

/// Same check against one photo rendition, which has its own size.
pub fn is_variant_up_to_date(local: &Path, item: &RemoteItem, variant: SizeVariant) -> bool {
    match item.variant_size(variant) {
        Some(size) => matches_snapshot(local, ItemKind::File, size, item.modified),
        None => false,
    }
}

fn matches_snapshot(local: &Path, kind: ItemKind, size: u64, modified: DateTime<Utc>) -> bool {
    let Some(found) = resolve_local(local) else {
        tracing::debug!(path = %local.display(), "Not present locally");
        return false;
    };
    let Ok(meta) = fs::metadata(&found) else {
        return false;
    };

    let local_size = match kind {
        ItemKind::Package if meta.is_dir() => aggregate_size(&found),
        ItemKind::File if meta.is_file() => meta.len(),
        _ => {
            tracing::debug!(path = %found.display(), "Local entry has the wrong type");
            return false;
        }
    };
    if local_size != size {
        tracing::debug!(
            path = %found.display(),
            local_size,
            remote_size = size,
            "Size changed"
        );
        return false;
    }

    not_older(&found, meta.modified(), modified)
}

/// Compare in whole seconds. A local mtime that cannot be read counts as
/// older, so the file is fetched again.
fn not_older(path: &Path, local: std::io::Result<SystemTime>, remote: DateTime<Utc>) -> bool {
    match local {
        Ok(mtime) => {
            let local_secs = DateTime::<Utc>::from(mtime).timestamp();
            let fresh = local_secs >= remote.timestamp();
            if !fresh {
                tracing::debug!(
                    path = %path.display(),
                    local_secs,
                    remote_secs = remote.timestamp(),
                    "Local copy is older"
                );
            }
            fresh
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "No usable mtime, treating as stale");
            false
        }
    }
}

fn aggregate_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Find the on-disk entry for `path`, accepting a name that differs only in
/// Unicode normalization form (e.g. NFD on disk, NFC from the remote).
pub fn resolve_local(path: &Path) -> Option<PathBuf> {
    if path.symlink_metadata().is_ok() {
        return Some(path.to_path_buf());
    }
    let name = path.file_name()?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => resolve_local(p)?,
        _ => PathBuf::from("."),
    };
    let wanted = nfc_os(name);
    fs::read_dir(&parent)
        .ok()?
        .filter_map(Result::ok)
        .find(|entry| nfc_os(&entry.file_name()) == wanted)
        .map(|entry| entry.path())
}
