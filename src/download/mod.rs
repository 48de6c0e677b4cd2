//! Download coordinator: runs a batch of download tasks through a bounded
//! worker pool. Each task skips, links or downloads its item and records
//! the outcome in the shared cycle bookkeeping. A failed item never fails
//! the batch.

pub mod error;
pub mod file;
pub mod package;
pub mod paths;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use walkdir::WalkDir;

use crate::freshness::{is_up_to_date, is_variant_up_to_date, resolve_local};
use crate::hardlink::{HardlinkRegistry, LinkResult};
use crate::remote::{ItemKind, RemoteItem, RemoteSession};
use crate::retry::RetryConfig;
use crate::state::SyncedPathSet;
use crate::stats::{CycleStats, ItemError};
use crate::types::{Resource, SizeVariant};
use error::DownloadError;

/// One rendition of one remote item, bound to a destination.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub item: RemoteItem,
    pub variant: SizeVariant,
    /// Destination relative to the batch root.
    pub relative_path: PathBuf,
    /// Identity shared by every album copy of this rendition. Tasks with a
    /// key take part in hard-link deduplication.
    pub dedup_key: Option<String>,
}

impl DownloadTask {
    pub fn new(item: RemoteItem, variant: SizeVariant, relative_path: PathBuf) -> Self {
        Self {
            item,
            variant,
            relative_path,
            dedup_key: None,
        }
    }

    pub fn with_dedup_key(mut self, key: String) -> Self {
        self.dedup_key = Some(key);
        self
    }

    fn label(&self) -> String {
        self.relative_path.display().to_string()
    }
}

/// Batch settings that stay fixed for a whole cycle.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub resource: Resource,
    pub max_workers: usize,
    pub retry: RetryConfig,
    pub no_progress_bar: bool,
}

/// Shared, lock-guarded state the workers write into.
struct Shared<'a> {
    root: &'a Path,
    synced: &'a SyncedPathSet,
    registry: Option<&'a HardlinkRegistry>,
    stats: Mutex<CycleStats>,
    retry: RetryConfig,
    pb: ProgressBar,
}

impl Shared<'_> {
    fn update(&self, f: impl FnOnce(&mut CycleStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut stats);
    }
}

/// Create a progress bar with a consistent template. Hidden when disabled
/// or when stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) =
        ProgressStyle::with_template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

/// Run every task with at most `options.max_workers` in flight and return
/// the batch's share of the cycle statistics.
///
/// Relative paths that end up present locally are added to `synced`. When
/// a `registry` is given, tasks carrying a dedup key link to an existing
/// primary copy instead of downloading, and register themselves as the
/// primary otherwise.
pub async fn download_all(
    session: &dyn RemoteSession,
    tasks: Vec<DownloadTask>,
    root: &Path,
    synced: &SyncedPathSet,
    registry: Option<&HardlinkRegistry>,
    options: &DownloadOptions,
) -> CycleStats {
    let shared = Shared {
        root,
        synced,
        registry,
        stats: Mutex::new(CycleStats::new(options.resource)),
        retry: options.retry,
        pb: create_progress_bar(options.no_progress_bar, tasks.len() as u64),
    };

    {
        let shared_ref = &shared;
        let results = stream::iter(tasks)
            .map(|task| async move {
                process_task(session, &task, shared_ref).await;
                task.relative_path
            })
            .buffer_unordered(options.max_workers.max(1));
        tokio::pin!(results);

        while let Some(done) = results.next().await {
            let name = done
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            shared.pb.set_message(name);
            shared.pb.inc(1);
        }
    }
    shared.pb.finish_and_clear();

    shared.stats.into_inner().unwrap_or_else(|p| p.into_inner())
}

async fn process_task(session: &dyn RemoteSession, task: &DownloadTask, shared: &Shared<'_>) {
    let dest = shared.root.join(&task.relative_path);

    if is_fresh(&dest, task) {
        tracing::debug!(path = %task.relative_path.display(), "Up to date, skipping");
        mark_synced(shared.synced, task, &dest);
        if let (Some(registry), Some(key)) = (shared.registry, &task.dedup_key) {
            registry.register(key, &resolve_local(&dest).unwrap_or_else(|| dest.clone()));
        }
        shared.update(|s| s.skipped += 1);
        return;
    }

    if let (Some(registry), Some(key)) = (shared.registry, &task.dedup_key) {
        match registry.try_link(key, &dest) {
            LinkResult::Linked(primary) => {
                shared.pb.suspend(|| {
                    tracing::info!(
                        path = %task.relative_path.display(),
                        primary = %primary.display(),
                        "Hard-linked to existing copy"
                    )
                });
                shared.synced.insert(&task.relative_path);
                let saved = task.item.variant_size(task.variant).unwrap_or(0);
                shared.update(|s| {
                    s.hardlinked += 1;
                    s.bytes_saved += saved;
                });
                return;
            }
            LinkResult::LinkFailed(e) => {
                shared.pb.suspend(|| {
                    tracing::warn!(
                        path = %task.relative_path.display(),
                        error = %e,
                        "Hard link failed, downloading instead"
                    )
                });
            }
            LinkResult::NoPriorCopy => {}
        }
    }

    match download_task(session, task, &dest, shared.retry).await {
        Ok(bytes) => {
            shared.pb.suspend(|| {
                tracing::info!(path = %task.relative_path.display(), bytes, "Downloaded")
            });
            mark_synced(shared.synced, task, &dest);
            if let (Some(registry), Some(key)) = (shared.registry, &task.dedup_key) {
                registry.register(key, &dest);
            }
            shared.update(|s| {
                s.downloaded += 1;
                s.bytes_downloaded += bytes;
            });
        }
        Err(e) => {
            shared.pb.suspend(|| {
                tracing::error!(path = %task.relative_path.display(), error = %e, "Download failed")
            });
            // Keep any older local copy out of cleanup's reach.
            if resolve_local(&dest).is_some() {
                mark_synced(shared.synced, task, &dest);
            }
            shared.update(|s| s.record_error(ItemError::new(task.label(), e.class(), &e)));
        }
    }
}

/// Record a task's destination as present. A package directory brings
/// every entry below it along.
fn mark_synced(synced: &SyncedPathSet, task: &DownloadTask, dest: &Path) {
    synced.insert(&task.relative_path);
    if task.item.kind != ItemKind::Package {
        return;
    }
    let Some(found) = resolve_local(dest) else {
        return;
    };
    for entry in WalkDir::new(&found).min_depth(1).into_iter().flatten() {
        if let Ok(inner) = entry.path().strip_prefix(&found) {
            synced.insert(&task.relative_path.join(inner));
        }
    }
}

fn is_fresh(dest: &Path, task: &DownloadTask) -> bool {
    match task.item.kind {
        ItemKind::Package => is_up_to_date(dest, &task.item),
        _ => is_variant_up_to_date(dest, &task.item, task.variant),
    }
}

/// Fetch into a temp file, move it into place (expanding packages), then
/// stamp the remote modification time.
async fn download_task(
    session: &dyn RemoteSession,
    task: &DownloadTask,
    dest: &Path,
    retry: RetryConfig,
) -> Result<u64, DownloadError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tracing::debug!(
        size_bytes = task.item.variant_size(task.variant),
        path = %dest.display(),
        "downloading",
    );

    let part = file::temp_download_path(dest, &task.item.id, task.variant);
    let bytes = match file::fetch_to_part(session, &task.item, task.variant, &part, &retry).await {
        Ok(n) => n,
        Err(e) => {
            file::discard(&part).await;
            return Err(e);
        }
    };

    if task.item.kind == ItemKind::Package {
        let (archive, target) = (part.clone(), dest.to_path_buf());
        tokio::task::spawn_blocking(move || package::expand_package(&archive, &target))
            .await
            .map_err(|e| DownloadError::Extraction {
                path: dest.display().to_string(),
                reason: e.to_string(),
            })??;
    } else if let Err(e) = file::commit(&part, dest).await {
        file::discard(&part).await;
        return Err(e);
    }

    let mtime_path = dest.to_path_buf();
    let ts = task.item.modified.timestamp();
    match tokio::task::spawn_blocking(move || file::set_file_mtime(&mtime_path, ts)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Could not set mtime on {}: {}", dest.display(), e),
        Err(e) => tracing::warn!("mtime task failed for {}: {}", dest.display(), e),
    }

    Ok(bytes)
}
