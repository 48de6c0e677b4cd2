//! Drive pipeline: walk the folder tree, queue wanted files, download.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;

use futures_util::StreamExt;

use super::{check_session, cleanup, prepare_destination, SyncContext, SyncError};
use crate::config::DriveConfig;
use crate::download::{download_all, DownloadTask};
use crate::filter::{is_wanted_file, is_wanted_folder, is_wanted_parent_folder, DriveRules};
use crate::remote::{ItemKind, RemoteSession, Scope};
use crate::state::SyncedPathSet;
use crate::stats::{CycleStats, ErrorClass, ItemError};
use crate::types::{Resource, SizeVariant};
use crate::unicode::nfc;

pub async fn sync_drive(
    ctx: &SyncContext,
    session: &dyn RemoteSession,
    config: &DriveConfig,
) -> Result<CycleStats, SyncError> {
    let started = Instant::now();
    let destination = prepare_destination(ctx.root.join(&config.destination)).await?;
    tracing::info!(destination = %destination.display(), "Syncing drive");

    let synced = SyncedPathSet::new();
    let mut stats = CycleStats::new(Resource::Drive);
    let tasks = collect_tasks(session, &destination, &config.rules, &synced, &mut stats).await?;
    tracing::info!(files = tasks.len(), "Drive listing done");

    let batch = download_all(
        session,
        tasks,
        &destination,
        &synced,
        None,
        &ctx.download_options(Resource::Drive),
    )
    .await;
    stats.merge(batch);
    check_session(&stats)?;

    cleanup(destination, synced, config.remove_obsolete, &mut stats).await;
    stats.finish(started.elapsed());
    Ok(stats)
}

/// Breadth-first walk of the remote tree. Wanted folders are created
/// locally before any file below them is queued. When a folder cannot be
/// created its subtree is still listed, and every wanted file in it is
/// reported as failed instead of downloaded.
async fn collect_tasks(
    session: &dyn RemoteSession,
    destination: &std::path::Path,
    rules: &DriveRules,
    synced: &SyncedPathSet,
    stats: &mut CycleStats,
) -> Result<Vec<DownloadTask>, SyncError> {
    let mut tasks = Vec::new();
    // (remote id, relative path, whether the local folder exists)
    let mut queue: VecDeque<(Option<String>, PathBuf, bool)> =
        VecDeque::from([(None, PathBuf::new(), true)]);

    while let Some((folder_id, folder, placeable)) = queue.pop_front() {
        let files_wanted = is_wanted_parent_folder(&folder, rules);
        let mut listing = session.list_items(&Scope::Drive {
            folder: folder_id.clone(),
        });

        while let Some(entry) = listing.next().await {
            let item = match entry {
                Ok(item) => item,
                Err(e) if e.is_auth_required() => {
                    return Err(SyncError::SessionExpired {
                        resource: Resource::Drive,
                        auth_errors: 1,
                    });
                }
                Err(e) => {
                    tracing::warn!(folder = %folder.display(), error = %e, "Listing failed");
                    stats.listing_complete = false;
                    stats.record_error(ItemError::new(
                        folder.display().to_string(),
                        ErrorClass::Listing,
                        e,
                    ));
                    break;
                }
            };

            let relative = folder.join(nfc(&item.name));
            match item.kind {
                ItemKind::Folder => {
                    if !is_wanted_folder(&relative, rules) {
                        tracing::debug!(folder = %relative.display(), "Skipping unwanted folder");
                        continue;
                    }
                    if !placeable {
                        queue.push_back((Some(item.id.clone()), relative, false));
                        continue;
                    }
                    if let Err(e) = tokio::fs::create_dir_all(destination.join(&relative)).await {
                        tracing::error!(folder = %relative.display(), error = %e, "Cannot create folder");
                        // Local state below it is unknown, so nothing may be pruned.
                        stats.listing_complete = false;
                        stats.record_error(ItemError::new(
                            relative.display().to_string(),
                            ErrorClass::Filesystem,
                            e,
                        ));
                        queue.push_back((Some(item.id.clone()), relative, false));
                        continue;
                    }
                    synced.insert(&relative);
                    queue.push_back((Some(item.id.clone()), relative, true));
                }
                ItemKind::File | ItemKind::Package => {
                    if !files_wanted || !is_wanted_file(&relative, rules) {
                        tracing::debug!(file = %relative.display(), "Skipping unwanted file");
                        continue;
                    }
                    if !placeable {
                        tracing::warn!(file = %relative.display(), "Parent folder missing, not downloading");
                        stats.record_error(ItemError::new(
                            relative.display().to_string(),
                            ErrorClass::Filesystem,
                            "parent folder could not be created",
                        ));
                        continue;
                    }
                    tasks.push(DownloadTask::new(item, SizeVariant::Original, relative));
                }
            }
        }
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Credential, LocalRemote, LoginOutcome, RemoteService};
    use crate::retry::RetryConfig;
    use crate::types::Region;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx(root: &Path) -> SyncContext {
        SyncContext {
            root: root.to_path_buf(),
            max_workers: 2,
            retry: RetryConfig {
                max_retries: 0,
                base_delay_secs: 0,
                max_delay_secs: 0,
            },
            no_progress_bar: true,
        }
    }

    fn config(folders: &[&str], exts: &[&str], ignore: &[&str], remove: bool) -> DriveConfig {
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        DriveConfig {
            destination: PathBuf::from("drive"),
            sync_interval: 60,
            remove_obsolete: remove,
            rules: DriveRules::new(&s(folders), &s(exts), &s(ignore)),
        }
    }

    async fn session(remote: &Path) -> Arc<dyn RemoteSession> {
        let cred = Credential {
            username: "u".into(),
            password: "p".into(),
            region: Region::Global,
        };
        match LocalRemote::new(remote).authenticate(&cred).await.unwrap() {
            LoginOutcome::Session(s) => s,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn remote(files: &[&str]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for rel in files {
            let p = tmp.path().join("drive").join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, rel.as_bytes()).unwrap();
        }
        tmp
    }

    #[tokio::test]
    async fn test_filters_and_nested_folders() {
        let r = remote(&[
            "top.pdf",
            "Work/Reports/q1.pdf",
            "Work/Reports/q1.tmp",
            "Work/Reports/2024/q2.pdf",
            "Work/notes.pdf",
            "Personal/diary.pdf",
        ]);
        let s = session(r.path()).await;
        let local = TempDir::new().unwrap();
        let stats = sync_drive(
            &ctx(local.path()),
            s.as_ref(),
            &config(&["Work/Reports"], &["pdf"], &["*.tmp"], false),
        )
        .await
        .unwrap();

        let out = local.path().join("drive");
        assert!(out.join("Work/Reports/q1.pdf").is_file());
        assert!(out.join("Work/Reports/2024/q2.pdf").is_file());
        assert!(!out.join("Work/Reports/q1.tmp").exists());
        assert!(!out.join("Work/notes.pdf").exists());
        assert!(!out.join("top.pdf").exists());
        assert!(!out.join("Personal").exists());
        assert_eq!(stats.downloaded, 2);
        assert!(stats.listing_complete);
    }

    #[tokio::test]
    async fn test_remove_obsolete_after_remote_delete() {
        let r = remote(&["a.txt", "dir/b.txt", "dir/c.txt"]);
        let s = session(r.path()).await;
        let local = TempDir::new().unwrap();
        let cfg = config(&[], &[], &[], true);
        sync_drive(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();

        fs::remove_file(r.path().join("drive/dir/c.txt")).unwrap();
        fs::write(local.path().join("drive/dir/local-only.txt"), b"x").unwrap();
        let stats = sync_drive(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();

        let out = local.path().join("drive");
        assert!(out.join("a.txt").is_file());
        assert!(out.join("dir/b.txt").is_file());
        assert!(!out.join("dir/c.txt").exists());
        assert!(!out.join("dir/local-only.txt").exists());
        assert_eq!(stats.removed, 2);
        assert_eq!(stats.skipped, 2);
    }

    #[tokio::test]
    async fn test_empty_wanted_folder_survives_cleanup() {
        let r = remote(&["a.txt"]);
        fs::create_dir_all(r.path().join("drive/empty")).unwrap();
        let s = session(r.path()).await;
        let local = TempDir::new().unwrap();
        sync_drive(&ctx(local.path()), s.as_ref(), &config(&[], &[], &[], true))
            .await
            .unwrap();
        assert!(local.path().join("drive/empty").is_dir());
    }

    #[tokio::test]
    async fn test_package_contents_survive_cleanup() {
        let r = remote(&["Talk.key/Index.zip", "Talk.key/Data/img.png"]);
        let s = session(r.path()).await;
        let local = TempDir::new().unwrap();
        let cfg = config(&[], &[], &[], true);
        sync_drive(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();
        let stats = sync_drive(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();
        assert_eq!(stats.removed, 0);
        assert!(local.path().join("drive/Talk.key/Data/img.png").is_file());
    }

    #[tokio::test]
    async fn test_uncreatable_folder_reports_every_file_below_it() {
        let r = remote(&["ok.txt", "dir/a.txt", "dir/b.txt", "dir/sub/c.txt"]);
        let s = session(r.path()).await;
        let local = TempDir::new().unwrap();
        fs::create_dir_all(local.path().join("drive")).unwrap();
        // A regular file where the folder should go.
        fs::write(local.path().join("drive/dir"), b"in the way").unwrap();

        let stats = sync_drive(&ctx(local.path()), s.as_ref(), &config(&[], &[], &[], true))
            .await
            .unwrap();

        assert_eq!(stats.downloaded, 1);
        assert!(!stats.listing_complete);
        assert_eq!(stats.errors.len(), 4);
        assert!(stats.errors.iter().all(|e| e.class == ErrorClass::Filesystem));
        let items: Vec<&str> = stats.errors.iter().map(|e| e.item.as_str()).collect();
        for file in ["dir/a.txt", "dir/b.txt", "dir/sub/c.txt"] {
            assert!(items.contains(&file), "{file} not reported: {items:?}");
        }
        assert!(local.path().join("drive/dir").is_file());
    }

    #[tokio::test]
    async fn test_missing_remote_tree_skips_cleanup() {
        let r = remote(&["a.txt"]);
        let s = session(r.path()).await;
        let local = TempDir::new().unwrap();
        let cfg = config(&[], &[], &[], true);
        sync_drive(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();

        fs::remove_dir_all(r.path().join("drive")).unwrap();
        let stats = sync_drive(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();
        assert!(!stats.listing_complete);
        assert_eq!(stats.errors[0].class, ErrorClass::Listing);
        assert!(local.path().join("drive/a.txt").is_file());
    }
}
