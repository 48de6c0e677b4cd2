//! Photos pipeline: libraries, then albums one after another, each album a
//! download batch of its own. Sub-albums are synced right after their
//! parent, into a folder nested inside the parent's.
//!
//! Albums run one after another. With hard links enabled the first album to
//! materialize a rendition owns the primary copy, which must be on disk
//! before a later album asks for it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use futures_util::StreamExt;

use super::{check_session, cleanup, prepare_destination, SyncContext, SyncError};
use crate::config::PhotosConfig;
use crate::download::paths::{clean_filename, date_folder, legacy_photo_filename, photo_filename};
use crate::download::{download_all, DownloadTask};
use crate::filter::AlbumTarget;
use crate::hardlink::HardlinkRegistry;
use crate::remote::{RemoteError, RemoteItem, RemoteSession, Scope, ALL_PHOTOS};
use crate::state::SyncedPathSet;
use crate::stats::{CycleStats, ErrorClass, ItemError};
use crate::types::Resource;

/// Saved under the sync root so the photos cleanup pass never sees it.
pub const REGISTRY_FILE: &str = ".photos-hardlinks.json";

pub async fn sync_photos(
    ctx: &SyncContext,
    session: &dyn RemoteSession,
    config: &PhotosConfig,
) -> Result<CycleStats, SyncError> {
    let started = Instant::now();
    let destination = prepare_destination(ctx.root.join(&config.destination)).await?;
    tracing::info!(destination = %destination.display(), "Syncing photos");

    let registry_path = ctx.root.join(REGISTRY_FILE);
    let registry = match (config.rules.use_hardlinks, config.persist_hardlinks) {
        (false, _) => None,
        (true, false) => Some(HardlinkRegistry::new()),
        (true, true) => Some(load_registry(&registry_path).await),
    };

    let synced = SyncedPathSet::new();
    let mut stats = CycleStats::new(Resource::Photos);
    let options = ctx.download_options(Resource::Photos);

    let libraries = listed(session.list_libraries().await, "libraries", &mut stats)?;
    for wanted in &config.rules.libraries {
        if !libraries.contains(wanted) {
            tracing::warn!(library = %wanted, "Configured library not found");
        }
    }

    for library in libraries.iter().filter(|l| config.rules.is_wanted_library(l)) {
        let albums = listed(session.list_albums(library).await, library, &mut stats)?;
        let plan = config.rules.plan_albums(&albums);
        for missing in &plan.missing {
            tracing::warn!(%library, album = %missing, "Album not found, skipping");
        }

        let mut queue: VecDeque<(AlbumTarget, PathBuf)> = plan
            .targets
            .into_iter()
            .map(|t| {
                let folder = PathBuf::from(clean_filename(&t.folder));
                (t, folder)
            })
            .collect();

        while let Some((target, album_folder)) = queue.pop_front() {
            let tasks = album_tasks(
                session,
                library,
                &target,
                &album_folder,
                config,
                &destination,
                &mut stats,
            )
            .await?;
            tracing::info!(%library, album = %target.album, photos = tasks.len(), "Syncing album");
            let batch = download_all(
                session,
                tasks,
                &destination,
                &synced,
                registry.as_ref(),
                &options,
            )
            .await;
            stats.merge(batch);

            if target.album != ALL_PHOTOS {
                let subalbums = listed(
                    session.list_subalbums(library, &target.album).await,
                    &target.album,
                    &mut stats,
                )?;
                // Depth first: children run before the parent's next sibling.
                for sub in subalbums.iter().rev() {
                    let album = format!("{}/{}", target.album, sub);
                    if !config.rules.is_wanted_subalbum(&album) {
                        tracing::debug!(%library, %album, "Skipping excluded sub-album");
                        continue;
                    }
                    let folder = album_folder.join(clean_filename(sub));
                    queue.push_front((
                        AlbumTarget {
                            folder: folder.display().to_string(),
                            album,
                        },
                        folder,
                    ));
                }
            }
            stats.albums_synced.push(target.album);
        }
    }
    check_session(&stats)?;

    if let (Some(registry), true) = (registry, config.persist_hardlinks) {
        save_registry(registry, registry_path).await;
    }

    cleanup(destination, synced, config.remove_obsolete, &mut stats).await;
    stats.finish(started.elapsed());
    Ok(stats)
}

/// Unwrap a listing call. An expired session aborts the cycle; any other
/// failure is recorded and treated as an empty listing.
fn listed(
    result: Result<Vec<String>, RemoteError>,
    what: &str,
    stats: &mut CycleStats,
) -> Result<Vec<String>, SyncError> {
    match result {
        Ok(names) => Ok(names),
        Err(e) if e.is_auth_required() => Err(SyncError::SessionExpired {
            resource: Resource::Photos,
            auth_errors: 1,
        }),
        Err(e) => {
            tracing::warn!(scope = what, error = %e, "Listing failed");
            stats.listing_complete = false;
            stats.record_error(ItemError::new(what, ErrorClass::Listing, e));
            Ok(Vec::new())
        }
    }
}

async fn album_tasks(
    session: &dyn RemoteSession,
    library: &str,
    target: &AlbumTarget,
    album_folder: &Path,
    config: &PhotosConfig,
    destination: &Path,
    stats: &mut CycleStats,
) -> Result<Vec<DownloadTask>, SyncError> {
    let mut tasks = Vec::new();
    let mut listing = session.list_items(&Scope::Album {
        library: library.to_string(),
        album: target.album.clone(),
    });

    while let Some(entry) = listing.next().await {
        let item = match entry {
            Ok(item) => item,
            Err(e) if e.is_auth_required() => {
                return Err(SyncError::SessionExpired {
                    resource: Resource::Photos,
                    auth_errors: 1,
                });
            }
            Err(e) => {
                tracing::warn!(album = %target.album, error = %e, "Album listing failed");
                stats.listing_complete = false;
                stats.record_error(ItemError::new(&target.album, ErrorClass::Listing, e));
                break;
            }
        };
        if !config.rules.is_wanted_photo(&item.name) {
            tracing::debug!(name = %item.name, "Skipping photo by extension");
            continue;
        }

        let folder = photo_folder(album_folder, config.folder_format.as_deref(), &item);
        for &variant in &config.file_sizes {
            if item.variant_size(variant).is_none() {
                tracing::debug!(name = %item.name, variant = variant.as_str(), "Rendition not offered");
                continue;
            }
            let relative = folder.join(photo_filename(&item, variant));
            rename_legacy(
                &destination.join(&folder).join(legacy_photo_filename(&item, variant)),
                &destination.join(&relative),
            )
            .await;

            let mut task = DownloadTask::new(item.clone(), variant, relative);
            if config.rules.use_hardlinks {
                task = task.with_dedup_key(format!("{}:{}", item.id, variant.as_str()));
            }
            tasks.push(task);
        }
    }
    Ok(tasks)
}

fn photo_folder(album_folder: &Path, folder_format: Option<&str>, item: &RemoteItem) -> PathBuf {
    match folder_format {
        Some(format) => {
            let created = item.created.unwrap_or(item.modified).with_timezone(&Local);
            album_folder.join(date_folder(format, &created))
        }
        None => album_folder.to_path_buf(),
    }
}

/// Move a file saved under the old naming scheme to its current name.
async fn rename_legacy(legacy: &Path, current: &Path) {
    if legacy == current
        || !tokio::fs::try_exists(legacy).await.unwrap_or(false)
        || tokio::fs::try_exists(current).await.unwrap_or(true)
    {
        return;
    }
    match tokio::fs::rename(legacy, current).await {
        Ok(()) => tracing::info!(
            from = %legacy.display(),
            to = %current.display(),
            "Renamed file to current naming scheme"
        ),
        Err(e) => tracing::warn!(path = %legacy.display(), error = %e, "Could not rename legacy file"),
    }
}

async fn load_registry(path: &Path) -> HardlinkRegistry {
    let path = path.to_path_buf();
    let loaded = tokio::task::spawn_blocking(move || {
        let result = HardlinkRegistry::load(&path);
        (path, result)
    })
    .await;
    match loaded {
        Ok((_, Ok(registry))) => {
            tracing::debug!(entries = registry.len(), "Loaded hard-link registry");
            registry
        }
        Ok((path, Err(e))) => {
            tracing::warn!(path = %path.display(), error = %e, "Cannot read hard-link registry, starting empty");
            HardlinkRegistry::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Hard-link registry load task failed, starting empty");
            HardlinkRegistry::new()
        }
    }
}

async fn save_registry(registry: HardlinkRegistry, path: PathBuf) {
    let saved = tokio::task::spawn_blocking(move || registry.save(&path).map_err(|e| (path, e))).await;
    match saved {
        Ok(Ok(())) => {}
        Ok(Err((path, e))) => {
            tracing::warn!(path = %path.display(), error = %e, "Cannot save hard-link registry")
        }
        Err(e) => tracing::warn!(error = %e, "Hard-link registry save task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PhotoRules;
    use crate::remote::{Credential, LocalRemote, LoginOutcome, RemoteService};
    use crate::retry::RetryConfig;
    use crate::types::{Region, SizeVariant};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx(root: &Path) -> SyncContext {
        SyncContext {
            root: root.to_path_buf(),
            max_workers: 3,
            retry: RetryConfig {
                max_retries: 0,
                base_delay_secs: 0,
                max_delay_secs: 0,
            },
            no_progress_bar: true,
        }
    }

    fn config(all_albums: bool, hardlinks: bool, albums: &[&str]) -> PhotosConfig {
        PhotosConfig {
            destination: PathBuf::from("photos"),
            sync_interval: 60,
            remove_obsolete: false,
            persist_hardlinks: false,
            folder_format: None,
            file_sizes: vec![SizeVariant::Original],
            rules: PhotoRules::new(
                Vec::new(),
                albums.iter().map(|a| a.to_string()).collect(),
                all_albums,
                hardlinks,
                &[],
            ),
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

    /// Library `PrimarySync` with the given album → file names.
    fn library(albums: &[(&str, &[&str])]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (album, files) in albums {
            let dir = tmp.path().join("photos/PrimarySync").join(album);
            fs::create_dir_all(&dir).unwrap();
            for f in *files {
                fs::write(dir.join(f), format!("data of {f}")).unwrap();
            }
        }
        tmp
    }

    fn files_under(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().strip_prefix(dir).unwrap().display().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_default_plan_puts_everything_in_all() {
        let remote = library(&[("Family", &["a.jpg"]), ("Trips", &["b.jpg", "a.jpg"])]);
        let s = session(remote.path()).await;
        let local = TempDir::new().unwrap();
        let stats = sync_photos(&ctx(local.path()), s.as_ref(), &config(false, false, &[]))
            .await
            .unwrap();
        assert_eq!(stats.downloaded, 2);
        assert_eq!(stats.albums_synced, vec!["All Photos".to_string()]);
        let files = files_under(&local.path().join("photos"));
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.starts_with("all/")));
    }

    #[tokio::test]
    async fn test_all_albums_with_hardlinks_downloads_each_photo_once() {
        let remote = library(&[
            ("Family", &["a.jpg", "b.jpg"]),
            ("Trips", &["a.jpg"]),
            ("Work", &["a.jpg", "c.png"]),
        ]);
        let s = session(remote.path()).await;
        let local = TempDir::new().unwrap();
        let stats = sync_photos(&ctx(local.path()), s.as_ref(), &config(true, true, &[]))
            .await
            .unwrap();

        // All Photos goes first and owns a, b and c.
        assert_eq!(stats.albums_synced[0], "All Photos");
        assert_eq!(stats.downloaded, 3);
        assert_eq!(stats.hardlinked, 5);
        assert!(stats.errors.is_empty(), "{:?}", stats.errors);

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let out = local.path().join("photos");
            let a = |album: &str| {
                let file = files_under(&out.join(album))
                    .into_iter()
                    .find(|f| f.starts_with("a__original__"))
                    .unwrap();
                fs::metadata(out.join(album).join(file)).unwrap().ino()
            };
            assert_eq!(a("All Photos"), a("Family"));
            assert_eq!(a("All Photos"), a("Trips"));
            assert_eq!(a("All Photos"), a("Work"));
        }
    }

    #[tokio::test]
    async fn test_album_filter_in_and_missing_album() {
        let remote = library(&[("Family", &["a.jpg"]), ("Trips", &["b.jpg"])]);
        let s = session(remote.path()).await;
        let local = TempDir::new().unwrap();
        let stats = sync_photos(
            &ctx(local.path()),
            s.as_ref(),
            &config(false, false, &["Trips", "Nope"]),
        )
        .await
        .unwrap();
        assert_eq!(stats.albums_synced, vec!["Trips".to_string()]);
        let files = files_under(&local.path().join("photos"));
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("Trips/b__original__"));
    }

    #[tokio::test]
    async fn test_all_albums_excludes_listed() {
        let remote = library(&[("Family", &["a.jpg"]), ("Hidden", &["h.jpg"])]);
        let s = session(remote.path()).await;
        let local = TempDir::new().unwrap();
        let stats = sync_photos(&ctx(local.path()), s.as_ref(), &config(true, false, &["Hidden"]))
            .await
            .unwrap();
        assert_eq!(
            stats.albums_synced,
            vec!["Family".to_string(), "All Photos".to_string()]
        );
        assert!(!local.path().join("photos/Hidden").exists());
        assert!(files_under(&local.path().join("photos/All Photos"))
            .iter()
            .any(|f| f.starts_with("h__original__")));
    }

    #[tokio::test]
    async fn test_subalbums_sync_into_nested_folders() {
        let remote = library(&[
            ("Trips", &["a.jpg"]),
            ("Trips/2024", &["b.jpg"]),
            ("Trips/2024/Summer", &["c.jpg"]),
            ("Family", &["d.jpg"]),
        ]);
        let s = session(remote.path()).await;
        let local = TempDir::new().unwrap();
        let stats = sync_photos(&ctx(local.path()), s.as_ref(), &config(false, false, &["Trips"]))
            .await
            .unwrap();

        assert_eq!(
            stats.albums_synced,
            vec!["Trips", "Trips/2024", "Trips/2024/Summer"]
        );
        assert_eq!(stats.downloaded, 3);
        let files = files_under(&local.path().join("photos"));
        assert_eq!(files.len(), 3);
        assert!(files[0].starts_with("Trips/2024/Summer/c__original__"));
        assert!(files[1].starts_with("Trips/2024/b__original__"));
        assert!(files[2].starts_with("Trips/a__original__"));
    }

    #[tokio::test]
    async fn test_excluded_subalbum_is_skipped() {
        let remote = library(&[
            ("Trips", &["a.jpg"]),
            ("Trips/Private", &["p.jpg"]),
            ("Trips/Public", &["q.jpg"]),
        ]);
        let s = session(remote.path()).await;
        let local = TempDir::new().unwrap();
        let stats = sync_photos(
            &ctx(local.path()),
            s.as_ref(),
            &config(true, false, &["Trips/Private", ALL_PHOTOS]),
        )
        .await
        .unwrap();
        assert_eq!(stats.albums_synced, vec!["Trips", "Trips/Public"]);
        assert!(local.path().join("photos/Trips/Public").is_dir());
        assert!(!local.path().join("photos/Trips/Private").exists());
    }

    #[tokio::test]
    async fn test_legacy_name_is_renamed_and_skipped() {
        let remote = library(&[("Family", &["a.jpg"])]);
        let s = session(remote.path()).await;
        let local = TempDir::new().unwrap();
        let cfg = config(false, false, &[]);
        sync_photos(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();

        let all = local.path().join("photos/all");
        let current = files_under(&all).remove(0);
        fs::rename(all.join(&current), all.join("a__original.jpg")).unwrap();

        let stats = sync_photos(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.downloaded, 0);
        assert_eq!(files_under(&all), vec![current]);
    }

    #[tokio::test]
    async fn test_date_folders_and_missing_variants() {
        let remote = library(&[("Family", &["a.jpg"])]);
        let s = session(remote.path()).await;
        let local = TempDir::new().unwrap();
        let mut cfg = config(false, false, &[]);
        cfg.folder_format = Some("%Y".into());
        cfg.file_sizes = vec![SizeVariant::Original, SizeVariant::Thumb];
        let stats = sync_photos(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();
        assert_eq!(stats.downloaded, 1);
        assert!(stats.errors.is_empty());
        let files = files_under(&local.path().join("photos"));
        let parts: Vec<&str> = files[0].split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "all");
        assert_eq!(parts[1].len(), 4);
    }

    #[tokio::test]
    async fn test_registry_persisted_and_reused() {
        let remote = library(&[("Family", &["a.jpg"])]);
        let s = session(remote.path()).await;
        let local = TempDir::new().unwrap();
        let mut cfg = config(true, true, &[]);
        cfg.persist_hardlinks = true;
        sync_photos(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();
        let saved = HardlinkRegistry::load(&local.path().join(REGISTRY_FILE)).unwrap();
        assert_eq!(saved.len(), 1);

        // A new album added later links to the saved primary.
        fs::create_dir_all(remote.path().join("photos/PrimarySync/Trips")).unwrap();
        fs::hard_link(
            remote.path().join("photos/PrimarySync/Family/a.jpg"),
            remote.path().join("photos/PrimarySync/Trips/a.jpg"),
        )
        .unwrap();
        let stats = sync_photos(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();
        assert_eq!(stats.downloaded, 0);
        assert_eq!(stats.hardlinked, 1);
    }

    #[tokio::test]
    async fn test_remove_obsolete_drops_deleted_photo() {
        let remote = library(&[("Family", &["a.jpg", "b.jpg"])]);
        let s = session(remote.path()).await;
        let local = TempDir::new().unwrap();
        let mut cfg = config(false, false, &[]);
        cfg.remove_obsolete = true;
        sync_photos(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();
        fs::remove_file(remote.path().join("photos/PrimarySync/Family/b.jpg")).unwrap();
        let stats = sync_photos(&ctx(local.path()), s.as_ref(), &cfg).await.unwrap();
        assert_eq!(stats.removed, 1);
        let files = files_under(&local.path().join("photos"));
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("all/a__original__"));
    }
}
