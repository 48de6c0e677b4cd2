//! Directory-backed remote.
//!
//! Serves an exported tree as if it were the remote store:
//!
//! ```text
//! <root>/drive/...                      files and folders
//! <root>/drive/Report.pages/            bundle folder, served as a zipped package
//! <root>/photos/<library>/<album>/IMG.jpg
//! <root>/photos/<library>/<album>/<sub-album>/IMG.jpg
//! ```
//!
//! A photo's identity is its file name, so the same file exported into two
//! albums is one logical item.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio_util::io::ReaderStream;
use walkdir::WalkDir;

use super::{
    ByteStream, Credential, ItemKind, LoginOutcome, RemoteError, RemoteItem, RemoteService,
    RemoteSession, Scope, Version, ALL_PHOTOS,
};
use crate::types::SizeVariant;

const BUNDLE_EXTENSIONS: &[&str] = &["pages", "numbers", "key", "app", "bundle", "pkg", "rtfd", "band"];

pub struct LocalRemote {
    root: PathBuf,
}

impl LocalRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RemoteService for LocalRemote {
    async fn authenticate(&self, credential: &Credential) -> Result<LoginOutcome, RemoteError> {
        if credential.password.is_empty() {
            return Err(RemoteError::Rejected("empty password".into()));
        }
        if !self.root.is_dir() {
            return Err(RemoteError::NotFound(self.root.display().to_string()));
        }
        tracing::debug!(
            username = %credential.username,
            root = %self.root.display(),
            "Opened directory-backed session"
        );
        Ok(LoginOutcome::Session(Arc::new(LocalSession {
            root: self.root.clone(),
            photo_paths: Arc::new(Mutex::new(HashMap::new())),
        })))
    }
}

struct LocalSession {
    root: PathBuf,
    /// Photo id to source file, filled while listing.
    photo_paths: Arc<Mutex<HashMap<String, PathBuf>>>,
}

#[async_trait]
impl RemoteSession for LocalSession {
    fn list_items(&self, scope: &Scope) -> BoxStream<'_, Result<RemoteItem, RemoteError>> {
        let root = self.root.clone();
        let scope = scope.clone();
        let photo_paths = Arc::clone(&self.photo_paths);
        let listing = async move {
            let joined = tokio::task::spawn_blocking(move || match &scope {
                Scope::Drive { folder } => list_drive(&root, folder.as_deref()),
                Scope::Album { library, album } => {
                    let found = list_album(&root, library, album)?;
                    let mut paths = photo_paths.lock().unwrap_or_else(|p| p.into_inner());
                    Ok(found
                        .into_iter()
                        .map(|(item, path)| {
                            paths.entry(item.id.clone()).or_insert(path);
                            item
                        })
                        .collect())
                }
            })
            .await;
            match joined {
                Ok(Ok(items)) => items.into_iter().map(Ok).collect::<Vec<_>>(),
                Ok(Err(e)) => vec![Err(e)],
                Err(e) => vec![Err(RemoteError::Service(format!("listing task failed: {e}")))],
            }
        };
        stream::once(listing).flat_map(stream::iter).boxed()
    }

    async fn list_libraries(&self) -> Result<Vec<String>, RemoteError> {
        let dir = self.root.join("photos");
        tokio::task::spawn_blocking(move || subdirectories(&dir))
            .await
            .map_err(|e| RemoteError::Service(e.to_string()))?
    }

    async fn list_albums(&self, library: &str) -> Result<Vec<String>, RemoteError> {
        let dir = self.root.join("photos").join(library);
        tokio::task::spawn_blocking(move || subdirectories(&dir))
            .await
            .map_err(|e| RemoteError::Service(e.to_string()))?
    }

    async fn list_subalbums(&self, library: &str, album: &str) -> Result<Vec<String>, RemoteError> {
        if album == ALL_PHOTOS {
            return Ok(Vec::new());
        }
        let dir = self.root.join("photos").join(library).join(album);
        tokio::task::spawn_blocking(move || subdirectories(&dir))
            .await
            .map_err(|e| RemoteError::Service(e.to_string()))?
    }

    async fn download(
        &self,
        item: &RemoteItem,
        variant: SizeVariant,
    ) -> Result<ByteStream, RemoteError> {
        if variant != SizeVariant::Original {
            return Err(RemoteError::NotFound(format!(
                "{} has no {} rendition",
                item.name,
                variant.as_str()
            )));
        }

        let path = if item.versions.is_empty() {
            self.root.join("drive").join(&item.id)
        } else {
            let paths = self.photo_paths.lock().unwrap_or_else(|p| p.into_inner());
            paths
                .get(&item.id)
                .cloned()
                .ok_or_else(|| RemoteError::NotFound(item.id.clone()))?
        };

        if item.kind == ItemKind::Package {
            let archive = tokio::task::spawn_blocking(move || zip_directory(&path))
                .await
                .map_err(|e| RemoteError::Service(e.to_string()))??;
            return Ok(stream::once(async move { Ok(Bytes::from(archive)) }).boxed());
        }

        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RemoteError::NotFound(item.id.clone())
            } else {
                RemoteError::Io(e)
            }
        })?;
        Ok(ReaderStream::new(file)
            .map(|chunk| chunk.map_err(RemoteError::from))
            .boxed())
    }
}

fn is_bundle(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| BUNDLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn modified_of(meta: &fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_default()
}

fn sorted_entries(dir: &Path) -> Result<Vec<fs::DirEntry>, RemoteError> {
    let read = fs::read_dir(dir).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RemoteError::NotFound(dir.display().to_string())
        } else {
            RemoteError::Io(e)
        }
    })?;
    let mut entries = read.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

fn subdirectories(dir: &Path) -> Result<Vec<String>, RemoteError> {
    let mut names = Vec::new();
    for entry in sorted_entries(dir)? {
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

fn list_drive(root: &Path, folder: Option<&str>) -> Result<Vec<RemoteItem>, RemoteError> {
    let base = root.join("drive");
    let dir = match folder {
        Some(id) => base.join(id),
        None => base,
    };
    let mut items = Vec::new();
    for entry in sorted_entries(&dir)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let id = match folder {
            Some(parent) => format!("{parent}/{name}"),
            None => name.clone(),
        };
        let meta = entry.metadata()?;
        let (kind, size, modified) = if meta.is_dir() && is_bundle(&name) {
            let (size, modified) = bundle_signature(&entry.path())?;
            (ItemKind::Package, size, modified.unwrap_or_else(|| modified_of(&meta)))
        } else if meta.is_dir() {
            (ItemKind::Folder, 0, modified_of(&meta))
        } else {
            (ItemKind::File, meta.len(), modified_of(&meta))
        };
        items.push(RemoteItem {
            id,
            name,
            kind,
            size,
            modified,
            created: None,
            versions: BTreeMap::new(),
            albums: Vec::new(),
        });
    }
    Ok(items)
}

/// Total file size and newest file mtime below a bundle folder.
fn bundle_signature(dir: &Path) -> Result<(u64, Option<DateTime<Utc>>), RemoteError> {
    let mut size = 0;
    let mut newest: Option<DateTime<Utc>> = None;
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            let meta = entry.metadata().map_err(std::io::Error::from)?;
            size += meta.len();
            let m = modified_of(&meta);
            newest = Some(newest.map_or(m, |n| n.max(m)));
        }
    }
    Ok((size, newest))
}

fn uniform_type(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    let uti = match ext.as_str() {
        "jpg" | "jpeg" => "public.jpeg",
        "png" => "public.png",
        "heic" => "public.heic",
        "gif" => "com.compuserve.gif",
        "tif" | "tiff" => "public.tiff",
        "mov" => "com.apple.quicktime-movie",
        "mp4" => "public.mpeg-4",
        _ => return None,
    };
    Some(uti.to_string())
}

fn photo_item(path: &Path, albums: Vec<String>) -> Result<RemoteItem, RemoteError> {
    let meta = fs::metadata(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let modified = modified_of(&meta);
    let mut versions = BTreeMap::new();
    versions.insert(
        SizeVariant::Original,
        Version {
            size: meta.len(),
            file_type: uniform_type(&name),
        },
    );
    Ok(RemoteItem {
        id: name.clone(),
        name,
        kind: ItemKind::File,
        size: meta.len(),
        modified,
        created: Some(modified),
        versions,
        albums,
    })
}

fn list_album(
    root: &Path,
    library: &str,
    album: &str,
) -> Result<Vec<(RemoteItem, PathBuf)>, RemoteError> {
    let library_dir = root.join("photos").join(library);
    if album != ALL_PHOTOS {
        let mut found = Vec::new();
        for entry in sorted_entries(&library_dir.join(album))? {
            if entry.file_type()?.is_file() {
                let path = entry.path();
                found.push((photo_item(&path, vec![album.to_string()])?, path));
            }
        }
        return Ok(found);
    }

    if !library_dir.is_dir() {
        return Err(RemoteError::NotFound(library_dir.display().to_string()));
    }
    // Same file name in several albums is one photo with several memberships.
    let mut by_id: BTreeMap<String, (PathBuf, Vec<String>)> = BTreeMap::new();
    for entry in WalkDir::new(&library_dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let album_name = entry
            .path()
            .parent()
            .and_then(|p| p.strip_prefix(&library_dir).ok())
            .filter(|rel| !rel.as_os_str().is_empty())
            .map(album_path);
        let slot = by_id
            .entry(name)
            .or_insert_with(|| (entry.path().to_path_buf(), Vec::new()));
        if let Some(album_name) = album_name {
            slot.1.push(album_name);
        }
    }
    by_id
        .into_values()
        .map(|(path, albums)| Ok((photo_item(&path, albums)?, path)))
        .collect()
}

/// `Trips/2024` for a nested album folder, on every platform.
fn album_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn zip_directory(dir: &Path) -> Result<Vec<u8>, RemoteError> {
    let base = dir.parent().unwrap_or(dir);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    let zip_err = |e: zip::result::ZipError| RemoteError::Service(format!("zip: {e}"));

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(base)
            .map_err(|e| RemoteError::Service(e.to_string()))?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if entry.file_type().is_dir() {
            writer.add_directory(name, options).map_err(zip_err)?;
        } else {
            writer.start_file(name, options).map_err(zip_err)?;
            let content = fs::read(entry.path())?;
            writer.write_all(&content)?;
        }
    }
    let cursor = writer.finish().map_err(zip_err)?;
    Ok(cursor.into_inner())
}
