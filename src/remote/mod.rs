//! Read-only view of the remote store.
//!
//! The sync core only talks to the remote through [`RemoteService`] (login)
//! and [`RemoteSession`] (listing and content download). Listings are lazy
//! streams that can be restarted by calling `list_items` again.

pub mod error;
pub mod local;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

pub use error::RemoteError;
pub use local::LocalRemote;

use crate::types::{Region, SizeVariant};

/// Name of the pseudo-album holding every photo of a library.
pub const ALL_PHOTOS: &str = "All Photos";

pub type ByteStream = BoxStream<'static, Result<Bytes, RemoteError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Folder,
    /// Multi-file bundle delivered as one compressed download.
    Package,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub size: u64,
    /// Uniform type identifier, e.g. `public.heic`.
    pub file_type: Option<String>,
}

/// Snapshot of one remote entity for the duration of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    pub kind: ItemKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Capture date for photos; drive items leave it unset.
    pub created: Option<DateTime<Utc>>,
    pub versions: BTreeMap<SizeVariant, Version>,
    pub albums: Vec<String>,
}

impl RemoteItem {
    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }

    /// Size of the given rendition. Drive items only have the original.
    pub fn variant_size(&self, variant: SizeVariant) -> Option<u64> {
        if self.versions.is_empty() {
            return (variant == SizeVariant::Original).then_some(self.size);
        }
        self.versions.get(&variant).map(|v| v.size)
    }
}

/// What to enumerate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Children of a drive folder; `None` is the drive root.
    Drive { folder: Option<String> },
    /// Photos directly in an album. Nested albums use `parent/child`.
    Album { library: String, album: String },
}

pub struct Credential {
    pub username: String,
    pub password: String,
    pub region: Region,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

pub enum LoginOutcome {
    Session(Arc<dyn RemoteSession>),
    SecondFactorRequired,
}

impl std::fmt::Debug for LoginOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoginOutcome::Session(_) => f.write_str("Session"),
            LoginOutcome::SecondFactorRequired => f.write_str("SecondFactorRequired"),
        }
    }
}

#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn authenticate(&self, credential: &Credential) -> Result<LoginOutcome, RemoteError>;
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn list_items(&self, scope: &Scope) -> BoxStream<'_, Result<RemoteItem, RemoteError>>;

    async fn list_libraries(&self) -> Result<Vec<String>, RemoteError>;

    /// User albums of a library, excluding [`ALL_PHOTOS`].
    async fn list_albums(&self, library: &str) -> Result<Vec<String>, RemoteError>;

    /// Direct children of an album. `album` may itself be a nested album,
    /// written as a `/`-separated path from the library.
    async fn list_subalbums(&self, _library: &str, _album: &str) -> Result<Vec<String>, RemoteError> {
        Ok(Vec::new())
    }

    async fn download(
        &self,
        item: &RemoteItem,
        variant: SizeVariant,
    ) -> Result<ByteStream, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(versions: BTreeMap<SizeVariant, Version>) -> RemoteItem {
        RemoteItem {
            id: "1".into(),
            name: "a.jpg".into(),
            kind: ItemKind::File,
            size: 10,
            modified: Utc::now(),
            created: None,
            versions,
            albums: Vec::new(),
        }
    }

    #[test]
    fn test_variant_size_drive_item_only_original() {
        let it = item(BTreeMap::new());
        assert_eq!(it.variant_size(SizeVariant::Original), Some(10));
        assert_eq!(it.variant_size(SizeVariant::Medium), None);
    }

    #[test]
    fn test_variant_size_photo_versions() {
        let mut v = BTreeMap::new();
        v.insert(
            SizeVariant::Medium,
            Version {
                size: 4,
                file_type: None,
            },
        );
        let it = item(v);
        assert_eq!(it.variant_size(SizeVariant::Medium), Some(4));
        assert_eq!(it.variant_size(SizeVariant::Original), None);
    }

    #[test]
    fn test_credential_debug_redacts_password() {
        let c = Credential {
            username: "u@example.com".into(),
            password: "hunter2".into(),
            region: Region::Global,
        };
        let s = format!("{:?}", c);
        assert!(!s.contains("hunter2"));
        assert!(s.contains("<redacted>"));
    }
}
