//! Cross-album deduplication through filesystem hard links.
//!
//! The first album that materializes a photo rendition owns the primary
//! copy. Later albums that need the same rendition link to it instead of
//! downloading it again.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum LinkResult {
    /// `target` now shares the primary's inode; carries the primary path.
    Linked(PathBuf),
    NoPriorCopy,
    LinkFailed(io::Error),
}

#[derive(Debug, Default)]
pub struct HardlinkRegistry {
    primaries: Mutex<HashMap<String, PathBuf>>,
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    entries: BTreeMap<String, PathBuf>,
}

impl HardlinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a saved registry, dropping entries whose file is gone.
    /// A missing file yields an empty registry.
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e),
        };
        let file: RegistryFile = serde_json::from_str(&text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let total = file.entries.len();
        let primaries: HashMap<String, PathBuf> = file
            .entries
            .into_iter()
            .filter(|(_, p)| p.is_file())
            .collect();
        if primaries.len() < total {
            tracing::debug!(
                dropped = total - primaries.len(),
                "Dropped hard-link registry entries whose primary no longer exists"
            );
        }
        Ok(Self {
            primaries: Mutex::new(primaries),
        })
    }

    /// Write the registry atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let entries: BTreeMap<String, PathBuf> = self
            .primaries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let json = serde_json::to_string_pretty(&RegistryFile { entries })
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.part");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }

    pub fn len(&self) -> usize {
        self.primaries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn primary(&self, identity: &str) -> Option<PathBuf> {
        self.primaries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(identity)
            .cloned()
    }

    /// Record the first materialization of `identity`. Later calls for the
    /// same identity keep the existing primary.
    pub fn register(&self, identity: &str, canonical: &Path) {
        self.primaries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(identity.to_string())
            .or_insert_with(|| canonical.to_path_buf());
    }

    /// Link `target` to the primary copy of `identity`, if there is one.
    pub fn try_link(&self, identity: &str, target: &Path) -> LinkResult {
        let Some(primary) = self.primary(identity) else {
            return LinkResult::NoPriorCopy;
        };
        if primary == target {
            return LinkResult::NoPriorCopy;
        }
        if !primary.is_file() {
            tracing::debug!(
                identity,
                primary = %primary.display(),
                "Primary copy vanished, forgetting it"
            );
            let mut primaries = self.primaries.lock().unwrap_or_else(|p| p.into_inner());
            if primaries.get(identity) == Some(&primary) {
                primaries.remove(identity);
            }
            return LinkResult::NoPriorCopy;
        }

        match link_replacing(&primary, target) {
            Ok(()) => LinkResult::Linked(primary),
            Err(e) => LinkResult::LinkFailed(e),
        }
    }
}

fn link_replacing(primary: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a directory", target.display()),
            ))
        }
        Ok(_) => fs::remove_file(target)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::hard_link(primary, target)
}
