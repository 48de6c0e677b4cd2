//! Inclusion and exclusion decisions.
//!
//! Every rule set here is built once per cycle from configuration and then
//! only read, so all checks take `&self` and are safe to call from any
//! download worker without locking.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::remote::ALL_PHOTOS;
use crate::unicode::{nfc, nfc_path};

/// Compiled ignore globs, evaluated against paths relative to the sync root.
///
/// - `*.tmp` matches at any depth, `*` does not cross `/`
/// - `cache/` matches a directory named `cache` and everything below it
/// - `/build` only matches `build` directly under the root
#[derive(Debug, Clone)]
pub struct IgnoreSet {
    set: GlobSet,
    patterns: Vec<String>,
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self {
            set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }
}

impl IgnoreSet {
    /// Invalid patterns are logged and skipped; the rest still apply.
    pub fn new(patterns: &[String]) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut accepted = Vec::new();
        for pattern in patterns {
            let expanded = expand_ignore_pattern(pattern);
            if expanded.is_empty() {
                continue;
            }
            let globs: Result<Vec<_>, _> = expanded
                .iter()
                .map(|g| GlobBuilder::new(g).literal_separator(true).build())
                .collect();
            match globs {
                Ok(globs) => {
                    for g in globs {
                        builder.add(g);
                    }
                    accepted.push(pattern.clone());
                }
                Err(e) => tracing::warn!(pattern = %pattern, error = %e, "Ignoring invalid ignore pattern"),
            }
        }
        match builder.build() {
            Ok(set) => Self {
                set,
                patterns: accepted,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Could not compile ignore patterns, none will apply");
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_match(&self, relative_path: &Path) -> bool {
        !self.is_empty() && self.set.is_match(nfc_path(relative_path))
    }
}

fn expand_ignore_pattern(pattern: &str) -> Vec<String> {
    let trimmed = nfc(pattern.trim());
    let (anchored, body) = match trimmed.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, trimmed.as_str()),
    };
    let body = body.trim_end_matches('/');
    if body.is_empty() {
        return Vec::new();
    }
    let base = if anchored {
        body.to_string()
    } else {
        format!("**/{body}")
    };
    vec![format!("{base}/**"), base]
}

pub fn is_ignored(relative_path: &Path, ignore: &IgnoreSet) -> bool {
    ignore.is_match(relative_path)
}

/// Drive inclusion rules for one cycle.
#[derive(Debug, Clone, Default)]
pub struct DriveRules {
    folders: Vec<PathBuf>,
    extensions: Vec<String>,
    ignore: IgnoreSet,
}

impl DriveRules {
    pub fn new(folders: &[String], extensions: &[String], ignore: &[String]) -> Self {
        Self {
            folders: folders.iter().map(|f| normalize_rule_path(f)).collect(),
            extensions: extensions
                .iter()
                .map(|e| normalize_extension(e))
                .filter(|e| !e.is_empty())
                .collect(),
            ignore: IgnoreSet::new(ignore),
        }
    }

    pub fn folders(&self) -> &[PathBuf] {
        &self.folders
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn ignore(&self) -> &IgnoreSet {
        &self.ignore
    }
}

fn normalize_rule_path(rule: &str) -> PathBuf {
    nfc(rule.trim())
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

fn has_extension(name: &str, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let lower = name.to_lowercase();
    extensions.iter().any(|ext| {
        lower
            .strip_suffix(ext.as_str())
            .is_some_and(|stem| stem.ends_with('.'))
    })
}

/// A file passes when it is not ignored and, if an extension list exists,
/// its name ends in one of the listed extensions (case-insensitive).
pub fn is_wanted_file(relative_path: &Path, rules: &DriveRules) -> bool {
    if is_ignored(relative_path, &rules.ignore) {
        return false;
    }
    let name = relative_path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    has_extension(&name, &rules.extensions)
}

/// A folder passes when it is not ignored and lies on the way to, at, or
/// below one of the configured folders. `a/b` admits `a`, `a/b` and `a/b/c`.
pub fn is_wanted_folder(relative_path: &Path, rules: &DriveRules) -> bool {
    if is_ignored(relative_path, &rules.ignore) {
        return false;
    }
    if rules.folders.is_empty() {
        return true;
    }
    let path = nfc_path(relative_path);
    rules
        .folders
        .iter()
        .any(|rule| path.starts_with(rule) || rule.starts_with(&path))
}

/// Whether files directly inside `folder` may be synced: the folder must be
/// one of the configured folders or below one. Ancestors only lead the way.
pub fn is_wanted_parent_folder(folder: &Path, rules: &DriveRules) -> bool {
    if rules.folders.is_empty() {
        return true;
    }
    let path = nfc_path(folder);
    rules.folders.iter().any(|rule| path.starts_with(rule))
}

/// One album to materialize and the folder (relative to the photos
/// destination) it goes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumTarget {
    pub album: String,
    pub folder: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlbumPlan {
    pub targets: Vec<AlbumTarget>,
    /// Albums named in configuration that the library does not have.
    pub missing: Vec<String>,
}

/// Photo library and album rules for one cycle.
#[derive(Debug, Clone, Default)]
pub struct PhotoRules {
    pub libraries: Vec<String>,
    pub albums: Vec<String>,
    pub preserve_album_structure: bool,
    pub use_hardlinks: bool,
    extensions: Vec<String>,
}

impl PhotoRules {
    pub fn new(
        libraries: Vec<String>,
        albums: Vec<String>,
        preserve_album_structure: bool,
        use_hardlinks: bool,
        extensions: &[String],
    ) -> Self {
        Self {
            libraries,
            albums,
            preserve_album_structure,
            use_hardlinks,
            extensions: extensions
                .iter()
                .map(|e| normalize_extension(e))
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn is_wanted_library(&self, name: &str) -> bool {
        self.libraries.is_empty() || self.libraries.iter().any(|l| l == name)
    }

    /// With preserved structure the album list excludes; otherwise it includes.
    pub fn is_wanted_album(&self, name: &str) -> bool {
        let listed = self.albums.iter().any(|a| a == name);
        if self.preserve_album_structure {
            !listed
        } else {
            listed
        }
    }

    /// Sub-albums follow their parent. Only an exclusion list can drop one,
    /// by naming its full `parent/child` path.
    pub fn is_wanted_subalbum(&self, path: &str) -> bool {
        !(self.preserve_album_structure && self.albums.iter().any(|a| a == path))
    }

    pub fn is_wanted_photo(&self, filename: &str) -> bool {
        has_extension(filename, &self.extensions)
    }

    /// Decide which albums of a library to sync, in processing order.
    ///
    /// With preserved structure the all-photos pseudo-album is synced like
    /// any other album. When hard links are on it goes first so it becomes
    /// the primary copy every later album links to.
    pub fn plan_albums(&self, available: &[String]) -> AlbumPlan {
        let mut plan = AlbumPlan::default();

        if self.preserve_album_structure {
            let all_photos = self.is_wanted_album(ALL_PHOTOS).then(|| AlbumTarget {
                album: ALL_PHOTOS.to_string(),
                folder: ALL_PHOTOS.to_string(),
            });
            if self.use_hardlinks {
                plan.targets.extend(all_photos.clone());
            }
            for album in available {
                if album != ALL_PHOTOS && self.is_wanted_album(album) {
                    plan.targets.push(AlbumTarget {
                        album: album.clone(),
                        folder: album.clone(),
                    });
                }
            }
            if !self.use_hardlinks {
                plan.targets.extend(all_photos);
            }
        } else if !self.albums.is_empty() {
            for album in &self.albums {
                if album == ALL_PHOTOS || available.contains(album) {
                    plan.targets.push(AlbumTarget {
                        album: album.clone(),
                        folder: album.clone(),
                    });
                } else {
                    plan.missing.push(album.clone());
                }
            }
        } else {
            plan.targets.push(AlbumTarget {
                album: ALL_PHOTOS.to_string(),
                folder: "all".to_string(),
            });
        }

        plan
    }
}
