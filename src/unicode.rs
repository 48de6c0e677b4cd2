//! Unicode normalization for names and relative paths.
//!
//! The remote reports names in composed form (NFC) while some local
//! filesystems store them decomposed (NFD). Everything the sync core
//! compares goes through [`nfc`] first.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use unicode_normalization::{is_nfc, UnicodeNormalization};

pub fn nfc(s: &str) -> String {
    if is_nfc(s) {
        s.to_string()
    } else {
        s.nfc().collect()
    }
}

pub fn nfd(s: &str) -> String {
    s.nfd().collect()
}

pub fn nfc_os(s: &OsStr) -> String {
    nfc(&s.to_string_lossy())
}

/// NFC form of a relative path, with `.` components dropped.
pub fn nfc_path(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::CurDir => None,
            Component::Normal(s) => Some(PathBuf::from(nfc_os(s))),
            other => Some(PathBuf::from(other.as_os_str())),
        })
        .collect()
}
