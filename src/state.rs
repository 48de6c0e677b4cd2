//! Per-cycle bookkeeping shared by download workers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::unicode::nfc_path;

/// Relative paths confirmed present during the current cycle.
///
/// Paths are stored in NFC form together with every ancestor directory, so a
/// directory is a member exactly when something below it was synced. This is
/// the baseline the cleanup pass reconciles against.
#[derive(Debug, Default)]
pub struct SyncedPathSet {
    paths: Mutex<HashSet<PathBuf>>,
}

impl SyncedPathSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, relative: &Path) {
        let normalized = nfc_path(relative);
        let mut ancestors: Vec<PathBuf> = normalized
            .ancestors()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .collect();
        let mut paths = self.paths.lock().unwrap_or_else(|p| p.into_inner());
        for path in ancestors.drain(..) {
            if !paths.insert(path) {
                // Ancestors of an existing member are members already.
                break;
            }
        }
    }

    pub fn contains(&self, relative: &Path) -> bool {
        let normalized = nfc_path(relative);
        self.paths
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&normalized)
    }

    pub fn len(&self) -> usize {
        self.paths.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<PathBuf> {
        let mut all: Vec<PathBuf> = self
            .paths
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect();
        all.sort();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_insert_records_ancestors() {
        let set = SyncedPathSet::new();
        set.insert(Path::new("a/b/c.txt"));
        assert!(set.contains(Path::new("a")));
        assert!(set.contains(Path::new("a/b")));
        assert!(set.contains(Path::new("a/b/c.txt")));
        assert!(!set.contains(Path::new("a/c")));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_insert_sibling_after_parent_known() {
        let set = SyncedPathSet::new();
        set.insert(Path::new("a/b/one"));
        set.insert(Path::new("a/b/two"));
        assert_eq!(
            set.snapshot(),
            vec![
                PathBuf::from("a"),
                PathBuf::from("a/b"),
                PathBuf::from("a/b/one"),
                PathBuf::from("a/b/two"),
            ]
        );
    }

    #[test]
    fn test_contains_ignores_normalization_form() {
        let set = SyncedPathSet::new();
        set.insert(Path::new("caf\u{e9}.txt"));
        assert!(set.contains(Path::new("cafe\u{301}.txt")));
    }

    #[test]
    fn test_concurrent_inserts() {
        let set = Arc::new(SyncedPathSet::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let set = Arc::clone(&set);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        set.insert(&PathBuf::from(format!("d{t}/f{i}")));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(set.len(), 8 * 50 + 8);
    }
}
