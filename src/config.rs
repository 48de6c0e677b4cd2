//! YAML configuration, re-read every scheduler iteration.
//!
//! Parsing happens in two steps. [`ConfigDoc`] holds the raw YAML tree and
//! answers key-path lookups that keep "absent" apart from falsy values.
//! [`Config::from_doc`] turns it into typed settings. Bad values fall back to
//! their defaults with a warning instead of failing the whole load.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_yaml::Value;
use thiserror::Error;

use crate::auth::RetryPolicy;
use crate::filter::{DriveRules, PhotoRules};
use crate::scheduler::Interval;
use crate::stats::SummaryPolicy;
use crate::types::{Region, SizeVariant};

const DEFAULT_ROOT: &str = "./icloud";
const DEFAULT_SYNC_INTERVAL: i64 = 1800;
const DEFAULT_RETRY_LOGIN_INTERVAL: i64 = 600;
const AUTO_THREADS_CEILING: usize = 8;
const MAX_THREADS: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML in {path}: {source}")]
    Syntax {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid value at `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

/// Raw configuration tree.
#[derive(Debug, Clone, Default)]
pub struct ConfigDoc(Value);

impl ConfigDoc {
    /// An empty document has no keys.
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        let value: Value = serde_yaml::from_str(text)?;
        Ok(Self(value))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Syntax {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Walk a key path. Missing keys and YAML `null` are both absent;
    /// `false`, `0` and `""` are present.
    pub fn lookup(&self, path: &[&str]) -> Option<&Value> {
        let mut node = &self.0;
        for key in path {
            node = node.as_mapping()?.get(*key)?;
        }
        (!node.is_null()).then_some(node)
    }

    /// Deserialize the node at `path`. Absent is `Ok(None)`.
    pub fn get<T: DeserializeOwned>(&self, path: &[&str]) -> Result<Option<T>, ConfigError> {
        let Some(node) = self.lookup(path) else {
            return Ok(None);
        };
        serde_yaml::from_value(node.clone())
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key: path.join("."),
                reason: e.to_string(),
            })
    }

    /// Like [`get`](Self::get), but a bad value is logged and replaced by
    /// `default`.
    fn get_or<T: DeserializeOwned>(&self, path: &[&str], default: T) -> T {
        match self.get(path) {
            Ok(Some(v)) => v,
            Ok(None) => default,
            Err(e) => {
                tracing::warn!(error = %e, "Using default");
                default
            }
        }
    }

    /// Present and a mapping. A section with any other shape is reported and
    /// treated as disabled.
    fn section(&self, key: &str) -> bool {
        match self.lookup(&[key]) {
            None => false,
            Some(Value::Mapping(_)) => true,
            Some(_) => {
                tracing::warn!(section = key, "Section is not a mapping, disabling it");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub root: PathBuf,
    pub region: Region,
    pub max_threads: usize,
    pub username: Option<String>,
    pub retry_login_interval: i64,
    pub summary: SummaryPolicy,
}

#[derive(Debug, Clone)]
pub struct DriveConfig {
    /// Relative to `app.root` unless absolute.
    pub destination: PathBuf,
    pub sync_interval: i64,
    pub remove_obsolete: bool,
    pub rules: DriveRules,
}

#[derive(Debug, Clone)]
pub struct PhotosConfig {
    pub destination: PathBuf,
    pub sync_interval: i64,
    pub remove_obsolete: bool,
    pub persist_hardlinks: bool,
    pub folder_format: Option<String>,
    pub file_sizes: Vec<SizeVariant>,
    pub rules: PhotoRules,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub drive: Option<DriveConfig>,
    pub photos: Option<PhotosConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::from_doc(&ConfigDoc::load(path)?))
    }

    pub fn from_doc(doc: &ConfigDoc) -> Self {
        let app = AppConfig {
            root: expand_tilde(&doc.get_or(&["app", "root"], DEFAULT_ROOT.to_string())),
            region: doc.get_or(&["app", "region"], Region::Global),
            max_threads: max_threads(doc),
            username: doc
                .get_or::<Option<String>>(&["app", "credentials", "username"], None)
                .filter(|u| !u.trim().is_empty()),
            retry_login_interval: doc.get_or(
                &["app", "credentials", "retry_login_interval"],
                DEFAULT_RETRY_LOGIN_INTERVAL,
            ),
            summary: summary_policy(doc),
        };

        let drive = doc.section("drive").then(|| DriveConfig {
            destination: expand_tilde(&doc.get_or(&["drive", "destination"], "drive".to_string())),
            sync_interval: doc.get_or(&["drive", "sync_interval"], DEFAULT_SYNC_INTERVAL),
            remove_obsolete: doc.get_or(&["drive", "remove_obsolete"], false),
            rules: DriveRules::new(
                &string_list(doc, &["drive", "filters", "folders"]),
                &string_list(doc, &["drive", "filters", "file_extensions"]),
                &string_list(doc, &["drive", "ignore"]),
            ),
        });

        let photos = doc.section("photos").then(|| PhotosConfig {
            destination: expand_tilde(
                &doc.get_or(&["photos", "destination"], "photos".to_string()),
            ),
            sync_interval: doc.get_or(&["photos", "sync_interval"], DEFAULT_SYNC_INTERVAL),
            remove_obsolete: doc.get_or(&["photos", "remove_obsolete"], false),
            persist_hardlinks: doc.get_or(&["photos", "persist_hardlinks"], false),
            folder_format: doc
                .get_or::<Option<String>>(&["photos", "folder_format"], None)
                .filter(|f| !f.is_empty()),
            file_sizes: file_sizes(doc),
            rules: PhotoRules::new(
                string_list(doc, &["photos", "filters", "libraries"]),
                string_list(doc, &["photos", "filters", "albums"]),
                doc.get_or(&["photos", "all_albums"], false),
                doc.get_or(&["photos", "use_hardlinks"], false),
                &string_list(doc, &["photos", "filters", "extensions"]),
            ),
        });

        Self { app, drive, photos }
    }

    pub fn has_resources(&self) -> bool {
        self.drive.is_some() || self.photos.is_some()
    }

    pub fn drive_interval(&self) -> Option<Interval> {
        self.drive
            .as_ref()
            .map(|d| Interval::from_secs(d.sync_interval))
    }

    pub fn photos_interval(&self) -> Option<Interval> {
        self.photos
            .as_ref()
            .map(|p| Interval::from_secs(p.sync_interval))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_secs(self.app.retry_login_interval)
    }

    /// Absolute destination for a resource's `destination` setting.
    pub fn destination(&self, relative: &Path) -> PathBuf {
        self.app.root.join(relative)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "root:          {}", self.app.root.display())?;
        writeln!(f, "region:        {}", self.app.region.as_str())?;
        writeln!(f, "max threads:   {}", self.app.max_threads)?;
        writeln!(
            f,
            "username:      {}",
            self.app.username.as_deref().unwrap_or("(not set)")
        )?;
        writeln!(f, "login retry:   {:?}", self.retry_policy())?;
        match &self.drive {
            Some(d) => {
                writeln!(f, "drive:")?;
                writeln!(f, "  destination: {}", self.destination(&d.destination).display())?;
                writeln!(f, "  interval:    {:?}", Interval::from_secs(d.sync_interval))?;
                writeln!(f, "  remove obsolete: {}", d.remove_obsolete)?;
                writeln!(f, "  folders:     {:?}", d.rules.folders())?;
                writeln!(f, "  extensions:  {:?}", d.rules.extensions())?;
                writeln!(f, "  ignore:      {:?}", d.rules.ignore().patterns())?;
            }
            None => writeln!(f, "drive:         (disabled)")?,
        }
        match &self.photos {
            Some(p) => {
                writeln!(f, "photos:")?;
                writeln!(f, "  destination: {}", self.destination(&p.destination).display())?;
                writeln!(f, "  interval:    {:?}", Interval::from_secs(p.sync_interval))?;
                writeln!(f, "  remove obsolete: {}", p.remove_obsolete)?;
                writeln!(f, "  all albums:  {}", p.rules.preserve_album_structure)?;
                writeln!(f, "  hard links:  {} (persist: {})", p.rules.use_hardlinks, p.persist_hardlinks)?;
                writeln!(f, "  libraries:   {:?}", p.rules.libraries)?;
                writeln!(f, "  albums:      {:?}", p.rules.albums)?;
                let sizes: Vec<&str> = p.file_sizes.iter().map(|s| s.as_str()).collect();
                writeln!(f, "  sizes:       {:?}", sizes)?;
                if let Some(format) = &p.folder_format {
                    writeln!(f, "  folder format: {format}")?;
                }
            }
            None => writeln!(f, "photos:        (disabled)")?,
        }
        Ok(())
    }
}

/// A list of strings; a single string counts as a one-element list.
fn string_list(doc: &ConfigDoc, path: &[&str]) -> Vec<String> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    match doc.get_or::<Option<OneOrMany>>(path, None) {
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
        None => Vec::new(),
    }
}

fn max_threads(doc: &ConfigDoc) -> usize {
    let auto = || {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(AUTO_THREADS_CEILING)
    };
    match doc.lookup(&["app", "max_threads"]) {
        None => auto(),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("auto") => auto(),
        Some(Value::Number(n)) if n.as_i64().is_some() => {
            let n = n.as_i64().unwrap_or(1).clamp(1, MAX_THREADS as i64);
            n as usize
        }
        Some(other) => {
            tracing::warn!(key = "app.max_threads", value = ?other, "Expected `auto` or an integer, using auto");
            auto()
        }
    }
}

fn summary_policy(doc: &ConfigDoc) -> SummaryPolicy {
    let base = ["app", "notifications", "sync_summary"];
    let key = |k: &'static str| [base[0], base[1], base[2], k];
    let defaults = SummaryPolicy::default();
    SummaryPolicy {
        enabled: doc.get_or(&key("enabled"), defaults.enabled),
        on_success: doc.get_or(&key("on_success"), defaults.on_success),
        on_error: doc.get_or(&key("on_error"), defaults.on_error),
        min_downloads: doc.get_or(&key("min_downloads"), defaults.min_downloads),
    }
}

fn file_sizes(doc: &ConfigDoc) -> Vec<SizeVariant> {
    let path = ["photos", "filters", "file_sizes"];
    let raw = string_list(doc, &path);
    if raw.is_empty() {
        return vec![SizeVariant::Original];
    }
    let mut sizes = Vec::new();
    for name in &raw {
        match SizeVariant::parse(name.trim()) {
            Some(v) if !sizes.contains(&v) => sizes.push(v),
            Some(_) => {}
            None => tracing::warn!(key = "photos.filters.file_sizes", value = %name, "Unknown file size, skipping"),
        }
    }
    if sizes.is_empty() {
        tracing::warn!("No valid file sizes configured, using original");
        sizes.push(SizeVariant::Original);
    }
    sizes
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(yaml: &str) -> ConfigDoc {
        ConfigDoc::parse(yaml).unwrap()
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let result = expand_tilde("~/Documents");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("Documents"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(expand_tilde("/absolute/path"), PathBuf::from("/absolute/path"));
        assert_eq!(expand_tilde("relative/path"), PathBuf::from("relative/path"));
    }

    #[test]
    fn test_lookup_distinguishes_absent_from_falsy() {
        let d = doc("drive:\n  remove_obsolete: false\n  sync_interval: 0\n  destination: ''\n  ignore: ~\n");
        assert!(d.lookup(&["drive", "remove_obsolete"]).is_some());
        assert!(d.lookup(&["drive", "sync_interval"]).is_some());
        assert!(d.lookup(&["drive", "destination"]).is_some());
        assert!(d.lookup(&["drive", "ignore"]).is_none());
        assert!(d.lookup(&["drive", "missing"]).is_none());
        assert!(d.lookup(&["photos", "anything"]).is_none());
        assert_eq!(d.get::<bool>(&["drive", "remove_obsolete"]).unwrap(), Some(false));
        assert_eq!(d.get::<i64>(&["drive", "sync_interval"]).unwrap(), Some(0));
    }

    #[test]
    fn test_get_type_mismatch_names_key_path() {
        let d = doc("app:\n  credentials:\n    retry_login_interval: soon\n");
        let err = d
            .get::<i64>(&["app", "credentials", "retry_login_interval"])
            .unwrap_err();
        assert!(err.to_string().contains("app.credentials.retry_login_interval"));
    }

    #[test]
    fn test_defaults_for_empty_document() {
        let c = Config::from_doc(&doc(""));
        assert_eq!(c.app.root, PathBuf::from("./icloud"));
        assert_eq!(c.app.region, Region::Global);
        assert_eq!(c.app.retry_login_interval, 600);
        assert!(c.app.username.is_none());
        assert!(!c.app.summary.enabled);
        assert!((1..=8).contains(&c.app.max_threads));
        assert!(!c.has_resources());
    }

    #[test]
    fn test_sections_with_defaults() {
        let c = Config::from_doc(&doc("drive: {}\nphotos: {}\n"));
        let d = c.drive.as_ref().unwrap();
        assert_eq!(d.destination, PathBuf::from("drive"));
        assert_eq!(d.sync_interval, 1800);
        assert!(!d.remove_obsolete);
        let p = c.photos.as_ref().unwrap();
        assert_eq!(p.destination, PathBuf::from("photos"));
        assert_eq!(p.file_sizes, vec![SizeVariant::Original]);
        assert!(p.folder_format.is_none());
        assert_eq!(c.drive_interval(), Some(Interval::Every(std::time::Duration::from_secs(1800))));
    }

    #[test]
    fn test_full_document() {
        let c = Config::from_doc(&doc(r#"
app:
  root: /data/icloud
  region: china
  max_threads: 40
  credentials:
    username: me@example.com
    retry_login_interval: -1
  notifications:
    sync_summary:
      enabled: true
      on_success: false
      min_downloads: 5
drive:
  destination: docs
  sync_interval: -1
  remove_obsolete: true
  ignore: ["*.tmp", "cache/"]
  filters:
    folders: [Work/Reports]
    file_extensions: [pdf]
photos:
  sync_interval: 300
  all_albums: true
  use_hardlinks: true
  persist_hardlinks: true
  folder_format: "%Y/%m"
  filters:
    libraries: [PrimarySync]
    albums: [Hidden]
    file_sizes: [original, medium, bogus, medium]
"#));
        assert_eq!(c.app.root, PathBuf::from("/data/icloud"));
        assert_eq!(c.app.region, Region::China);
        assert_eq!(c.app.max_threads, 16);
        assert_eq!(c.app.username.as_deref(), Some("me@example.com"));
        assert_eq!(c.retry_policy(), RetryPolicy::Once);
        assert!(c.app.summary.enabled);
        assert!(!c.app.summary.on_success);
        assert!(c.app.summary.on_error);
        assert_eq!(c.app.summary.min_downloads, 5);

        let d = c.drive.as_ref().unwrap();
        assert_eq!(c.drive_interval(), Some(Interval::Once));
        assert!(d.remove_obsolete);
        assert_eq!(d.rules.folders(), &[PathBuf::from("Work/Reports")]);
        assert_eq!(d.rules.ignore().patterns().len(), 2);
        assert_eq!(c.destination(&d.destination), PathBuf::from("/data/icloud/docs"));

        let p = c.photos.as_ref().unwrap();
        assert!(p.rules.preserve_album_structure);
        assert!(p.rules.use_hardlinks);
        assert!(p.persist_hardlinks);
        assert_eq!(p.folder_format.as_deref(), Some("%Y/%m"));
        assert_eq!(p.file_sizes, vec![SizeVariant::Original, SizeVariant::Medium]);
        assert_eq!(p.rules.libraries, vec!["PrimarySync".to_string()]);
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let c = Config::from_doc(&doc(r#"
app:
  max_threads: lots
  region: mars
drive:
  sync_interval: often
  remove_obsolete: maybe
photos:
  filters:
    file_sizes: [huge]
"#));
        assert!((1..=8).contains(&c.app.max_threads));
        assert_eq!(c.app.region, Region::Global);
        let d = c.drive.unwrap();
        assert_eq!(d.sync_interval, 1800);
        assert!(!d.remove_obsolete);
        assert_eq!(c.photos.unwrap().file_sizes, vec![SizeVariant::Original]);
    }

    #[test]
    fn test_non_mapping_section_disables_resource() {
        let c = Config::from_doc(&doc("drive: yes\nphotos:\n"));
        assert!(c.drive.is_none());
        assert!(c.photos.is_none());
    }

    #[test]
    fn test_max_threads_clamped_low() {
        let c = Config::from_doc(&doc("app:\n  max_threads: 0\n"));
        assert_eq!(c.app.max_threads, 1);
        let c = Config::from_doc(&doc("app:\n  max_threads: auto\n"));
        assert!((1..=8).contains(&c.app.max_threads));
    }

    #[test]
    fn test_single_string_accepted_as_list() {
        let c = Config::from_doc(&doc("drive:\n  ignore: '*.bak'\n"));
        assert_eq!(c.drive.unwrap().rules.ignore().patterns(), &["*.bak".to_string()]);
    }

    #[test]
    fn test_load_reports_missing_file_and_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(Config::load(&missing), Err(ConfigError::Read { .. })));
        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "drive: [unclosed").unwrap();
        assert!(matches!(Config::load(&bad), Err(ConfigError::Syntax { .. })));
    }
}
