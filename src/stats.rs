//! Per-cycle counters and the summary handed to notifiers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Network,
    Filesystem,
    Extraction,
    Authentication,
    Listing,
    Cleanup,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Network => "network",
            ErrorClass::Filesystem => "filesystem",
            ErrorClass::Extraction => "extraction",
            ErrorClass::Authentication => "authentication",
            ErrorClass::Listing => "listing",
            ErrorClass::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// One failed item: what it was, what kind of failure, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub item: String,
    pub class: ErrorClass,
    pub reason: String,
}

impl ItemError {
    pub fn new(item: impl Into<String>, class: ErrorClass, reason: impl ToString) -> Self {
        Self {
            item: item.into(),
            class,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleStats {
    pub resource: Resource,
    pub started_at: DateTime<Utc>,
    pub downloaded: u64,
    pub bytes_downloaded: u64,
    pub skipped: u64,
    pub removed: u64,
    pub hardlinked: u64,
    pub bytes_saved: u64,
    pub albums_synced: Vec<String>,
    pub errors: Vec<ItemError>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// False when some listing failed; cleanup is skipped for such cycles.
    pub listing_complete: bool,
}

impl CycleStats {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            started_at: Utc::now(),
            downloaded: 0,
            bytes_downloaded: 0,
            skipped: 0,
            removed: 0,
            hardlinked: 0,
            bytes_saved: 0,
            albums_synced: Vec::new(),
            errors: Vec::new(),
            duration: Duration::ZERO,
            listing_complete: true,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_activity(&self) -> bool {
        self.downloaded > 0 || self.hardlinked > 0 || self.removed > 0 || self.has_errors()
    }

    /// Fold a download batch into this cycle's totals.
    pub fn merge(&mut self, other: CycleStats) {
        self.downloaded += other.downloaded;
        self.bytes_downloaded += other.bytes_downloaded;
        self.skipped += other.skipped;
        self.removed += other.removed;
        self.hardlinked += other.hardlinked;
        self.bytes_saved += other.bytes_saved;
        self.errors.extend(other.errors);
        self.listing_complete &= other.listing_complete;
    }

    pub fn record_error(&mut self, error: ItemError) {
        self.errors.push(error);
    }

    pub fn finish(&mut self, elapsed: Duration) {
        self.duration = elapsed;
    }

    pub fn log_summary(&self) {
        tracing::info!("── {} Summary ──", self.resource);
        tracing::info!(
            "  {} downloaded ({}), {} skipped, {} removed",
            self.downloaded,
            format_bytes(self.bytes_downloaded),
            self.skipped,
            self.removed
        );
        if self.hardlinked > 0 {
            tracing::info!(
                "  {} hard-linked, {} saved",
                self.hardlinked,
                format_bytes(self.bytes_saved)
            );
        }
        if !self.albums_synced.is_empty() {
            tracing::info!("  albums: {}", self.albums_synced.join(", "));
        }
        if self.has_errors() {
            tracing::warn!("  {} errors", self.errors.len());
            for e in &self.errors {
                tracing::warn!("    [{}] {}: {}", e.class, e.item, e.reason);
            }
        }
        if !self.listing_complete {
            tracing::warn!("  listing incomplete, obsolete files were kept");
        }
        tracing::info!("  elapsed: {}", format_duration(self.duration));
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub mod option {
        use serde::Serializer;
        use std::time::Duration;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&d.as_secs()),
                None => s.serialize_none(),
            }
        }
    }
}

/// When a finished cycle should be pushed to the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryPolicy {
    pub enabled: bool,
    pub on_success: bool,
    pub on_error: bool,
    pub min_downloads: u64,
}

impl Default for SummaryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            on_success: true,
            on_error: true,
            min_downloads: 1,
        }
    }
}

impl SummaryPolicy {
    /// Downloads and hard links both count toward `min_downloads`.
    pub fn should_notify(&self, stats: &CycleStats) -> bool {
        if !self.enabled {
            return false;
        }
        let trigger = if stats.has_errors() {
            self.on_error
        } else {
            self.on_success
        };
        trigger && stats.downloaded + stats.hardlinked >= self.min_downloads
    }
}

/// What the notifier receives after a resource finishes a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub stats: CycleStats,
    /// Time until each resource's next sync, if it is scheduled again.
    #[serde(with = "duration_secs::option")]
    pub next_drive_in: Option<Duration>,
    #[serde(with = "duration_secs::option")]
    pub next_photos_in: Option<Duration>,
    pub should_notify: bool,
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
