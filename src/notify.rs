//! Outbound notifications.
//!
//! The loop decides *whether* to notify; a [`Notifier`] only delivers.
//! Chat, mail and webhook senders plug in behind the trait. The built-in
//! [`LogNotifier`] writes everything to the log.

use async_trait::async_trait;

use crate::stats::{format_bytes, format_duration, SyncSummary};

/// Out-of-band message for the operator. One is emitted per episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAlert {
    SecondFactorRequired { username: String },
    NoCredential { username: String },
}

impl AuthAlert {
    pub fn message(&self) -> String {
        match self {
            AuthAlert::SecondFactorRequired { username } => format!(
                "Two-factor authentication is required for {username}. \
                 Approve the sign-in on a trusted device; the login will be retried."
            ),
            AuthAlert::NoCredential { username } if username.is_empty() => {
                "No username configured under app.credentials.username".to_string()
            }
            AuthAlert::NoCredential { username } => format!(
                "No password stored for {username}. Run `store-password` or set ENV_ICLOUD_PASSWORD."
            ),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Called after every cycle. Implementations should deliver only when
    /// `summary.should_notify` is set.
    async fn send_summary(&self, summary: &SyncSummary);

    async fn send_alert(&self, alert: &AuthAlert);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_summary(&self, summary: &SyncSummary) {
        if !summary.should_notify {
            return;
        }
        let stats = &summary.stats;
        tracing::info!(
            resource = %stats.resource,
            downloaded = stats.downloaded,
            hardlinked = stats.hardlinked,
            errors = stats.errors.len(),
            "Sync summary: {} new ({}), {} skipped, {} removed in {}",
            stats.downloaded + stats.hardlinked,
            format_bytes(stats.bytes_downloaded),
            stats.skipped,
            stats.removed,
            format_duration(stats.duration),
        );
        if let Some(next) = summary.next_drive_in {
            tracing::info!("  next drive sync in {}", format_duration(next));
        }
        if let Some(next) = summary.next_photos_in {
            tracing::info!("  next photos sync in {}", format_duration(next));
        }
        match serde_json::to_string(summary) {
            Ok(json) => tracing::debug!(payload = %json, "Summary payload"),
            Err(e) => tracing::debug!(error = %e, "Could not serialize summary"),
        }
    }

    async fn send_alert(&self, alert: &AuthAlert) {
        tracing::warn!("{}", alert.message());
    }
}
