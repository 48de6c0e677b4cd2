use thiserror::Error;

use crate::remote::RemoteError;
use crate::stats::ErrorClass;

/// Typed download errors enabling retry classification.
///
/// `is_retryable()` separates transient remote failures from permanent ones
/// (missing items, disk failures, broken archives) so the retry loop can
/// give up early.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Remote error for {path}: {source}")]
    Remote {
        path: String,
        #[source]
        source: RemoteError,
    },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("Cannot expand package {path}: {reason}")]
    Extraction { path: String, reason: String },

    #[error("Archive entry escapes the package directory: {0}")]
    UnsafeEntry(String),

    #[error("Giving up on {path} after {retries} retries: {last}")]
    RetriesExhausted {
        retries: u32,
        path: String,
        last: Box<DownloadError>,
    },
}

impl DownloadError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Remote { source, .. } => source.is_retryable(),
            DownloadError::Disk(_)
            | DownloadError::Extraction { .. }
            | DownloadError::UnsafeEntry(_)
            | DownloadError::RetriesExhausted { .. } => false,
        }
    }

    /// The session is gone; the whole cycle must re-authenticate.
    pub fn is_auth_required(&self) -> bool {
        match self {
            DownloadError::Remote { source, .. } => source.is_auth_required(),
            DownloadError::RetriesExhausted { last, .. } => last.is_auth_required(),
            _ => false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DownloadError::Remote { source, .. } if source.is_auth_required() => {
                ErrorClass::Authentication
            }
            DownloadError::Remote { .. } => ErrorClass::Network,
            DownloadError::Disk(_) => ErrorClass::Filesystem,
            DownloadError::Extraction { .. } | DownloadError::UnsafeEntry(_) => {
                ErrorClass::Extraction
            }
            DownloadError::RetriesExhausted { last, .. } => last.class(),
        }
    }
}
