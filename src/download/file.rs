use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::DownloadError;
use crate::remote::{RemoteItem, RemoteSession};
use crate::retry::{self, RetryAction, RetryConfig};
use crate::types::SizeVariant;

/// Hidden `.part` file next to `dest`, named after the item identity and
/// rendition so concurrent downloads never share a temp file.
pub(crate) fn temp_download_path(dest: &Path, item_id: &str, variant: SizeVariant) -> PathBuf {
    let digest = Sha256::new()
        .chain_update(item_id.as_bytes())
        .chain_update([0u8])
        .chain_update(variant.as_str().as_bytes())
        .finalize();
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".{}.part", URL_SAFE_NO_PAD.encode(&digest[..18])))
}

/// Stream one rendition into `part_path`, retrying transient failures with
/// backoff. Every attempt starts from an empty file. Returns the byte count.
pub async fn fetch_to_part(
    session: &dyn RemoteSession,
    item: &RemoteItem,
    variant: SizeVariant,
    part_path: &Path,
    retry_config: &RetryConfig,
) -> Result<u64, DownloadError> {
    let result = retry::retry_with_backoff(
        retry_config,
        &item.name,
        |e: &DownloadError| {
            if e.is_retryable() {
                RetryAction::Retry
            } else {
                RetryAction::Abort
            }
        },
        || async {
            discard(part_path).await;
            attempt_download(session, item, variant, part_path).await
        },
    )
    .await;

    result.map_err(|e| {
        if e.is_retryable() {
            DownloadError::RetriesExhausted {
                retries: retry_config.max_retries,
                path: item.name.clone(),
                last: Box::new(e),
            }
        } else {
            e
        }
    })
}

async fn attempt_download(
    session: &dyn RemoteSession,
    item: &RemoteItem,
    variant: SizeVariant,
    part_path: &Path,
) -> Result<u64, DownloadError> {
    let remote_err = |source| DownloadError::Remote {
        path: item.name.clone(),
        source,
    };
    let mut stream = session.download(item, variant).await.map_err(remote_err)?;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part_path)
        .await?;

    let mut bytes_written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            tracing::debug!(
                item = %item.name,
                bytes_so_far = bytes_written,
                error = %e,
                "Stream broke off"
            );
            remote_err(e)
        })?;
        file.write_all(&chunk).await?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(bytes_written)
}

/// Remove a leftover temp file. A file that is already gone is fine.
pub(crate) async fn discard(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::debug!(path = %path.display(), error = %e, "Could not remove temp file"),
    }
}

/// Move a finished `.part` file into place. A directory left where the file
/// belongs (an item that used to be a package) is removed first.
pub async fn commit(part_path: &Path, dest: &Path) -> Result<(), DownloadError> {
    if fs::symlink_metadata(dest).await.is_ok_and(|m| m.is_dir()) {
        fs::remove_dir_all(dest).await?;
    }
    fs::rename(part_path, dest).await?;
    Ok(())
}

/// Set the modification and access times of a file or directory to the
/// given Unix timestamp. Negative timestamps are clamped to the epoch.
pub(crate) fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(timestamp.unsigned_abs()))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    };
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = if std::fs::metadata(path)?.is_dir() {
        std::fs::File::open(path)?
    } else {
        std::fs::File::options().write(true).open(path)?
    };
    file.set_times(times)
}
