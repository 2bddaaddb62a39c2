//! File system helpers shared by the endpoints and the auth challenge
//!
//! Files arriving through the watcher are frequently still being written.
//! These helpers poll until the file can be opened, giving up only when the
//! file disappears or the cancellation token fires.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tokio::fs::{self, OpenOptions};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{SyncError, SyncResult};

/// Sleep for `duration` unless cancelled first
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> SyncResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Read a whole file, retrying while it cannot be opened.
///
/// Returns `Ok(None)` if the file vanished before it could be read.
pub async fn read_when_ready(
    path: &Path,
    retry_interval: Duration,
    cancel: &CancellationToken,
) -> SyncResult<Option<Vec<u8>>> {
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        match fs::read(path).await {
            Ok(bytes) => return Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                if !is_plain_file(path).await {
                    return Ok(None);
                }
                trace!(path = %path.display(), error = %err, "File is locked, waiting");
                sleep_or_cancel(retry_interval, cancel).await?;
            }
        }
    }
}

/// Wait until `path` can be opened for writing by us.
///
/// Returns `Ok(false)` if the path does not exist (nothing to wait for).
pub async fn wait_until_writable(
    path: &Path,
    retry_interval: Duration,
    cancel: &CancellationToken,
) -> SyncResult<bool> {
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        match OpenOptions::new().write(true).open(path).await {
            Ok(_) => return Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                if !is_plain_file(path).await {
                    return Ok(false);
                }
                trace!(path = %path.display(), error = %err, "File is held by a writer, waiting");
                sleep_or_cancel(retry_interval, cancel).await?;
            }
        }
    }
}

/// Whether anything (file or directory) exists at `path`
pub async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Whether `path` exists and is not a directory
async fn is_plain_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| !meta.is_dir())
        .unwrap_or(false)
}

/// Whether `path` is an existing directory
pub async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}
