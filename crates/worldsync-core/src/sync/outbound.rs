//! Local changes to the wire

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::channel::ChangeSink;
use super::protocol::FileChanged;
use super::transport::MAX_FILE_LEN;
use crate::config::SyncTimings;
use crate::error::{SyncError, SyncResult};
use crate::fsutil;
use crate::locks::LockTable;
use crate::path_guard::PathGuard;
use crate::watcher::{ChangeEvent, ChangeWatcher};

/// Turns watcher events on one tree into [`FileChanged`] messages.
///
/// Echoes of changes the paired applier just made are dropped here, paths are
/// made relative to the tree root and file contents are attached.
#[derive(Debug)]
pub struct OutboundEndpoint {
    guard: PathGuard,
    locks: Arc<LockTable>,
    timings: SyncTimings,
    cancel: CancellationToken,
    sequence: u64,
    max_file_len: usize,
}

impl OutboundEndpoint {
    /// Create an endpoint for the tree under `guard`
    pub fn new(
        guard: PathGuard,
        locks: Arc<LockTable>,
        timings: SyncTimings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            guard,
            locks,
            timings,
            cancel,
            sequence: 0,
            max_file_len: MAX_FILE_LEN,
        }
    }

    /// Skip files larger than `max_file_len` bytes (default [`MAX_FILE_LEN`])
    pub fn with_max_file_len(mut self, max_file_len: usize) -> Self {
        self.max_file_len = max_file_len.min(MAX_FILE_LEN);
        self
    }

    /// Number of changes emitted so far
    pub fn sent(&self) -> u64 {
        self.sequence
    }

    /// Map one event to a wire message.
    ///
    /// Returns `Ok(None)` when the event is a suppressed echo, lies outside
    /// the tree, names a file that vanished before it could be read, or
    /// names a file too large for one frame.
    pub async fn prepare(&mut self, event: &ChangeEvent) -> SyncResult<Option<FileChanged>> {
        let old_echo = event.old_path().is_some_and(|p| self.locks.suppress(p));
        let new_echo = event.new_path().is_some_and(|p| self.locks.suppress(p));
        if old_echo || new_echo {
            debug!(?event, "Suppressed echo of applied change");
            return Ok(None);
        }

        let Some(old_path) = self.wire_path(event.old_path()) else {
            return Ok(None);
        };
        let Some(new_path) = self.wire_path(event.new_path()) else {
            return Ok(None);
        };

        let contents = match event.new_path() {
            Some(path) if event.has_content() => {
                fsutil::sleep_or_cancel(self.timings.event_delay, &self.cancel).await?;
                if self.is_oversized(path).await {
                    return Ok(None);
                }
                match fsutil::read_when_ready(path, self.timings.retry_interval, &self.cancel)
                    .await?
                {
                    // The file may have grown since it was measured
                    Some(bytes) if bytes.len() > self.max_file_len => {
                        warn!(
                            path = %path.display(),
                            size = bytes.len(),
                            max = self.max_file_len,
                            "File too large to sync, skipping"
                        );
                        return Ok(None);
                    }
                    Some(bytes) => bytes,
                    None => {
                        debug!(path = %path.display(), "File vanished before it could be read");
                        return Ok(None);
                    }
                }
            }
            _ => Vec::new(),
        };

        self.sequence += 1;
        Ok(Some(FileChanged {
            sequence: self.sequence,
            old_path,
            new_path,
            is_directory: event.is_directory(),
            contents,
        }))
    }

    /// Drain the watcher into the sink until cancelled or the sink fails.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Cancelled` on shutdown, or the sink's error.
    pub async fn run<S: ChangeSink>(
        mut self,
        watcher: &mut ChangeWatcher,
        sink: &mut S,
    ) -> SyncResult<()> {
        loop {
            let event = watcher.next().await?;
            let Some(change) = self.prepare(&event).await? else {
                continue;
            };
            let sequence = change.sequence;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                sent = sink.send_change(change) => sent?,
            }
            trace!(seq = sequence, "Change sent");
        }
    }

    /// Whether `path` is already known to exceed the file size limit
    async fn is_oversized(&self, path: &Path) -> bool {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return false;
        };
        let too_large = meta.len() > self.max_file_len as u64;
        if too_large {
            warn!(
                path = %path.display(),
                size = meta.len(),
                max = self.max_file_len,
                "File too large to sync, skipping"
            );
        }
        too_large
    }

    /// Wire form of an optional path; outer `None` means "outside the tree"
    fn wire_path(&self, path: Option<&Path>) -> Option<String> {
        match path {
            None => Some(String::new()),
            Some(path) => {
                let relative = self.guard.relativize(path);
                if relative.is_none() {
                    debug!(path = %path.display(), "Event outside sync root, skipping");
                }
                relative
            }
        }
    }
}
