//! Recursive file system watcher with serialized delivery
//!
//! The backend callback only classifies notifications and appends them to a
//! backlog. [`ChangeWatcher::next`] resolves one entry at a time against the
//! current state of the disk, so consumers see changes strictly in the order
//! they were observed and never two at once.

mod event;

pub use event::{
    classify, Backlog, ChangeEvent, ChangeKind, KnownDirs, Pop, RawChange, MAX_BACKLOG_LEN,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{SyncError, SyncResult};
use crate::fsutil;

/// How long the first half of a rename waits for its partner before it is
/// reported as a delete
pub const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(25);

/// Options for [`ChangeWatcher::start_with`]
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Directory names whose contents are never reported, at any depth
    pub ignored_names: Vec<String>,
}

impl WatchOptions {
    /// Ignore every directory called `name`
    pub fn ignore(mut self, name: impl Into<String>) -> Self {
        self.ignored_names.push(name.into());
        self
    }
}

struct Shared {
    backlog: Mutex<Backlog>,
    wakeup: Notify,
}

/// Watches a directory tree and yields [`ChangeEvent`]s one at a time.
///
/// `next` takes `&mut self`, so only one consumer can be resolving at any
/// moment. Cancelling the token stops the backend and makes every pending
/// and future `next` fail with [`SyncError::Cancelled`].
pub struct ChangeWatcher {
    root: PathBuf,
    shared: Arc<Shared>,
    known_dirs: KnownDirs,
    cancel: CancellationToken,
    backend: Option<RecommendedWatcher>,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("root", &self.root)
            .field("known_dirs", &self.known_dirs.len())
            .field("running", &self.backend.is_some())
            .finish()
    }
}

impl ChangeWatcher {
    /// Start watching `root` recursively
    pub fn start(root: impl AsRef<Path>, cancel: CancellationToken) -> SyncResult<Self> {
        Self::start_with(root, cancel, WatchOptions::default())
    }

    /// Start watching `root` recursively with options
    pub fn start_with(
        root: impl AsRef<Path>,
        cancel: CancellationToken,
        options: WatchOptions,
    ) -> SyncResult<Self> {
        let root = root.as_ref().canonicalize()?;
        let shared = Arc::new(Shared {
            backlog: Mutex::new(Backlog::new(root.clone(), options.ignored_names.clone())),
            wakeup: Notify::new(),
        });

        let callback_shared = Arc::clone(&shared);
        let mut backend = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let added = callback_shared.backlog.lock().push_event(&event);
                    if added > 0 {
                        callback_shared.wakeup.notify_one();
                    }
                }
                Err(err) => warn!(error = %err, "File watcher error"),
            }
        })?;
        backend.watch(&root, RecursiveMode::Recursive)?;

        let known_dirs = KnownDirs::scan(&root, &options.ignored_names);
        debug!(root = %root.display(), dirs = known_dirs.len(), "Watching directory tree");

        Ok(Self {
            root,
            shared,
            known_dirs,
            cancel,
            backend: Some(backend),
        })
    }

    /// Canonical root of the watched tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wait for the next change.
    ///
    /// Queued changes are delivered oldest first without waiting.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Cancelled` once the token is cancelled.
    pub async fn next(&mut self) -> SyncResult<ChangeEvent> {
        loop {
            if self.cancel.is_cancelled() {
                self.stop();
                return Err(SyncError::Cancelled);
            }

            let popped = self.shared.backlog.lock().pop_ready(RENAME_PAIR_WINDOW);
            let wait = match popped {
                Pop::Ready(raw) => {
                    if let Some(event) = self.resolve(raw).await {
                        trace!(?event, "Change observed");
                        return Ok(event);
                    }
                    continue;
                }
                Pop::Pending(remaining) => Some(remaining),
                Pop::Empty => None,
            };

            let shared = Arc::clone(&self.shared);
            let cancel = self.cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = shared.wakeup.notified() => {}
                _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {}
            }
        }
    }

    /// Stop the backend. Further `next` calls still drain nothing and fail
    /// once the token is cancelled.
    pub fn stop(&mut self) {
        if self.backend.take().is_some() {
            debug!(root = %self.root.display(), "Stopped watching");
        }
    }

    async fn resolve(&mut self, raw: RawChange) -> Option<ChangeEvent> {
        match raw {
            RawChange::Created(path) | RawChange::MovedIn { path, .. } => {
                if !fsutil::exists(&path).await {
                    return None;
                }
                let is_dir = fsutil::is_dir(&path).await;
                if is_dir {
                    self.known_dirs.insert(path.clone());
                }
                Some(ChangeEvent::created(path, is_dir))
            }
            RawChange::Changed(path) => {
                let is_dir = fsutil::is_dir(&path).await;
                if is_dir {
                    // Directory mtime bumps carry nothing to transfer
                    return None;
                }
                Some(ChangeEvent::updated(path, false))
            }
            RawChange::Deleted(path) | RawChange::MovedOut { path, .. } => {
                let was_dir = self.known_dirs.remove_tree(&path);
                Some(ChangeEvent::deleted(path, was_dir))
            }
            RawChange::Renamed { from, to } => {
                let is_dir = self.known_dirs.contains(&from) || fsutil::is_dir(&to).await;
                if is_dir {
                    self.known_dirs.rename_tree(&from, &to);
                }
                Some(ChangeEvent::renamed(from, to, is_dir))
            }
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
