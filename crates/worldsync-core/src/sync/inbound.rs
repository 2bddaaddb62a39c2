//! Remote changes applied to a local tree
//!
//! The message shape alone cannot tell a create from an update, so the
//! action is chosen from what currently exists on disk:
//!
//! 1. old path missing and new path set: **create**
//! 2. new path absent: **delete**
//! 3. old path present and different from the new path: **move**
//! 4. otherwise: **update**
//!
//! Every mutated path is held in the tree's [`LockTable`] while the mutation
//! runs and for a settle window afterwards, so the local watcher does not
//! send the change straight back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::ChangeSource;
use super::protocol::FileChanged;
use crate::config::SyncTimings;
use crate::error::{SyncError, SyncResult};
use crate::fsutil;
use crate::locks::LockTable;
use crate::path_guard::PathGuard;

/// What the applier did with a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedAction {
    /// Created a file or directory
    Created,
    /// Removed a file or directory tree
    Deleted,
    /// Renamed a file or directory
    Moved,
    /// Overwrote a file (or re-created a directory)
    Updated,
}

/// Why a change was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A path resolved outside the sandbox root
    OutsideRoot,
    /// A path carried a plain lock
    Locked,
    /// Neither path was set
    NoPaths,
    /// Delete of something that does not exist
    Missing,
}

/// Result of applying one change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change was written to disk
    Applied(AppliedAction),
    /// The change was dropped
    Skipped(SkipReason),
}

/// Applies [`FileChanged`] messages to the tree under a [`PathGuard`]
#[derive(Debug, Clone)]
pub struct InboundApplier {
    guard: PathGuard,
    locks: Arc<LockTable>,
    timings: SyncTimings,
    cancel: CancellationToken,
}

impl InboundApplier {
    /// Create an applier for the tree under `guard`
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
        }
    }

    /// Apply changes from `source` until it ends.
    ///
    /// A change that fails with an I/O error is logged and skipped; the
    /// stream keeps going. Returns the number of changes applied.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Cancelled` on shutdown, or the source's error.
    pub async fn run<S: ChangeSource>(&self, source: &mut S) -> SyncResult<u64> {
        let mut applied = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                next = source.next_change() => next?,
            };
            let Some(change) = next else {
                debug!(applied, "Change stream ended");
                return Ok(applied);
            };

            match self.apply(&change).await {
                Ok(ApplyOutcome::Applied(action)) => {
                    debug!(seq = change.sequence, ?action, "Applied remote change");
                    applied += 1;
                }
                Ok(ApplyOutcome::Skipped(reason)) => {
                    debug!(seq = change.sequence, ?reason, "Skipped remote change");
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(
                        seq = change.sequence,
                        old = %change.old_path,
                        new = %change.new_path,
                        error = %err,
                        "Failed to apply remote change"
                    );
                }
            }
        }
    }

    /// Apply a single change
    pub async fn apply(&self, change: &FileChanged) -> SyncResult<ApplyOutcome> {
        let (old, new) = match (
            self.guard.resolve_optional(&change.old_path),
            self.guard.resolve_optional(&change.new_path),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(err), _) | (_, Err(err)) => {
                debug!(seq = change.sequence, error = %err, "Rejected path");
                return Ok(ApplyOutcome::Skipped(SkipReason::OutsideRoot));
            }
        };

        let old_locked = old.as_deref().is_some_and(|p| self.locks.take(p));
        let new_locked = new.as_deref().is_some_and(|p| self.locks.take(p));
        if old_locked || new_locked {
            return Ok(ApplyOutcome::Skipped(SkipReason::Locked));
        }

        let old_exists = match &old {
            Some(path) => fsutil::exists(path).await,
            None => false,
        };

        match (old, new) {
            (None, None) => Ok(ApplyOutcome::Skipped(SkipReason::NoPaths)),
            (_, Some(new)) if !old_exists => self.create(&new, change).await,
            (Some(old), None) => self.delete(&old).await,
            (Some(old), Some(new)) if old != new => self.relocate(&old, &new).await,
            (_, Some(new)) => self.update(&new, change).await,
        }
    }

    async fn create(&self, path: &Path, change: &FileChanged) -> SyncResult<ApplyOutcome> {
        let anchor = self.first_missing_ancestor(path).await;
        self.locks.hold(&anchor);
        let result: SyncResult<ApplyOutcome> = async {
            self.ensure_parent(path).await?;
            if change.is_directory {
                fs::create_dir_all(path).await?;
            } else {
                fs::write(path, &change.contents).await?;
            }
            Ok(ApplyOutcome::Applied(AppliedAction::Created))
        }
        .await;
        self.settle(&anchor, self.timings.apply_settle);
        result
    }

    async fn delete(&self, path: &Path) -> SyncResult<ApplyOutcome> {
        if !fsutil::exists(path).await {
            return Ok(ApplyOutcome::Skipped(SkipReason::Missing));
        }
        self.locks.hold(path);
        let result: SyncResult<ApplyOutcome> = async {
            if fsutil::is_dir(path).await {
                fs::remove_dir_all(path).await?;
            } else {
                fs::remove_file(path).await?;
            }
            Ok(ApplyOutcome::Applied(AppliedAction::Deleted))
        }
        .await;
        self.settle(path, self.timings.apply_settle);
        result
    }

    async fn relocate(&self, from: &Path, to: &Path) -> SyncResult<ApplyOutcome> {
        let anchor = self.first_missing_ancestor(to).await;
        self.locks.hold(from);
        self.locks.hold(&anchor);
        let result: SyncResult<ApplyOutcome> = async {
            self.ensure_parent(to).await?;
            fs::rename(from, to).await?;
            Ok(ApplyOutcome::Applied(AppliedAction::Moved))
        }
        .await;
        self.settle(from, self.timings.move_settle);
        self.settle(&anchor, self.timings.move_settle);
        result
    }

    async fn update(&self, path: &Path, change: &FileChanged) -> SyncResult<ApplyOutcome> {
        self.locks.hold(path);
        let result: SyncResult<ApplyOutcome> = async {
            if fsutil::is_dir(path).await {
                fs::create_dir_all(path).await?;
            } else {
                fsutil::wait_until_writable(path, self.timings.retry_interval, &self.cancel)
                    .await?;
                fs::write(path, &change.contents).await?;
            }
            Ok(ApplyOutcome::Applied(AppliedAction::Updated))
        }
        .await;
        self.settle(path, self.timings.apply_settle);
        result
    }

    /// Create the parent directory if needed, then give the notification
    /// backend a moment before anything is written into it
    async fn ensure_parent(&self, path: &Path) -> SyncResult<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        if fsutil::is_dir(parent).await {
            return Ok(());
        }
        fs::create_dir_all(parent).await?;
        fsutil::sleep_or_cancel(self.timings.parent_settle, &self.cancel).await
    }

    /// Topmost ancestor of `path` (below the root) that does not exist yet,
    /// or `path` itself when its parent exists
    async fn first_missing_ancestor(&self, path: &Path) -> PathBuf {
        let mut anchor = path.to_path_buf();
        for ancestor in path.ancestors().skip(1) {
            if !self.guard.contains(ancestor) || fsutil::exists(ancestor).await {
                break;
            }
            anchor = ancestor.to_path_buf();
        }
        anchor
    }

    fn settle(&self, path: &Path, window: Duration) {
        self.locks.release_after(path, window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn applier(root: &Path) -> (InboundApplier, Arc<LockTable>) {
        let locks = Arc::new(LockTable::new());
        let applier = InboundApplier::new(
            PathGuard::new(root),
            Arc::clone(&locks),
            SyncTimings::fast(),
            CancellationToken::new(),
        );
        (applier, locks)
    }

    fn change(old: &str, new: &str, is_directory: bool, contents: &[u8]) -> FileChanged {
        FileChanged {
            sequence: 1,
            old_path: old.into(),
            new_path: new.into(),
            is_directory,
            contents: contents.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_create_then_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (applier, _) = applier(dir.path());

        let outcome = applier.apply(&change("", "a/b.txt", false, b"X")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(AppliedAction::Created));
        assert_eq!(std::fs::read(dir.path().join("a/b.txt")).unwrap(), b"X");

        let outcome = applier.apply(&change("a/b.txt", "", false, b"")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(AppliedAction::Deleted));
        assert!(!dir.path().join("a/b.txt").exists());
    }

    #[tokio::test]
    async fn test_whitespace_in_names_is_kept() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();
        let (applier, _) = applier(dir.path());

        for name in [" notes.txt", "notes.txt "] {
            let outcome = applier.apply(&change("", name, false, b"new")).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::Applied(AppliedAction::Created));
            assert_eq!(std::fs::read(dir.path().join(name)).unwrap(), b"new");
        }
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_move_renames_instead_of_recreating() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"keep me").unwrap();
        let (applier, _) = applier(dir.path());

        let outcome = applier.apply(&change("a.txt", "b.txt", false, b"")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(AppliedAction::Moved));
        assert!(!dir.path().join("a.txt").exists());
        assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_move_into_new_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/x.lua"), b"print()").unwrap();
        let (applier, _) = applier(dir.path());

        applier
            .apply(&change("src", "lib/src", true, b""))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("lib/src/x.lua")).unwrap(),
            b"print()"
        );
    }

    #[tokio::test]
    async fn test_update_overwrites_existing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), b"old").unwrap();
        let (applier, _) = applier(dir.path());

        let outcome = applier.apply(&change("f.txt", "f.txt", false, b"new")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(AppliedAction::Updated));
        assert_eq!(std::fs::read(dir.path().join("f.txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_update_of_missing_file_creates_it() {
        let dir = TempDir::new().unwrap();
        let (applier, _) = applier(dir.path());

        let outcome = applier.apply(&change("f.txt", "f.txt", false, b"late")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(AppliedAction::Created));
        assert_eq!(std::fs::read(dir.path().join("f.txt")).unwrap(), b"late");
    }

    #[tokio::test]
    async fn test_create_directory() {
        let dir = TempDir::new().unwrap();
        let (applier, _) = applier(dir.path());

        applier.apply(&change("", "nested/dir", true, b"")).await.unwrap();
        assert!(dir.path().join("nested/dir").is_dir());
    }

    #[tokio::test]
    async fn test_delete_directory_recursively() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("d/e")).unwrap();
        std::fs::write(dir.path().join("d/e/f"), b"").unwrap();
        let (applier, _) = applier(dir.path());

        applier.apply(&change("d", "", true, b"")).await.unwrap();
        assert!(!dir.path().join("d").exists());
    }

    #[tokio::test]
    async fn test_delete_missing_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (applier, _) = applier(dir.path());
        let outcome = applier.apply(&change("nope", "", false, b"")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped(SkipReason::Missing));
    }

    #[tokio::test]
    async fn test_escaping_path_is_skipped() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("client");
        std::fs::create_dir(&root).unwrap();
        let (applier, _) = applier(&root);

        let outcome = applier
            .apply(&change("", "../../etc/passwd", false, b"pwned"))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped(SkipReason::OutsideRoot));
        assert!(!dir.path().join("etc").exists());
    }

    #[tokio::test]
    async fn test_plain_lock_skips_and_unlocks() {
        let dir = TempDir::new().unwrap();
        let (applier, locks) = applier(dir.path());
        let target = dir.path().join("a.txt");
        locks.lock(&target);

        let outcome = applier.apply(&change("", "a.txt", false, b"1")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped(SkipReason::Locked));
        assert!(!locks.is_locked(&target));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_applied_path_is_held_for_echo() {
        let dir = TempDir::new().unwrap();
        let (applier, locks) = applier(dir.path());

        applier.apply(&change("", "a.txt", false, b"1")).await.unwrap();
        let path = dir.path().join("a.txt");
        assert!(locks.suppress(&path));
        assert!(locks.suppress(&path));
    }

    #[tokio::test]
    async fn test_created_parent_is_held() {
        let dir = TempDir::new().unwrap();
        let (applier, locks) = applier(dir.path());

        applier.apply(&change("", "x/y/z.txt", false, b"1")).await.unwrap();
        assert!(locks.suppress(dir.path().join("x")));
        assert!(locks.suppress(dir.path().join("x/y")));
    }

    #[tokio::test]
    async fn test_run_continues_after_failed_change() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("occupied")).unwrap();
        std::fs::write(dir.path().join("occupied/inner"), b"").unwrap();
        let (applier, _) = applier(dir.path());

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        // Writing a file over a non-empty directory fails
        tx.send(change("", "occupied", false, b"boom")).await.unwrap();
        tx.send(change("", "ok.txt", false, b"fine")).await.unwrap();
        drop(tx);

        let applied = applier.run(&mut rx).await.unwrap();
        assert_eq!(applied, 1);
        assert_eq!(std::fs::read(dir.path().join("ok.txt")).unwrap(), b"fine");
    }
}
