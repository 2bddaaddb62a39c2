//! Echo suppression
//!
//! When an applier writes a change it received from the peer, the watcher on
//! the same tree sees that write like any other and would send it straight
//! back. The [`LockTable`] records "self-inflicted" paths so the event
//! producer can drop those notifications.
//!
//! Two kinds of entries exist:
//!
//! - **Plain locks** (`lock`/`unlock`): consumed by the first echo that
//!   matches them.
//! - **Holds** (`hold` + `release_after`): used around applier mutations. A
//!   single write can surface as several OS notifications, so a hold swallows
//!   every echo for the path (and, for directories, its descendants) until a
//!   settle window after the mutation has elapsed.
//!
//! Holds are released on a timer, not on an exact completion signal. A local
//! edit landing inside the settle window is suppressed too; that window is
//! the accepted cost of not synchronizing with the notification backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
enum Release {
    /// Removed by the first suppressed echo
    OnEcho,
    /// Held until the mutation finishes, then until `deadline`
    Held { deadline: Option<Instant> },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    release: Release,
    generation: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.release, Release::Held { deadline: Some(d) } if d <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<PathBuf, Entry>,
    next_generation: u64,
}

/// Set of paths currently considered self-inflicted for one directory tree.
///
/// Shared between the watcher-driven producer and the applier of the same
/// tree. All operations take a short mutex.
#[derive(Debug, Default)]
pub struct LockTable {
    inner: Mutex<Inner>,
}

impl LockTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a path as self-inflicted until its echo is observed.
    ///
    /// Locking an empty path is a no-op.
    pub fn lock(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let generation = inner.bump();
        inner.entries.insert(
            path.to_path_buf(),
            Entry {
                release: Release::OnEcho,
                generation,
            },
        );
        trace!(path = %path.display(), "Locked path");
    }

    /// Whether the exact path is currently locked or held
    pub fn is_locked(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return false;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.get(path).map(|entry| entry.is_expired(now)) {
            Some(true) => {
                inner.entries.remove(path);
                false
            }
            Some(false) => true,
            None => false,
        }
    }

    /// Remove the mark for a path
    pub fn unlock(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if self.inner.lock().entries.remove(path).is_some() {
            trace!(path = %path.display(), "Unlocked path");
        }
    }

    /// Hold a path for the duration of an applier mutation.
    ///
    /// The hold stays in place until [`release_after`](Self::release_after)
    /// schedules its end. Returns the hold's generation. Empty paths are
    /// ignored and return `None`.
    pub fn hold(&self, path: impl AsRef<Path>) -> Option<u64> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return None;
        }
        let mut inner = self.inner.lock();
        let generation = inner.bump();
        inner.entries.insert(
            path.to_path_buf(),
            Entry {
                release: Release::Held { deadline: None },
                generation,
            },
        );
        trace!(path = %path.display(), generation, "Holding path");
        Some(generation)
    }

    /// Let a hold lapse `window` from now and drop its entry once it has.
    ///
    /// Must be called from within a tokio runtime. A newer hold on the same
    /// path is left alone.
    pub fn release_after(self: &Arc<Self>, path: impl AsRef<Path>, window: Duration) {
        let path = path.as_ref().to_path_buf();
        let generation = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&path) else {
                return;
            };
            if matches!(entry.release, Release::Held { .. }) {
                entry.release = Release::Held {
                    deadline: Some(Instant::now() + window),
                };
            }
            entry.generation
        };

        let table = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            table.release_generation(&path, generation);
        });
    }

    /// Producer-side check for a freshly observed event path.
    ///
    /// Returns `true` if the notification is an echo and must be dropped.
    /// Plain locks are consumed; holds persist until their window ends and
    /// also cover descendants of a held directory.
    pub fn suppress(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return false;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get(path).copied() {
            if entry.is_expired(now) {
                inner.entries.remove(path);
            } else {
                if matches!(entry.release, Release::OnEcho) {
                    inner.entries.remove(path);
                }
                return true;
            }
        }

        path.ancestors().skip(1).any(|ancestor| {
            matches!(
                inner.entries.get(ancestor),
                Some(entry) if matches!(entry.release, Release::Held { .. }) && !entry.is_expired(now)
            )
        })
    }

    /// Consume a plain lock on the path, if any.
    ///
    /// Holds are not consumed and do not count: they only guard against the
    /// local watcher's echo, never against the next legitimate remote change.
    pub fn take(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let mut inner = self.inner.lock();
        let plain = inner
            .entries
            .get(path)
            .is_some_and(|entry| matches!(entry.release, Release::OnEcho));
        if plain {
            inner.entries.remove(path);
        }
        plain
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release_generation(&self, path: &Path, generation: u64) {
        let mut inner = self.inner.lock();
        if inner
            .entries
            .get(path)
            .is_some_and(|entry| entry.generation == generation)
        {
            inner.entries.remove(path);
            trace!(path = %path.display(), generation, "Released hold");
        }
    }
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Hands out one [`LockTable`] per directory tree.
///
/// The server runs a push session and a pull session for the same client
/// root; both must see the same table. Different roots never share one.
#[derive(Debug, Default)]
pub struct LockRegistry {
    tables: Mutex<HashMap<PathBuf, Arc<LockTable>>>,
}

impl LockRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the table for a tree root
    pub fn for_root(&self, root: &Path) -> Arc<LockTable> {
        self.tables
            .lock()
            .entry(root.to_path_buf())
            .or_insert_with(|| Arc::new(LockTable::new()))
            .clone()
    }

    /// Number of trees with a table
    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    /// Whether no table has been handed out yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
