//! Change events and the raw notification backlog

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};
use tokio::time::Instant;
use tracing::warn;

/// What a [`ChangeEvent`] represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new file or directory appeared
    Create,
    /// A file or directory went away
    Delete,
    /// A file or directory was renamed or moved within the tree
    Move,
    /// A file's contents were written
    Update,
}

/// One resolved change in a watched tree.
///
/// Never has both paths absent. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    old_path: Option<PathBuf>,
    new_path: Option<PathBuf>,
    is_directory: bool,
    has_content: bool,
}

impl ChangeEvent {
    /// A file or directory was created at `path`
    pub fn created(path: PathBuf, is_directory: bool) -> Self {
        Self {
            old_path: None,
            new_path: Some(path),
            is_directory,
            has_content: !is_directory,
        }
    }

    /// The entry at `path` was removed
    pub fn deleted(path: PathBuf, was_directory: bool) -> Self {
        Self {
            old_path: Some(path),
            new_path: None,
            is_directory: was_directory,
            has_content: false,
        }
    }

    /// The entry at `from` now lives at `to`
    pub fn renamed(from: PathBuf, to: PathBuf, is_directory: bool) -> Self {
        Self {
            old_path: Some(from),
            new_path: Some(to),
            is_directory,
            has_content: false,
        }
    }

    /// The contents at `path` were written
    pub fn updated(path: PathBuf, is_directory: bool) -> Self {
        Self {
            old_path: Some(path.clone()),
            new_path: Some(path),
            is_directory,
            has_content: !is_directory,
        }
    }

    /// Path before the change (absent for creates)
    pub fn old_path(&self) -> Option<&Path> {
        self.old_path.as_deref()
    }

    /// Path after the change (absent for deletes)
    pub fn new_path(&self) -> Option<&Path> {
        self.new_path.as_deref()
    }

    /// Whether the entry is a directory.
    ///
    /// For deletes this comes from the watcher's record of known
    /// directories, since the entry can no longer be inspected.
    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Whether the receiver should be sent the file's bytes
    pub fn has_content(&self) -> bool {
        self.has_content
    }

    /// Classify the event
    pub fn kind(&self) -> ChangeKind {
        match (&self.old_path, &self.new_path) {
            (None, _) => ChangeKind::Create,
            (Some(_), None) => ChangeKind::Delete,
            (Some(old), Some(new)) if old == new => ChangeKind::Update,
            (Some(_), Some(_)) => ChangeKind::Move,
        }
    }
}

/// A notification after classification, before it is resolved against the
/// file system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChange {
    /// Entry appeared
    Created(PathBuf),
    /// File contents written
    Changed(PathBuf),
    /// Entry removed
    Deleted(PathBuf),
    /// Rename with both ends known
    Renamed {
        /// Previous location
        from: PathBuf,
        /// Current location
        to: PathBuf,
    },
    /// First half of a rename; becomes a delete if no partner shows up
    MovedOut {
        /// Backend cookie pairing the halves, if any
        tracker: Option<usize>,
        /// Previous location
        path: PathBuf,
    },
    /// Second half of a rename; becomes a create if its partner is gone
    MovedIn {
        /// Backend cookie pairing the halves, if any
        tracker: Option<usize>,
        /// Current location
        path: PathBuf,
    },
}

impl RawChange {
    fn tracker(&self) -> Option<usize> {
        match self {
            RawChange::MovedOut { tracker, .. } | RawChange::MovedIn { tracker, .. } => *tracker,
            _ => None,
        }
    }

    /// Every path this change mentions
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            RawChange::Created(p) | RawChange::Changed(p) | RawChange::Deleted(p) => vec![p],
            RawChange::Renamed { from, to } => vec![from, to],
            RawChange::MovedOut { path, .. } | RawChange::MovedIn { path, .. } => vec![path],
        }
    }
}

/// Map a backend event to zero or more raw changes
pub fn classify(event: &Event) -> Vec<RawChange> {
    let tracker = event.tracker();
    let paths = &event.paths;

    match &event.kind {
        EventKind::Create(_) => paths.iter().cloned().map(RawChange::Created).collect(),
        EventKind::Remove(_) => paths.iter().cloned().map(RawChange::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if paths.len() >= 2 => vec![RawChange::Renamed {
                from: paths[0].clone(),
                to: paths[1].clone(),
            }],
            RenameMode::From => paths
                .iter()
                .cloned()
                .map(|path| RawChange::MovedOut { tracker, path })
                .collect(),
            RenameMode::To => paths
                .iter()
                .cloned()
                .map(|path| RawChange::MovedIn { tracker, path })
                .collect(),
            // Backends that can't tell which end of the rename they saw
            _ => paths
                .iter()
                .map(|path| {
                    if path.exists() {
                        RawChange::Created(path.clone())
                    } else {
                        RawChange::Deleted(path.clone())
                    }
                })
                .collect(),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => paths.iter().cloned().map(RawChange::Changed).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Outcome of asking the backlog for its oldest entry
#[derive(Debug, PartialEq, Eq)]
pub enum Pop {
    /// An entry is ready to be resolved
    Ready(RawChange),
    /// The oldest entry is a rename half still waiting for its partner
    Pending(Duration),
    /// Nothing queued
    Empty,
}

#[derive(Debug)]
struct Queued {
    change: RawChange,
    queued_at: Instant,
}

/// Trackers of recently seen rename halves; bounded so it never grows
/// without limit on long-running sessions.
const SEEN_TRACKERS_CAP: usize = 256;

/// Most notifications a backlog holds before it starts dropping new ones
pub const MAX_BACKLOG_LEN: usize = 10_000;

/// Ordered backlog of notifications that arrived while nobody was resolving
/// them.
///
/// Filled by the backend callback, drained one entry at a time by the single
/// consumer. Rename halves are paired here so a move inside the tree is
/// reported once instead of as a delete plus a create.
#[derive(Debug)]
pub struct Backlog {
    root: PathBuf,
    ignored_names: Vec<String>,
    queue: VecDeque<Queued>,
    seen_trackers: VecDeque<usize>,
    max_len: usize,
}

impl Backlog {
    /// Create an empty backlog for a tree
    pub fn new(root: PathBuf, ignored_names: Vec<String>) -> Self {
        Self {
            root,
            ignored_names,
            queue: VecDeque::new(),
            seen_trackers: VecDeque::new(),
            max_len: MAX_BACKLOG_LEN,
        }
    }

    /// Cap the number of queued entries (default [`MAX_BACKLOG_LEN`])
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Classify a backend event and queue the result. Returns how many
    /// entries were added.
    pub fn push_event(&mut self, event: &Event) -> usize {
        let tracker = event.tracker();
        let mut added = 0;
        for change in classify(event) {
            let change = match change {
                // A rename across the tree boundary is a create or delete here
                RawChange::Renamed { from, to } => {
                    match (self.is_relevant(&from), self.is_relevant(&to)) {
                        (true, true) => {
                            added += usize::from(self.push_rename(from, to, tracker));
                            continue;
                        }
                        (true, false) => RawChange::Deleted(from),
                        (false, true) => RawChange::Created(to),
                        (false, false) => continue,
                    }
                }
                other if other.paths().iter().all(|p| self.is_relevant(p)) => other,
                _ => continue,
            };
            added += usize::from(self.push(change));
        }
        added
    }

    /// Queue one raw change, pairing rename halves. Returns whether a new
    /// entry was added.
    pub fn push(&mut self, change: RawChange) -> bool {
        let now = Instant::now();
        match change {
            RawChange::MovedOut { tracker, path } => {
                if let Some(t) = tracker {
                    self.remember_tracker(t);
                }
                self.enqueue(RawChange::MovedOut { tracker, path }, now)
            }
            RawChange::MovedIn { tracker, path } => {
                if let Some(t) = tracker {
                    self.remember_tracker(t);
                }
                // Untracked halves pair with an untracked MovedOut right before them
                if tracker.is_none() {
                    if let Some(last) = self.queue.back_mut() {
                        if let RawChange::MovedOut { tracker: None, path: from } = &last.change {
                            last.change = RawChange::Renamed {
                                from: from.clone(),
                                to: path,
                            };
                            return false;
                        }
                    }
                }
                self.enqueue(RawChange::MovedIn { tracker, path }, now)
            }
            RawChange::Renamed { from, to } => self.push_rename(from, to, None),
            other => self.enqueue(other, now),
        }
    }

    /// Take the oldest entry if it is ready.
    ///
    /// A lone `MovedOut` is held back for `pair_window` so its partner can
    /// arrive; after that it resolves as a delete.
    pub fn pop_ready(&mut self, pair_window: Duration) -> Pop {
        let Some(front) = self.queue.front() else {
            return Pop::Empty;
        };

        if let RawChange::MovedOut { .. } = front.change {
            let age = front.queued_at.elapsed();
            if age < pair_window {
                return Pop::Pending(pair_window - age);
            }
        }

        match self.queue.pop_front() {
            Some(queued) => Pop::Ready(queued.change),
            None => Pop::Empty,
        }
    }

    fn push_rename(&mut self, from: PathBuf, to: PathBuf, tracker: Option<usize>) -> bool {
        let out_idx = self.queue.iter().position(
            |q| matches!(&q.change, RawChange::MovedOut { path, .. } if *path == from),
        );
        let in_idx = self.queue.iter().position(
            |q| matches!(&q.change, RawChange::MovedIn { path, .. } if *path == to),
        );

        match (out_idx, in_idx) {
            (Some(out_idx), in_idx) => {
                let out_tracker = self.queue[out_idx].change.tracker();
                if let Some(in_idx) = in_idx {
                    if self.queue[in_idx].change.tracker() == out_tracker {
                        self.queue.remove(in_idx);
                    }
                }
                self.queue[out_idx].change = RawChange::Renamed { from, to };
                false
            }
            // The MovedOut half was already delivered as a delete; the
            // queued MovedIn will become a create.
            (None, Some(_)) => false,
            // Both halves already delivered
            (None, None) if tracker.is_some_and(|t| self.seen_trackers.contains(&t)) => false,
            (None, None) => self.enqueue(RawChange::Renamed { from, to }, Instant::now()),
        }
    }

    fn remember_tracker(&mut self, tracker: usize) {
        if self.seen_trackers.contains(&tracker) {
            return;
        }
        if self.seen_trackers.len() == SEEN_TRACKERS_CAP {
            self.seen_trackers.pop_front();
        }
        self.seen_trackers.push_back(tracker);
    }

    /// Append unless the backlog is full; a full backlog drops the new entry
    fn enqueue(&mut self, change: RawChange, queued_at: Instant) -> bool {
        if self.queue.len() >= self.max_len {
            warn!(
                max = self.max_len,
                ?change,
                "Change backlog full, dropping notification"
            );
            return false;
        }
        self.queue.push_back(Queued { change, queued_at });
        true
    }

    /// Whether a path is inside the tree and not under an ignored directory
    pub fn is_relevant(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        if relative.as_os_str().is_empty() {
            return false;
        }
        !relative
            .components()
            .any(|c| self.ignored_names.iter().any(|name| c.as_os_str() == name.as_str()))
    }
}

/// Directories the watcher knows about, used to answer "was this a
/// directory" for deletes.
#[derive(Debug, Default)]
pub struct KnownDirs {
    dirs: HashSet<PathBuf>,
}

impl KnownDirs {
    /// Record every directory below `root` (not `root` itself)
    pub fn scan(root: &Path, ignored_names: &[String]) -> Self {
        let mut known = Self::default();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                let name = entry.file_name();
                if !is_dir || ignored_names.iter().any(|n| name == n.as_str()) {
                    continue;
                }
                let path = entry.path();
                known.dirs.insert(path.clone());
                stack.push(path);
            }
        }
        known
    }

    /// Record a directory
    pub fn insert(&mut self, path: PathBuf) {
        self.dirs.insert(path);
    }

    /// Whether a path is a known directory
    pub fn contains(&self, path: &Path) -> bool {
        self.dirs.contains(path)
    }

    /// Forget a path and everything under it. Returns whether the path
    /// itself was a known directory.
    pub fn remove_tree(&mut self, path: &Path) -> bool {
        let was_dir = self.dirs.remove(path);
        if was_dir {
            self.dirs.retain(|p| !p.starts_with(path));
        }
        was_dir
    }

    /// Re-home a moved directory and everything under it
    pub fn rename_tree(&mut self, from: &Path, to: &Path) {
        let moved: Vec<PathBuf> = self
            .dirs
            .iter()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for old in moved {
            self.dirs.remove(&old);
            if let Ok(rest) = old.strip_prefix(from) {
                self.dirs.insert(to.join(rest));
            }
        }
        self.dirs.insert(to.to_path_buf());
    }

    /// Number of known directories
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    /// Whether no directory is known
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    fn root() -> PathBuf {
        PathBuf::from("/tree")
    }

    fn backlog() -> Backlog {
        Backlog::new(root(), vec![".worldsync".into()])
    }

    fn p(rel: &str) -> PathBuf {
        root().join(rel)
    }

    #[test]
    fn test_change_event_kinds() {
        assert_eq!(ChangeEvent::created(p("a"), false).kind(), ChangeKind::Create);
        assert_eq!(ChangeEvent::deleted(p("a"), false).kind(), ChangeKind::Delete);
        assert_eq!(ChangeEvent::renamed(p("a"), p("b"), false).kind(), ChangeKind::Move);
        assert_eq!(ChangeEvent::updated(p("a"), false).kind(), ChangeKind::Update);
    }

    #[test]
    fn test_change_event_content_flags() {
        assert!(ChangeEvent::created(p("a"), false).has_content());
        assert!(!ChangeEvent::created(p("d"), true).has_content());
        assert!(!ChangeEvent::deleted(p("a"), false).has_content());
        assert!(!ChangeEvent::renamed(p("a"), p("b"), false).has_content());
        assert!(ChangeEvent::updated(p("a"), false).has_content());
    }

    #[test]
    fn test_classify_basic_kinds() {
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(p("a"));
        assert_eq!(classify(&create), vec![RawChange::Created(p("a"))]);

        let write = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Any))).add_path(p("a"));
        assert_eq!(classify(&write), vec![RawChange::Changed(p("a"))]);

        let remove = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(p("d"));
        assert_eq!(classify(&remove), vec![RawChange::Deleted(p("d"))]);
    }

    #[test]
    fn test_classify_ignores_metadata_and_access() {
        let meta = Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)))
            .add_path(p("a"));
        assert!(classify(&meta).is_empty());

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(p("a"));
        assert!(classify(&access).is_empty());
    }

    #[test]
    fn test_rename_halves_pair_into_one_move() {
        let mut backlog = backlog();
        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(p("a.txt"))
            .set_tracker(7);
        let to = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(p("b.txt"))
            .set_tracker(7);
        let both = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(p("a.txt"))
            .add_path(p("b.txt"))
            .set_tracker(7);

        backlog.push_event(&from);
        backlog.push_event(&to);
        backlog.push_event(&both);

        assert_eq!(backlog.len(), 1);
        assert_eq!(
            backlog.pop_ready(Duration::ZERO),
            Pop::Ready(RawChange::Renamed {
                from: p("a.txt"),
                to: p("b.txt"),
            })
        );
        assert_eq!(backlog.pop_ready(Duration::ZERO), Pop::Empty);
    }

    #[test]
    fn test_untracked_halves_pair() {
        let mut backlog = backlog();
        backlog.push(RawChange::MovedOut { tracker: None, path: p("a") });
        backlog.push(RawChange::MovedIn { tracker: None, path: p("b") });
        assert_eq!(
            backlog.pop_ready(Duration::ZERO),
            Pop::Ready(RawChange::Renamed { from: p("a"), to: p("b") })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_moved_out_waits_for_pair_window() {
        let mut backlog = backlog();
        backlog.push(RawChange::MovedOut { tracker: Some(3), path: p("gone") });

        assert!(matches!(
            backlog.pop_ready(Duration::from_millis(25)),
            Pop::Pending(_)
        ));

        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(
            backlog.pop_ready(Duration::from_millis(25)),
            Pop::Ready(RawChange::MovedOut { tracker: Some(3), path: p("gone") })
        );
    }

    #[test]
    fn test_both_after_delivered_halves_is_dropped() {
        let mut backlog = backlog();
        backlog.push(RawChange::MovedOut { tracker: Some(9), path: p("a") });
        let _ = backlog.pop_ready(Duration::ZERO);
        backlog.push(RawChange::MovedIn { tracker: Some(9), path: p("b") });
        backlog.push(RawChange::Renamed { from: p("a"), to: p("b") });

        assert_eq!(backlog.len(), 1);
        assert_eq!(
            backlog.pop_ready(Duration::ZERO),
            Pop::Ready(RawChange::MovedIn { tracker: Some(9), path: p("b") })
        );
    }

    #[test]
    fn test_fifo_order() {
        let mut backlog = backlog();
        backlog.push(RawChange::Created(p("1")));
        backlog.push(RawChange::Changed(p("1")));
        backlog.push(RawChange::Deleted(p("1")));

        assert_eq!(backlog.pop_ready(Duration::ZERO), Pop::Ready(RawChange::Created(p("1"))));
        assert_eq!(backlog.pop_ready(Duration::ZERO), Pop::Ready(RawChange::Changed(p("1"))));
        assert_eq!(backlog.pop_ready(Duration::ZERO), Pop::Ready(RawChange::Deleted(p("1"))));
    }

    #[test]
    fn test_ignored_and_foreign_paths_are_dropped() {
        let mut backlog = backlog();
        let marker = Event::new(EventKind::Create(CreateKind::File)).add_path(p(".worldsync/auth"));
        let foreign = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/elsewhere/x"));
        let root_itself = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(root());

        assert_eq!(backlog.push_event(&marker), 0);
        assert_eq!(backlog.push_event(&foreign), 0);
        assert_eq!(backlog.push_event(&root_itself), 0);
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_full_backlog_drops_new_entries() {
        let mut backlog = backlog().with_max_len(2);
        assert!(backlog.push(RawChange::Created(p("1"))));
        assert!(backlog.push(RawChange::Created(p("2"))));
        assert!(!backlog.push(RawChange::Created(p("3"))));
        assert!(!backlog.push(RawChange::Renamed { from: p("4"), to: p("5") }));
        assert_eq!(backlog.len(), 2);

        // Pairing a queued half does not need room
        let _ = backlog.pop_ready(Duration::ZERO);
        assert!(backlog.push(RawChange::MovedOut { tracker: None, path: p("a") }));
        assert!(!backlog.push(RawChange::MovedIn { tracker: None, path: p("b") }));
        assert_eq!(backlog.len(), 2);

        assert_eq!(backlog.pop_ready(Duration::ZERO), Pop::Ready(RawChange::Created(p("2"))));
        assert_eq!(
            backlog.pop_ready(Duration::ZERO),
            Pop::Ready(RawChange::Renamed { from: p("a"), to: p("b") })
        );
        assert!(backlog.push(RawChange::Created(p("6"))));
    }

    #[test]
    fn test_known_dirs_tracking() {
        let mut dirs = KnownDirs::default();
        dirs.insert(p("a"));
        dirs.insert(p("a/b"));
        dirs.rename_tree(&p("a"), &p("z"));
        assert!(dirs.contains(&p("z")));
        assert!(dirs.contains(&p("z/b")));
        assert!(!dirs.contains(&p("a/b")));

        assert!(dirs.remove_tree(&p("z")));
        assert!(dirs.is_empty());
        assert!(!dirs.remove_tree(&p("file.txt")));
    }

    #[test]
    fn test_known_dirs_scan() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::create_dir_all(dir.path().join(".worldsync")).unwrap();
        std::fs::write(dir.path().join("a/file.txt"), b"x").unwrap();

        let known = KnownDirs::scan(dir.path(), &[".worldsync".to_string()]);
        assert_eq!(known.len(), 2);
        assert!(known.contains(&dir.path().join("a/b")));
        assert!(!known.contains(&dir.path().join(".worldsync")));
    }
}
