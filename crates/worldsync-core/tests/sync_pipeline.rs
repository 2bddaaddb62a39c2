//! In-process sync pipeline tests
//!
//! Wires a watcher, an outbound endpoint and an inbound applier together over
//! tokio channels, without any network, to check the change flow and echo
//! suppression on real directory trees.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use worldsync_core::sync::{AppliedAction, ApplyOutcome};
use worldsync_core::{
    ChangeWatcher, FileChanged, InboundApplier, LockTable, OutboundEndpoint, PathGuard,
    SyncTimings,
};

// ============================================================================
// Test Utilities
// ============================================================================

fn canonical_tempdir() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    (dir, root)
}

/// Poll until `check` holds or five seconds pass
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

fn read(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn create(path: &str, contents: &str) -> FileChanged {
    FileChanged {
        sequence: 1,
        old_path: String::new(),
        new_path: path.into(),
        is_directory: false,
        contents: contents.as_bytes().to_vec(),
    }
}

/// Mirror `source` into `target` through a channel until `cancel` fires
fn spawn_mirror(source: &Path, target: &Path, cancel: &CancellationToken) {
    let timings = SyncTimings::fast();
    let (mut tx, mut rx) = mpsc::channel::<FileChanged>(64);

    let mut watcher = ChangeWatcher::start(source, cancel.clone()).unwrap();
    let outbound = OutboundEndpoint::new(
        PathGuard::new(source),
        Arc::new(LockTable::new()),
        timings,
        cancel.clone(),
    );
    tokio::spawn(async move {
        let _ = outbound.run(&mut watcher, &mut tx).await;
    });

    let applier = InboundApplier::new(
        PathGuard::new(target),
        Arc::new(LockTable::new()),
        timings,
        cancel.clone(),
    );
    tokio::spawn(async move {
        let _ = applier.run(&mut rx).await;
    });
}

// ============================================================================
// Mirroring
// ============================================================================

#[tokio::test]
async fn test_local_edits_reach_the_mirror() {
    let (_a, source) = canonical_tempdir();
    let (_b, target) = canonical_tempdir();
    let cancel = CancellationToken::new();
    spawn_mirror(&source, &target, &cancel);

    std::fs::create_dir(source.join("docs")).unwrap();
    // Let the backend start watching the new directory
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(source.join("docs").join("notes.txt"), "hello").unwrap();

    let notes = target.join("docs").join("notes.txt");
    assert!(eventually(|| read(&notes).as_deref() == Some("hello")).await);

    std::fs::write(source.join("docs").join("notes.txt"), "hello again").unwrap();
    assert!(eventually(|| read(&notes).as_deref() == Some("hello again")).await);

    cancel.cancel();
}

#[tokio::test]
async fn test_rename_and_delete_reach_the_mirror() {
    let (_a, source) = canonical_tempdir();
    let (_b, target) = canonical_tempdir();
    let cancel = CancellationToken::new();
    spawn_mirror(&source, &target, &cancel);

    std::fs::write(source.join("draft.txt"), "v1").unwrap();
    assert!(eventually(|| target.join("draft.txt").exists()).await);

    std::fs::rename(source.join("draft.txt"), source.join("final.txt")).unwrap();
    assert!(
        eventually(|| {
            !target.join("draft.txt").exists()
                && read(&target.join("final.txt")).as_deref() == Some("v1")
        })
        .await
    );

    std::fs::remove_file(source.join("final.txt")).unwrap();
    assert!(eventually(|| !target.join("final.txt").exists()).await);

    cancel.cancel();
}

// ============================================================================
// Echo suppression
// ============================================================================

/// An applied change must not come back out of the same tree's watcher,
/// while an unrelated local edit right after it still does.
#[tokio::test]
async fn test_applied_change_is_not_echoed() {
    let (_dir, root) = canonical_tempdir();
    let cancel = CancellationToken::new();
    let timings = SyncTimings::fast();
    let locks = Arc::new(LockTable::new());

    let mut watcher = ChangeWatcher::start(&root, cancel.clone()).unwrap();
    let mut outbound = OutboundEndpoint::new(
        PathGuard::new(&root),
        Arc::clone(&locks),
        timings,
        cancel.clone(),
    );
    let applier = InboundApplier::new(PathGuard::new(&root), locks, timings, cancel.clone());

    let outcome = applier.apply(&create("notes.txt", "hello")).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Applied(AppliedAction::Created));
    assert_eq!(read(&root.join("notes.txt")).as_deref(), Some("hello"));

    std::fs::write(root.join("local.txt"), "mine").unwrap();

    let first_sent = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = watcher.next().await.unwrap();
            if let Some(change) = outbound.prepare(&event).await.unwrap() {
                return change;
            }
        }
    })
    .await
    .expect("local edit was never reported");

    assert_eq!(first_sent.new_path, "local.txt");
    assert_eq!(first_sent.contents, b"mine");
    assert_eq!(outbound.sent(), 1);

    cancel.cancel();
}

/// Two trees syncing both ways settle instead of ping-ponging
#[tokio::test]
async fn test_bidirectional_mirror_settles() {
    let (_a, left) = canonical_tempdir();
    let (_b, right) = canonical_tempdir();
    let cancel = CancellationToken::new();
    let timings = SyncTimings::fast();
    let left_locks = Arc::new(LockTable::new());
    let right_locks = Arc::new(LockTable::new());

    let (mut to_right, mut from_left) = mpsc::channel::<FileChanged>(64);
    let (mut to_left, mut from_right) = mpsc::channel::<FileChanged>(64);

    let mut left_watcher = ChangeWatcher::start(&left, cancel.clone()).unwrap();
    let mut right_watcher = ChangeWatcher::start(&right, cancel.clone()).unwrap();

    let left_out = OutboundEndpoint::new(
        PathGuard::new(&left),
        Arc::clone(&left_locks),
        timings,
        cancel.clone(),
    );
    let right_out = OutboundEndpoint::new(
        PathGuard::new(&right),
        Arc::clone(&right_locks),
        timings,
        cancel.clone(),
    );
    let left_in = InboundApplier::new(PathGuard::new(&left), left_locks, timings, cancel.clone());
    let right_in =
        InboundApplier::new(PathGuard::new(&right), right_locks, timings, cancel.clone());

    tokio::spawn(async move {
        let _ = left_out.run(&mut left_watcher, &mut to_right).await;
    });
    tokio::spawn(async move {
        let _ = right_out.run(&mut right_watcher, &mut to_left).await;
    });
    // Count what each side receives; the loops end when the senders drop
    let right_applied = tokio::spawn(async move {
        let mut received = 0;
        while let Some(change) = from_left.recv().await {
            received += 1;
            let _ = right_in.apply(&change).await;
        }
        received
    });
    let left_applied = tokio::spawn(async move {
        let mut received = 0;
        while let Some(change) = from_right.recv().await {
            received += 1;
            let _ = left_in.apply(&change).await;
        }
        received
    });

    std::fs::write(left.join("notes.txt"), "hello").unwrap();
    assert!(eventually(|| read(&right.join("notes.txt")).as_deref() == Some("hello")).await);

    // Give any echo time to surface before stopping
    tokio::time::sleep(Duration::from_millis(800)).await;
    cancel.cancel();

    let left_count = left_applied.await.unwrap();
    let right_count = right_applied.await.unwrap();
    assert!(right_count >= 1);
    assert_eq!(left_count, 0, "left tree received its own change back");
    assert_eq!(read(&left.join("notes.txt")).as_deref(), Some("hello"));
}
