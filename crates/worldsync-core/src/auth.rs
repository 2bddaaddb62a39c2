//! Client registration by file drop
//!
//! A registering client mints a token and asks its user to create a file
//! named [`AUTH_FILE_NAME`] containing that token at the root of the
//! directory the client should own. The server watches the world for that
//! file; from then on the directory holding it is the client's sandbox.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::{SyncError, SyncResult};
use crate::fsutil;
use crate::types::AuthToken;
use crate::watcher::{ChangeKind, ChangeWatcher};

/// Name of the file a client drops into its directory
pub const AUTH_FILE_NAME: &str = "worldsync";

/// Find the client directory that belongs to `token`.
///
/// Only direct subdirectories of `world_root` are considered. Returns the
/// canonical path of the first one whose auth file holds the token.
pub async fn locate_client_root(
    world_root: &Path,
    token: &AuthToken,
) -> SyncResult<Option<PathBuf>> {
    if token.is_blank() {
        return Ok(None);
    }

    let mut entries = fs::read_dir(world_root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let auth_file = entry.path().join(AUTH_FILE_NAME);
        let Ok(contents) = fs::read_to_string(&auth_file).await else {
            continue;
        };
        if token.matches_file_contents(&contents) {
            let root = entry.path().canonicalize()?;
            trace!(root = %root.display(), "Located client root");
            return Ok(Some(root));
        }
    }
    Ok(None)
}

/// Whether `path` is an auth file at the top of a direct subdirectory of
/// `world_root`, the only place [`locate_client_root`] looks
fn is_client_auth_file(world_root: &Path, path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()) == Some(AUTH_FILE_NAME)
        && path
            .parent()
            .and_then(Path::parent)
            .is_some_and(|dir| dir == world_root)
}

/// One-shot wait for an auth file carrying a given token
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    root: PathBuf,
    token: AuthToken,
    retry_interval: Duration,
}

impl AuthChallenge {
    /// Challenge for `token` in any client directory directly under `root`
    pub fn new(root: impl Into<PathBuf>, token: AuthToken) -> Self {
        Self {
            root: root.into(),
            token,
            retry_interval: Duration::from_millis(50),
        }
    }

    /// Poll interval while a candidate file is still being written
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Wait for the first matching auth file and return its path.
    ///
    /// Candidates are checked one at a time in the order they were observed.
    /// An auth file already present in a client directory when the wait
    /// starts counts as a match.
    ///
    /// # Errors
    ///
    /// `SyncError::Unauthenticated` for a blank token, `SyncError::Cancelled`
    /// when `cancel` fires first.
    pub async fn wait(self, cancel: CancellationToken) -> SyncResult<PathBuf> {
        if self.token.is_blank() {
            return Err(SyncError::Unauthenticated("blank auth token".into()));
        }

        // Stops the watcher on every exit path
        let watch_token = cancel.child_token();
        let _stop = watch_token.clone().drop_guard();
        let mut watcher = ChangeWatcher::start(&self.root, watch_token)?;

        if let Some(dir) = locate_client_root(watcher.root(), &self.token).await? {
            let path = dir.join(AUTH_FILE_NAME);
            info!(path = %path.display(), "Auth file already present");
            return Ok(path);
        }

        debug!(root = %watcher.root().display(), "Waiting for auth file");
        loop {
            let event = watcher.next().await?;
            if !matches!(event.kind(), ChangeKind::Create | ChangeKind::Update | ChangeKind::Move) {
                continue;
            }
            let Some(path) = event.new_path() else {
                continue;
            };
            if !is_client_auth_file(watcher.root(), path) {
                continue;
            }

            let Some(bytes) = fsutil::read_when_ready(path, self.retry_interval, &cancel).await?
            else {
                continue;
            };
            if self.token.matches_file_contents(&String::from_utf8_lossy(&bytes)) {
                info!(path = %path.display(), "Auth file matched");
                return Ok(path.to_path_buf());
            }
            trace!(path = %path.display(), "Auth file does not match");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_locate_client_root() {
        let world = TempDir::new().unwrap();
        let token = AuthToken::generate();
        std::fs::create_dir(world.path().join("computer-0")).unwrap();
        std::fs::create_dir(world.path().join("computer-1")).unwrap();
        std::fs::write(world.path().join("computer-0").join(AUTH_FILE_NAME), "other\n").unwrap();
        std::fs::write(
            world.path().join("computer-1").join(AUTH_FILE_NAME),
            format!("{token}\n"),
        )
        .unwrap();

        let root = locate_client_root(world.path(), &token).await.unwrap().unwrap();
        assert_eq!(
            root,
            world.path().join("computer-1").canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_locate_ignores_blank_and_unknown_tokens() {
        let world = TempDir::new().unwrap();
        std::fs::create_dir(world.path().join("c")).unwrap();
        std::fs::write(world.path().join("c").join(AUTH_FILE_NAME), "\n").unwrap();

        assert!(locate_client_root(world.path(), &AuthToken::new(""))
            .await
            .unwrap()
            .is_none());
        assert!(locate_client_root(world.path(), &AuthToken::new("nope"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_challenge_resolves_on_drop() {
        let world = TempDir::new().unwrap();
        std::fs::create_dir(world.path().join("computer-7")).unwrap();
        let token = AuthToken::generate();

        let challenge = AuthChallenge::new(world.path(), token.clone());
        let waiter = tokio::spawn(challenge.wait(CancellationToken::new()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(
            world.path().join("computer-7").join(AUTH_FILE_NAME),
            format!("{token}\n"),
        )
        .unwrap();

        let path = timeout(WAIT, waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(path.file_name().unwrap(), AUTH_FILE_NAME);
        assert!(path.parent().unwrap().ends_with("computer-7"));
    }

    #[tokio::test]
    async fn test_wrong_token_keeps_waiting() {
        let world = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let waiter = tokio::spawn(
            AuthChallenge::new(world.path(), AuthToken::new("expected")).wait(cancel.clone()),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(world.path().join(AUTH_FILE_NAME), "wrong\n").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished());

        cancel.cancel();
        let err = timeout(WAIT, waiter).await.unwrap().unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_misplaced_auth_file_keeps_waiting() {
        let world = TempDir::new().unwrap();
        let token = AuthToken::generate();
        std::fs::create_dir_all(world.path().join("c").join("nested")).unwrap();
        let cancel = CancellationToken::new();
        let waiter =
            tokio::spawn(AuthChallenge::new(world.path(), token.clone()).wait(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Matching token, but neither spot is a client directory root
        std::fs::write(world.path().join(AUTH_FILE_NAME), format!("{token}\n")).unwrap();
        std::fs::write(
            world.path().join("c").join("nested").join(AUTH_FILE_NAME),
            format!("{token}\n"),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!waiter.is_finished());
        assert!(locate_client_root(world.path(), &token).await.unwrap().is_none());

        cancel.cancel();
        let err = timeout(WAIT, waiter).await.unwrap().unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_client_auth_file_placement() {
        let root = Path::new("/worlds/alpha");
        assert!(is_client_auth_file(root, &root.join("laptop").join(AUTH_FILE_NAME)));
        assert!(!is_client_auth_file(root, &root.join(AUTH_FILE_NAME)));
        assert!(!is_client_auth_file(
            root,
            &root.join("laptop").join("sub").join(AUTH_FILE_NAME)
        ));
        assert!(!is_client_auth_file(root, &root.join("laptop").join("other")));
    }

    #[tokio::test]
    async fn test_existing_auth_file_matches_immediately() {
        let world = TempDir::new().unwrap();
        let token = AuthToken::generate();
        std::fs::create_dir(world.path().join("c")).unwrap();
        std::fs::write(world.path().join("c").join(AUTH_FILE_NAME), token.as_str()).unwrap();

        let path = timeout(
            WAIT,
            AuthChallenge::new(world.path(), token).wait(CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(path.ends_with(Path::new("c").join(AUTH_FILE_NAME)));
    }

    #[tokio::test]
    async fn test_blank_token_is_rejected() {
        let world = TempDir::new().unwrap();
        let err = AuthChallenge::new(world.path(), AuthToken::new("  "))
            .wait(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Unauthenticated(_)));
    }
}
