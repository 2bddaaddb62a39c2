//! Sync client
//!
//! Talks to a [`SyncServer`](crate::server::SyncServer): lists worlds,
//! registers a directory and keeps a registered directory in sync.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncTimings;
use crate::error::{SyncError, SyncResult};
use crate::locks::LockTable;
use crate::path_guard::PathGuard;
use crate::project::{Project, MARKER_DIR};
use crate::sync::{
    Connection, Direction, FrameReader, FrameWriter, InboundApplier, OutboundEndpoint,
    StatusCode, SyncMessage,
};
use crate::types::{AuthToken, WorldId, WorldSummary};
use crate::watcher::{ChangeWatcher, WatchOptions};

/// Client for one server
#[derive(Debug, Clone)]
pub struct SyncClient {
    origin: String,
    timings: SyncTimings,
}

impl SyncClient {
    /// Client for the server at `origin` (`host:port`)
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            timings: SyncTimings::default(),
        }
    }

    /// Override the sync timings
    pub fn with_timings(mut self, timings: SyncTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Server address
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Fetch the worlds the server hosts
    pub async fn list_worlds(&self) -> SyncResult<Vec<WorldSummary>> {
        let mut conn = Connection::connect(self.origin.as_str()).await?;
        match conn.request(SyncMessage::ListWorlds).await? {
            SyncMessage::Worlds { worlds } => Ok(worlds),
            other => Err(unexpected(&other)),
        }
    }

    /// Block until the server has seen the auth file for `auth`
    pub async fn wait_for_auth(&self, world: &WorldId, auth: &AuthToken) -> SyncResult<()> {
        let mut conn = Connection::connect(self.origin.as_str()).await?;
        let reply = conn
            .request(SyncMessage::WaitForAuth {
                world_id: world.clone(),
                auth: auth.clone(),
            })
            .await?;
        match reply {
            SyncMessage::AuthResult { success: true, .. } => Ok(()),
            SyncMessage::AuthResult { error, .. } => Err(SyncError::Unauthenticated(
                error.unwrap_or_else(|| "registration failed".into()),
            )),
            other => Err(unexpected(&other)),
        }
    }

    /// Wait for registration, then write the project marker into `root`
    pub async fn register(
        &self,
        root: impl AsRef<std::path::Path>,
        world: WorldId,
        auth: AuthToken,
    ) -> SyncResult<Project> {
        self.wait_for_auth(&world, &auth).await?;
        let project = Project::create(root, auth, world, self.origin.clone()).await?;
        info!(root = %project.root.display(), world = %project.world, "Project registered");
        Ok(project)
    }

    /// Open a change stream for a registered client
    pub async fn open_stream(
        &self,
        direction: Direction,
        world: &WorldId,
        auth: &AuthToken,
    ) -> SyncResult<(FrameReader, FrameWriter)> {
        let mut conn = Connection::connect(self.origin.as_str()).await?;
        let reply = conn
            .request(SyncMessage::OpenStream {
                direction,
                world_id: world.clone(),
                auth: auth.clone(),
            })
            .await?;
        match reply {
            SyncMessage::StreamOpened => Ok(conn.into_split()),
            SyncMessage::Status { code, message } => Err(status_error(code, message)),
            other => Err(unexpected(&other)),
        }
    }

    /// Keep `project` in sync until `cancel` fires or either direction ends.
    ///
    /// Local edits are pushed, remote edits are pulled and applied. Both
    /// directions share one lock table so applied changes are not echoed.
    pub async fn sync(&self, project: &Project, cancel: CancellationToken) -> SyncResult<()> {
        let root = project.root.canonicalize()?;
        let (mut push_reader, mut push_writer) = self
            .open_stream(Direction::Push, &project.world, &project.auth)
            .await?;
        let (mut pull_reader, _pull_writer) = self
            .open_stream(Direction::Pull, &project.world, &project.auth)
            .await?;

        let session = cancel.child_token();
        let locks = Arc::new(LockTable::new());
        let guard = PathGuard::new(&root);

        let mut watcher = ChangeWatcher::start_with(
            &root,
            session.clone(),
            WatchOptions::default().ignore(MARKER_DIR),
        )?;
        let outbound = OutboundEndpoint::new(
            guard.clone(),
            Arc::clone(&locks),
            self.timings,
            session.clone(),
        );
        let applier = InboundApplier::new(guard, locks, self.timings, session.clone());
        info!(root = %root.display(), world = %project.world, "Sync started");

        let push = async {
            let result = tokio::select! {
                result = outbound.run(&mut watcher, &mut push_writer) => result,
                // The server only speaks on a push stream to end it
                ended = push_reader.recv() => match ended {
                    Ok(Some(SyncMessage::Status { code, message })) => Err(status_error(code, message)),
                    Ok(_) => Err(SyncError::Transport("server closed the push stream".into())),
                    Err(err) => Err(err),
                },
            };
            session.cancel();
            let _ = push_writer.close().await;
            result
        };
        let pull = async {
            let result = applier.run(&mut pull_reader).await;
            session.cancel();
            match result {
                Ok(applied) => {
                    debug!(applied, "Pull stream ended");
                    Err(SyncError::Transport("server closed the pull stream".into()))
                }
                Err(err) => Err(err),
            }
        };

        let (push_result, pull_result) = tokio::join!(push, pull);
        if cancel.is_cancelled() {
            info!("Sync stopped");
            return Ok(());
        }
        for result in [push_result, pull_result] {
            if let Err(err) = result {
                if !err.is_cancelled() {
                    warn!(error = %err, "Sync session ended");
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

fn status_error(code: StatusCode, message: String) -> SyncError {
    match code {
        StatusCode::NotFound => SyncError::WorldNotFound(message),
        StatusCode::Unauthenticated => SyncError::Unauthenticated(message),
        StatusCode::Cancelled => SyncError::Cancelled,
        code => SyncError::SessionFailed { code, message },
    }
}

fn unexpected(msg: &SyncMessage) -> SyncError {
    SyncError::Protocol(format!("unexpected reply {}", msg.kind()))
}
