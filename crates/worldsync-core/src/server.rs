//! Sync server
//!
//! Accepts one TCP connection per request. A connection's first frame says
//! what it is for: listing worlds, waiting for a registration, or a push or
//! pull change stream for a registered client directory.
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(WorldRegistry::load("worlds.yaml")?);
//! let server = SyncServer::new(ServerConfig::default(), registry);
//! server.run(CancellationToken::new()).await?;
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{locate_client_root, AuthChallenge};
use crate::config::ServerConfig;
use crate::error::{SyncError, SyncResult};
use crate::locks::LockRegistry;
use crate::path_guard::PathGuard;
use crate::registry::WorldRegistry;
use crate::sync::{
    Connection, Direction, FrameReader, FrameWriter, InboundApplier, OutboundEndpoint,
    StatusCode, SyncMessage,
};
use crate::types::{AuthToken, WorldId};
use crate::watcher::ChangeWatcher;

/// Serves the worlds of a [`WorldRegistry`]
#[derive(Debug, Clone)]
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<WorldRegistry>,
    locks: Arc<LockRegistry>,
}

impl SyncServer {
    /// Create a server over a registry
    pub fn new(config: ServerConfig, registry: Arc<WorldRegistry>) -> Self {
        Self {
            config,
            registry,
            locks: Arc::new(LockRegistry::new()),
        }
    }

    /// The world registry
    pub fn registry(&self) -> &Arc<WorldRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> SyncResult<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> SyncResult<()> {
        info!(addr = %listener.local_addr()?, worlds = self.registry.len(), "Server listening");
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let server = self.clone();
            let session = shutdown.child_token();
            tokio::spawn(async move {
                let conn = match Connection::from_stream(stream) {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(%peer, error = %err, "Failed to set up connection");
                        return;
                    }
                };
                match server.handle_connection(conn, session).await {
                    Ok(()) => debug!(%peer, "Connection finished"),
                    Err(err) if err.is_cancelled() => debug!(%peer, "Connection cancelled"),
                    Err(err) => warn!(%peer, error = %err, "Connection failed"),
                }
            });
        }
    }

    async fn handle_connection(&self, conn: Connection, cancel: CancellationToken) -> SyncResult<()> {
        let peer = conn.peer_addr();
        let (mut reader, mut writer) = conn.into_split();
        let Some(request) = reader.recv().await? else {
            return Ok(());
        };
        debug!(%peer, kind = request.kind(), "Request received");

        match request {
            SyncMessage::ListWorlds => {
                writer
                    .send(SyncMessage::Worlds {
                        worlds: self.registry.summaries(),
                    })
                    .await
            }
            SyncMessage::WaitForAuth { world_id, auth } => {
                let reply = self.wait_for_auth(&world_id, auth, &mut reader, &cancel).await;
                writer.send(reply).await
            }
            SyncMessage::OpenStream {
                direction,
                world_id,
                auth,
            } => {
                self.stream_session(peer, direction, &world_id, &auth, reader, writer, cancel)
                    .await
            }
            other => {
                writer
                    .send(SyncMessage::status(
                        StatusCode::Aborted,
                        format!("unexpected request {}", other.kind()),
                    ))
                    .await
            }
        }
    }

    async fn wait_for_auth(
        &self,
        world_id: &WorldId,
        auth: AuthToken,
        reader: &mut FrameReader,
        cancel: &CancellationToken,
    ) -> SyncMessage {
        let failed = |error: String| SyncMessage::AuthResult {
            success: false,
            error: Some(error),
        };

        let Some(world) = self.registry.get(world_id) else {
            return failed(format!("World with id {world_id} not found"));
        };

        info!(world = %world_id, "Waiting for client registration");
        let wait_cancel = cancel.child_token();
        let challenge = AuthChallenge::new(world.root(), auth)
            .with_retry_interval(self.config.timings.retry_interval)
            .wait(wait_cancel.clone());
        let bounded = tokio::time::timeout(self.config.auth_timeout, challenge);

        let result = tokio::select! {
            result = bounded => match result {
                Ok(found) => found,
                Err(_) => Err(SyncError::AuthTimeout),
            },
            // The client hanging up abandons the wait
            _ = reader.recv() => {
                wait_cancel.cancel();
                Err(SyncError::Cancelled)
            }
        };

        match result {
            Ok(path) => {
                info!(world = %world_id, path = %path.display(), "Client registered");
                SyncMessage::AuthResult {
                    success: true,
                    error: None,
                }
            }
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(world = %world_id, error = %err, "Registration failed");
                }
                failed(err.to_string())
            }
        }
    }

    /// Find the sandbox root for a world/auth pair
    pub async fn client_root(&self, world_id: &WorldId, auth: &AuthToken) -> SyncResult<PathBuf> {
        let world = self
            .registry
            .get(world_id)
            .ok_or_else(|| SyncError::WorldNotFound(world_id.to_string()))?;
        if auth.is_blank() {
            return Err(SyncError::Unauthenticated("blank auth id".into()));
        }
        locate_client_root(world.root(), auth)
            .await?
            .ok_or_else(|| SyncError::Unauthenticated("no client directory for auth id".into()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_session(
        &self,
        peer: SocketAddr,
        direction: Direction,
        world_id: &WorldId,
        auth: &AuthToken,
        mut reader: FrameReader,
        mut writer: FrameWriter,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        let root = match self.client_root(world_id, auth).await {
            Ok(root) => root,
            Err(err) => {
                debug!(%peer, error = %err, "Rejected stream");
                let _ = writer
                    .send(SyncMessage::status(err.status_code(), err.to_string()))
                    .await;
                return Ok(());
            }
        };
        writer.send(SyncMessage::StreamOpened).await?;
        info!(%peer, ?direction, world = %world_id, root = %root.display(), "Stream opened");

        let guard = PathGuard::new(&root);
        let locks = self.locks.for_root(&root);
        let timings = self.config.timings;

        let result = match direction {
            Direction::Push => {
                let applier = InboundApplier::new(guard, locks, timings, cancel.clone());
                applier.run(&mut reader).await.map(|applied| {
                    debug!(%peer, applied, "Push stream ended");
                })
            }
            Direction::Pull => match ChangeWatcher::start(&root, cancel.clone()) {
                Ok(mut watcher) => {
                    let outbound = OutboundEndpoint::new(guard, locks, timings, cancel.clone());
                    tokio::select! {
                        result = outbound.run(&mut watcher, &mut writer) => result,
                        // Pull clients never send after the request; EOF means gone
                        _ = reader.recv() => {
                            debug!(%peer, "Pull client disconnected");
                            cancel.cancel();
                            Ok(())
                        }
                    }
                }
                Err(err) => Err(err),
            },
        };

        let status = match &result {
            Ok(()) => SyncMessage::status(StatusCode::Ok, ""),
            Err(err) => SyncMessage::status(err.status_code(), err.to_string()),
        };
        let _ = writer.send(status).await;

        match result {
            Err(err) if !err.is_cancelled() => {
                warn!(%peer, ?direction, error = %err, "Stream failed");
                Err(err)
            }
            _ => Ok(()),
        }
    }
}
