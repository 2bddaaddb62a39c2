//! WorldSync Core Library
//!
//! Continuous two-way synchronization of a local directory tree with a
//! directory on a server, without echoing applied changes back.
//!
//! ## Overview
//!
//! A server hosts *worlds*: folders holding one subdirectory per client
//! machine. A client registers by dropping a token file into its
//! subdirectory, then streams its local edits to the server and applies the
//! server-side edits it receives.
//!
//! ## Building blocks
//!
//! - [`watcher::ChangeWatcher`]: serialized, single-consumer change events
//!   for a directory tree
//! - [`locks::LockTable`]: echo suppression shared by the watcher consumer
//!   and the applier of the same tree
//! - [`sync::OutboundEndpoint`] / [`sync::InboundApplier`]: the two halves
//!   of the change protocol
//! - [`path_guard::PathGuard`]: confines remote paths to a sandbox root
//! - [`server::SyncServer`] / [`client::SyncClient`]: the TCP endpoints
//!
//! ## Quick Start
//!
//! ```ignore
//! use worldsync_core::{Project, SyncClient};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let project = Project::load(".").await?.expect("not registered");
//!     let client = SyncClient::new(project.origin.clone());
//!     client.sync(&project, CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod locks;
pub mod path_guard;
pub mod project;
pub mod registry;
pub mod server;
pub mod sync;
pub mod types;
pub mod watcher;

// Re-exports
pub use auth::{locate_client_root, AuthChallenge, AUTH_FILE_NAME};
pub use client::SyncClient;
pub use config::{ServerConfig, SyncTimings, DEFAULT_PORT, DEFAULT_WORLDS_FILE};
pub use error::{SyncError, SyncResult};
pub use locks::{LockRegistry, LockTable};
pub use path_guard::PathGuard;
pub use project::{Project, MARKER_DIR};
pub use registry::{RegistryWatcher, WorldRegistry};
pub use server::SyncServer;
pub use sync::{
    ChangeSink, ChangeSource, Connection, Direction, FileChanged, InboundApplier,
    OutboundEndpoint, StatusCode, SyncMessage, WireMessage,
};
pub use types::*;
pub use watcher::{ChangeEvent, ChangeKind, ChangeWatcher, WatchOptions};
