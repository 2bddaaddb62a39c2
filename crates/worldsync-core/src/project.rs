//! Local project marker
//!
//! A synced directory carries a hidden `.worldsync/` folder with three plain
//! text files: `auth` (the client token), `world` (the world id) and `origin`
//! (the server address).

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::types::{AuthToken, WorldId};

/// Name of the marker directory
pub const MARKER_DIR: &str = ".worldsync";

const AUTH_FILE: &str = "auth";
const WORLD_FILE: &str = "world";
const ORIGIN_FILE: &str = "origin";

/// A directory bound to a world on a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Directory being synced
    pub root: PathBuf,
    /// Client token
    pub auth: AuthToken,
    /// World the directory belongs to
    pub world: WorldId,
    /// Server address (`host:port`)
    pub origin: String,
}

impl Project {
    /// Load the marker from `root`.
    ///
    /// Returns `Ok(None)` when `root` has no marker directory.
    ///
    /// # Errors
    ///
    /// `SyncError::InvalidProject` when the marker exists but a file is
    /// missing or blank.
    pub async fn load(root: impl AsRef<Path>) -> SyncResult<Option<Self>> {
        let root = root.as_ref();
        let marker = root.join(MARKER_DIR);
        if !fs::metadata(&marker).await.is_ok_and(|m| m.is_dir()) {
            return Ok(None);
        }

        let auth = read_field(&marker, AUTH_FILE).await?;
        let world = read_field(&marker, WORLD_FILE).await?;
        let origin = read_field(&marker, ORIGIN_FILE).await?;

        debug!(root = %root.display(), world = %world, "Loaded project");
        Ok(Some(Self {
            root: root.to_path_buf(),
            auth: AuthToken::new(auth),
            world: WorldId::new(world),
            origin,
        }))
    }

    /// Write a new marker into `root`, replacing any existing one
    pub async fn create(
        root: impl AsRef<Path>,
        auth: AuthToken,
        world: WorldId,
        origin: impl Into<String>,
    ) -> SyncResult<Self> {
        let root = root.as_ref();
        let origin = origin.into();
        let marker = root.join(MARKER_DIR);
        fs::create_dir_all(&marker).await?;

        fs::write(marker.join(AUTH_FILE), auth.as_str()).await?;
        fs::write(marker.join(WORLD_FILE), world.as_str()).await?;
        fs::write(marker.join(ORIGIN_FILE), &origin).await?;

        Ok(Self {
            root: root.to_path_buf(),
            auth,
            world,
            origin,
        })
    }

    /// Path of the marker directory
    pub fn marker_dir(&self) -> PathBuf {
        self.root.join(MARKER_DIR)
    }
}

async fn read_field(marker: &Path, name: &str) -> SyncResult<String> {
    let path = marker.join(name);
    let value = match fs::read_to_string(&path).await {
        Ok(value) => value,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(SyncError::InvalidProject(format!("missing {name} file")));
        }
        Err(err) => return Err(err.into()),
    };
    let value = value.trim();
    if value.is_empty() {
        return Err(SyncError::InvalidProject(format!("{name} is blank")));
    }
    Ok(value.to_string())
}
