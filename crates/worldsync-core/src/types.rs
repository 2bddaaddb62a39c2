//! Core types for WorldSync

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier of a world in the server's registry
///
/// A world is a directory on the server holding one subdirectory per
/// registered client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorldId(pub String);

impl WorldId {
    /// Create a WorldId from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty or whitespace only
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for WorldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorldId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-client authentication identifier
///
/// An opaque token minted by the client at registration time. The client
/// proves ownership of a directory by dropping the token into the auth file
/// at that directory's root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthToken(pub String);

impl AuthToken {
    /// Mint a new random token
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wrap an existing token string
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the raw token
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the token is empty or whitespace only
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Compare against the contents of an auth file, ignoring line terminators
    pub fn matches_file_contents(&self, contents: &str) -> bool {
        !self.is_blank() && contents.trim_end_matches(['\r', '\n']) == self.0
    }
}

impl std::fmt::Display for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A world loaded from the registry. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct World {
    /// Registry key
    pub id: WorldId,
    /// Friendly name shown to clients
    pub display_name: String,
    /// Absolute path to the world folder
    pub root_path: PathBuf,
}

impl World {
    /// Root directory of the world
    pub fn root(&self) -> &Path {
        &self.root_path
    }

    /// Public view of the world sent to clients
    pub fn summary(&self) -> WorldSummary {
        WorldSummary {
            id: self.id.clone(),
            name: self.display_name.clone(),
        }
    }
}

/// The part of a [`World`] that clients are allowed to see
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSummary {
    /// Registry key
    pub id: WorldId,
    /// Friendly name
    pub name: String,
}
