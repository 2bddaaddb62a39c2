//! Sandboxing of remote-declared paths
//!
//! Every path that arrives over the wire is relative to the session's sandbox
//! root. [`PathGuard`] joins it onto the root, normalizes `.` and `..`
//! lexically and rejects anything that would land outside the root (or on the
//! root itself).

use std::path::{Component, Path, PathBuf};

use crate::error::{SyncError, SyncResult};

/// Resolves wire paths against a sandbox root
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// Create a guard for the given root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: normalize(&root.into()),
        }
    }

    /// The sandbox root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative wire path to an absolute path under the root.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::PathEscape` if the path is absolute, blank, or
    /// normalizes to the root itself or anywhere outside it.
    pub fn resolve(&self, relative: &str) -> SyncResult<PathBuf> {
        // Whitespace is legal in names; only an all-blank path is rejected
        if relative.trim().is_empty() {
            return Err(SyncError::PathEscape("empty path".into()));
        }

        let candidate = Path::new(relative);
        if candidate.has_root() {
            return Err(SyncError::PathEscape(relative.to_string()));
        }

        let joined = normalize(&self.root.join(candidate));
        if joined == self.root || !joined.starts_with(&self.root) {
            return Err(SyncError::PathEscape(relative.to_string()));
        }

        Ok(joined)
    }

    /// Resolve an optional wire path, where an empty or blank string means
    /// "absent"
    pub fn resolve_optional(&self, relative: &str) -> SyncResult<Option<PathBuf>> {
        if relative.trim().is_empty() {
            return Ok(None);
        }
        self.resolve(relative).map(Some)
    }

    /// Whether the absolute path lies strictly inside the root
    pub fn contains(&self, path: &Path) -> bool {
        let path = normalize(path);
        path != self.root && path.starts_with(&self.root)
    }

    /// Convert an absolute path under the root into its wire form
    /// (`/`-separated, relative to the root).
    pub fn relativize(&self, path: &Path) -> Option<String> {
        let path = normalize(path);
        let relative = path.strip_prefix(&self.root).ok()?;

        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();

        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }
}

/// Lexically normalize a path: drop `.`, fold `..` into the parent.
///
/// `..` at the top of a relative path is kept so that escapes stay visible to
/// the `starts_with` check.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                ) && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
