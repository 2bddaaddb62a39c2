//! World registry backed by a YAML file
//!
//! ```yaml
//! example-world:
//!   name: Example World
//!   path: /worlds/example-world
//! ```
//!
//! Lookups read an immutable snapshot; a reload builds a complete new map and
//! swaps it in, so readers see either the old set of worlds or the new one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::types::{World, WorldId, WorldSummary};

/// How long file changes are coalesced before a reload
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

/// One entry of the registry file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldEntry {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// World folder
    #[serde(default)]
    pub path: String,
}

type Snapshot = Arc<HashMap<WorldId, World>>;

/// The set of worlds a server hosts
#[derive(Debug)]
pub struct WorldRegistry {
    file: Option<PathBuf>,
    snapshot: RwLock<Snapshot>,
}

impl WorldRegistry {
    /// In-memory registry, never reloaded
    pub fn from_worlds(worlds: impl IntoIterator<Item = World>) -> Self {
        let map = worlds.into_iter().map(|w| (w.id.clone(), w)).collect();
        Self {
            file: None,
            snapshot: RwLock::new(Arc::new(map)),
        }
    }

    /// Load the registry file, writing a default one first if it is missing
    pub fn load(file: impl AsRef<Path>) -> SyncResult<Self> {
        let file = file.as_ref();
        if !file.exists() {
            write_default(file)?;
            info!(file = %file.display(), "Created default world registry");
        }
        let file = file.canonicalize()?;
        let worlds = read_worlds(&file)?;
        info!(count = worlds.len(), "Worlds loaded");
        Ok(Self {
            file: Some(file),
            snapshot: RwLock::new(Arc::new(worlds)),
        })
    }

    /// Look up a world
    pub fn get(&self, id: &WorldId) -> Option<World> {
        self.snapshot.read().get(id).cloned()
    }

    /// Current snapshot of all worlds
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.snapshot.read())
    }

    /// Public view of every world, ordered by id
    pub fn summaries(&self) -> Vec<WorldSummary> {
        let snapshot = self.snapshot();
        let mut summaries: Vec<_> = snapshot.values().map(World::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Number of loaded worlds
    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    /// Whether no world is loaded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the file and swap in the result.
    ///
    /// On failure the previous snapshot stays in place.
    pub fn reload(&self) -> SyncResult<usize> {
        let Some(file) = &self.file else {
            return Ok(self.len());
        };
        let worlds = read_worlds(file)?;
        let count = worlds.len();
        *self.snapshot.write() = Arc::new(worlds);
        info!(count, "Worlds reloaded");
        Ok(count)
    }

    /// Reload whenever the registry file changes.
    ///
    /// Watching stops when the returned handle is dropped.
    pub fn watch(self: &Arc<Self>) -> SyncResult<RegistryWatcher> {
        let Some(file) = self.file.clone() else {
            return Err(SyncError::Registry("registry has no backing file".into()));
        };
        let dir = file
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| SyncError::Registry("registry file has no parent".into()))?;

        let registry = Arc::clone(self);
        let target = file.clone();
        let mut debouncer = new_debouncer(RELOAD_DEBOUNCE, move |res: DebounceEventResult| {
            match res {
                Ok(events) => {
                    if !events.iter().any(|e| e.path == target) {
                        return;
                    }
                    if let Err(err) = registry.reload() {
                        error!(error = %err, "Failed to reload worlds, keeping previous set");
                    }
                }
                Err(err) => warn!(error = %err, "Registry watcher error"),
            }
        })?;
        debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive)?;
        debug!(file = %file.display(), "Watching world registry");

        Ok(RegistryWatcher {
            _debouncer: debouncer,
        })
    }
}

/// Keeps the registry file watcher alive
pub struct RegistryWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
}

impl std::fmt::Debug for RegistryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryWatcher").finish_non_exhaustive()
    }
}

/// Parse registry YAML and keep only valid entries.
///
/// Relative world paths are taken relative to `base`.
pub fn parse_worlds(yaml: &str, base: &Path) -> SyncResult<HashMap<WorldId, World>> {
    if yaml.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let entries: BTreeMap<String, WorldEntry> = serde_yaml::from_str(yaml)?;

    let mut worlds = HashMap::with_capacity(entries.len());
    for (id, entry) in entries {
        if id.trim().is_empty() {
            error!("Failed to load world: world id can't be blank");
            continue;
        }
        if entry.name.trim().is_empty() {
            error!(world = %id, "Failed to load world: world name can't be blank");
            continue;
        }
        if entry.path.trim().is_empty() {
            error!(world = %id, "Failed to load world: world path can't be blank");
            continue;
        }
        let root = base.join(entry.path.trim());
        if !root.is_dir() {
            error!(world = %id, path = %root.display(), "Failed to load world: world folder does not exist");
            continue;
        }

        let id = WorldId::new(id);
        worlds.insert(
            id.clone(),
            World {
                id,
                display_name: entry.name,
                root_path: root,
            },
        );
    }
    Ok(worlds)
}

fn read_worlds(file: &Path) -> SyncResult<HashMap<WorldId, World>> {
    let yaml = std::fs::read_to_string(file)?;
    let base = file.parent().unwrap_or_else(|| Path::new("."));
    parse_worlds(&yaml, base)
}

fn write_default(file: &Path) -> SyncResult<()> {
    let mut entries = BTreeMap::new();
    entries.insert(
        "example-world".to_string(),
        WorldEntry {
            name: "Example World".into(),
            path: "/worlds/example-world".into(),
        },
    );
    std::fs::write(file, serde_yaml::to_string(&entries)?)?;
    Ok(())
}
