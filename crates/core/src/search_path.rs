//! Ordered asset-resolution roots, persisted across restarts.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::host::KeyValueStore;

/// Durable key the path list is persisted under.
pub const SEARCH_PATHS_KEY: &str = "HotUpdateSearchPaths";

/// Ordered list of root directories consulted when resolving a relative
/// asset path, most significant first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPathList {
    paths: Vec<String>,
}

impl SearchPathList {
    /// List seeded with the host's default roots.
    pub fn new(defaults: impl IntoIterator<Item = String>) -> Self {
        Self {
            paths: defaults.into_iter().collect(),
        }
    }

    /// Current paths in priority order.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Move `path` to the highest-priority position.
    ///
    /// Any existing occurrence is removed first, so repeated promotion is
    /// idempotent and the path appears exactly once, at index 0.
    pub fn promote(&mut self, path: &str) {
        self.paths.retain(|existing| existing != path);
        self.paths.insert(0, path.to_string());
    }

    /// Serialize the list into durable storage as a JSON string array.
    pub fn persist(&self, store: &dyn KeyValueStore) {
        match serde_json::to_string(&self.paths) {
            Ok(serialized) => store.set(SEARCH_PATHS_KEY, &serialized),
            Err(err) => warn!("failed to serialize search paths: {err}"),
        }
    }

    /// Restore the list from durable storage.
    ///
    /// A missing or corrupt persisted value falls back to the host's
    /// defaults; the host must never be left without its built-in roots.
    pub fn restore(
        store: &dyn KeyValueStore,
        defaults: impl IntoIterator<Item = String>,
    ) -> Self {
        match store.get(SEARCH_PATHS_KEY) {
            Some(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(paths) => Self { paths },
                Err(err) => {
                    warn!("persisted search paths are corrupt, using defaults: {err}");
                    Self::new(defaults)
                }
            },
            None => Self::new(defaults),
        }
    }
}

/// Thread-safe handle to the process-wide search path list.
///
/// The host's asset loader reads it before every resolution; the
/// orchestrator mutates it only while promoting a finished update.
#[derive(Debug, Clone, Default)]
pub struct SharedSearchPaths {
    inner: Arc<RwLock<SearchPathList>>,
}

impl SharedSearchPaths {
    /// Wrap an existing list.
    pub fn new(list: SearchPathList) -> Self {
        Self {
            inner: Arc::new(RwLock::new(list)),
        }
    }

    /// Snapshot of the current paths in priority order.
    pub fn get_paths(&self) -> Vec<String> {
        self.inner.read().paths().to_vec()
    }

    /// Promote `path` and persist the result in one step.
    pub fn promote_and_persist(&self, path: &str, store: &dyn KeyValueStore) {
        let mut list = self.inner.write();
        list.promote(path);
        list.persist(store);
    }
}
