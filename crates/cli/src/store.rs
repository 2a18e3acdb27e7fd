//! File-backed key-value store for headless hosts.

use std::{collections::HashMap, fs, path::PathBuf};

use anyhow::{Context, Result};
use hotpatch_core::host::KeyValueStore;
use parking_lot::Mutex;
use tracing::warn;

/// [`KeyValueStore`] persisted as a single JSON object file.
///
/// Writes go through to disk immediately; a corrupt or missing file on load
/// just starts empty, matching how an engine's local storage behaves.
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Open or create a store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(values) => values,
                Err(err) => {
                    warn!("state file {} is corrupt, starting empty: {err}", path.display());
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn flush(&self, values: &HashMap<String, String>) {
        match serde_json::to_string_pretty(values) {
            Ok(serialized) => {
                if let Err(err) = fs::write(&self.path, serialized) {
                    warn!("failed to write state file {}: {err}", self.path.display());
                }
            }
            Err(err) => warn!("failed to serialize state: {err}"),
        }
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.to_string());
        self.flush(&values);
    }

    fn remove(&self, key: &str) {
        let mut values = self.values.lock();
        if values.remove(key).is_some() {
            self.flush(&values);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set("hotUpdateReady", "true");
        drop(store);

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get("hotUpdateReady").as_deref(), Some("true"));

        store.remove("hotUpdateReady");
        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.get("hotUpdateReady").is_none());
    }

    #[test]
    fn corrupt_state_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{{{ nope").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.get("anything").is_none());
    }
}
