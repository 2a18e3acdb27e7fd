//! Traits for the capabilities the host process supplies.
//!
//! The core consumes these and implements none of them, beyond the
//! in-memory store and no-op hooks used by tests and simple embeddings.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Durable string key-value storage delegated to the host.
///
/// The core only ever gets, sets and removes strings; durability and
/// placement are the host's business.
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if the key is absent.
    fn get(&self, key: &str) -> Option<String>;
    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str);
    /// Remove a key if present.
    fn remove(&self, key: &str);
}

/// Hooks the orchestrator invokes when an update has been promoted.
pub trait HostHooks: Send + Sync {
    /// Drop any in-memory asset caches so re-resolution hits the new
    /// search path.
    fn invalidate_assets(&self);
    /// Ask the host to restart or reload so previously resolved assets are
    /// resolved again.
    fn request_restart(&self);
}

/// Hooks implementation that does nothing. Suitable for headless hosts and
/// tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHooks;

impl HostHooks for NullHooks {
    fn invalidate_assets(&self) {}
    fn request_restart(&self) {}
}

/// In-memory [`KeyValueStore`], useful for tests and ephemeral embeddings.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }
}
