//! In-memory snapshot cache for testing and examples.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, RwLock},
};

use crate::cache::ProjectionCache;

/// Thread-safe in-memory cache; clones share the same storage.
#[derive(Clone, Debug, Default)]
pub struct Cache {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl Cache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a snapshot is stored under `full_name`.
    #[must_use]
    pub fn contains(&self, full_name: &str) -> bool {
        self.entries
            .read()
            .expect("in-memory cache lock poisoned")
            .contains_key(full_name)
    }

    /// Number of stored snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("in-memory cache lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProjectionCache for Cache {
    type Error = Infallible;

    async fn read(&self, full_name: &str) -> Result<Option<Vec<u8>>, Infallible> {
        let entries = self.entries.read().expect("in-memory cache lock poisoned");
        Ok(entries.get(full_name).cloned())
    }

    async fn write(&self, full_name: &str, bytes: &[u8]) -> Result<(), Infallible> {
        let mut entries = self.entries.write().expect("in-memory cache lock poisoned");
        entries.insert(full_name.to_string(), bytes.to_vec());
        tracing::trace!(full_name, len = bytes.len(), "snapshot stored");
        Ok(())
    }
}
