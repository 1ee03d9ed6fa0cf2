//! In-memory store.

use super::DurableStore;
use crate::errors::StoreError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Keeps records in memory. Useful in tests and for ephemeral runtimes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes performed so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Replaces a record without counting it as a write.
    pub fn seed(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.records.write().insert(key.into(), bytes.into());
    }
}

impl DurableStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.read().get(key).cloned())
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.records.write().insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let store = MemoryStore::new();
        store.write("k", b"v").unwrap();
        assert_eq!(store.read("k").unwrap().unwrap(), b"v");
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_seed_does_not_count() {
        let store = MemoryStore::new();
        store.seed("k", "v");
        assert_eq!(store.write_count(), 0);
        assert!(store.read("k").unwrap().is_some());
    }
}
