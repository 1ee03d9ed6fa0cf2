//! Durable whole-record storage.
//!
//! The registry and the gate table each persist one record, always
//! rewritten in full. A [`DurableStore`] must make each rewrite atomic:
//! a reader sees either the previous record or the new one.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::errors::StoreError;

/// Atomic read/rewrite of named records.
#[cfg_attr(test, mockall::automock)]
pub trait DurableStore: Send + Sync {
    /// Reads a record. `Ok(None)` means it was never written.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replaces a record atomically.
    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}
