//! File-backed store.

use super::DurableStore;
use crate::config::RuntimeConfig;
use crate::errors::StoreError;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Stores each record as a file in one directory.
///
/// Writes go to a temporary sibling which is renamed over the record.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    sync: bool,
}

impl FileStore {
    /// Opens (and creates) the directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(dir.display().to_string(), e))?;
        Ok(Self { dir, sync: true })
    }

    /// Opens the configured state directory with the configured sync policy.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, StoreError> {
        Ok(Self::open(&config.state_dir)?.with_sync(config.sync_writes))
    }

    /// Sets whether writes are synced to disk before the rename.
    #[must_use]
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// The directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn temp_path_of(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.tmp"))
    }
}

impl DurableStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_of(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_of(key);
        let tmp = self.temp_path_of(key);

        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            if self.sync {
                file.sync_all()?;
            }
            fs::rename(&tmp, &path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(key, e));
        }
        debug!(key = %key, bytes = bytes.len(), "Record written");
        Ok(())
    }
}
