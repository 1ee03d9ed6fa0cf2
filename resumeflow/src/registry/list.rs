//! The persisted list of running executions.

use super::lane::{settle, PersistLane};
use crate::config::RuntimeConfig;
use crate::context::ExecutionOwner;
use crate::errors::StoreError;
use crate::execution::{ExecutionLoader, FlowExecution};
use crate::store::DurableStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Format version of the registry record.
pub const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryRecord {
    version: u32,
    owners: Vec<ExecutionOwner>,
}

/// Tracks every top-level execution that has not finished.
pub struct ExecutionRegistry {
    key: String,
    owners: Mutex<Vec<ExecutionOwner>>,
    lane: PersistLane,
    loader: Arc<dyn ExecutionLoader>,
}

impl ExecutionRegistry {
    /// Opens the registry, reading back the persisted owners.
    ///
    /// An unreadable or corrupt record is logged and treated as empty.
    /// Must be called from within a tokio runtime.
    pub fn open(
        store: Arc<dyn DurableStore>,
        key: impl Into<String>,
        loader: Arc<dyn ExecutionLoader>,
    ) -> Result<Self, StoreError> {
        let key = key.into();
        let owners = Self::load_owners(store.as_ref(), &key);
        info!(key = %key, owners = owners.len(), "Opened execution registry");
        Ok(Self {
            key,
            owners: Mutex::new(owners),
            lane: PersistLane::spawn(store)?,
            loader,
        })
    }

    /// Opens the registry under the configured record key.
    pub fn from_config(
        store: Arc<dyn DurableStore>,
        config: &RuntimeConfig,
        loader: Arc<dyn ExecutionLoader>,
    ) -> Result<Self, StoreError> {
        Self::open(store, config.registry_key.clone(), loader)
    }

    fn load_owners(store: &dyn DurableStore, key: &str) -> Vec<ExecutionOwner> {
        let bytes = match store.read(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(key = %key, error = %err, "Could not read execution registry; starting empty");
                return Vec::new();
            }
        };
        match serde_json::from_slice::<RegistryRecord>(&bytes) {
            Ok(record) if record.version == REGISTRY_VERSION => record.owners,
            Ok(record) => {
                warn!(key = %key, version = record.version, "Unsupported registry version; starting empty");
                Vec::new()
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Corrupt execution registry; starting empty");
                Vec::new()
            }
        }
    }

    /// Adds an owner. Returns once the new record is durable.
    pub async fn register(&self, owner: ExecutionOwner) -> Result<(), StoreError> {
        let done = {
            let mut owners = self.owners.lock();
            if !owners.contains(&owner) {
                debug!(owner = %owner, "Registering execution");
                owners.push(owner);
            }
            self.submit(&owners)?
        };
        settle(done).await
    }

    /// Removes an owner. Returns once the new record is durable.
    pub async fn unregister(&self, owner: &ExecutionOwner) -> Result<(), StoreError> {
        let done = {
            let mut owners = self.owners.lock();
            owners.retain(|existing| existing != owner);
            debug!(owner = %owner, "Unregistering execution");
            self.submit(&owners)?
        };
        settle(done).await
    }

    /// Waits until every write queued so far is durable.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let done = {
            let owners = self.owners.lock();
            self.submit(&owners)?
        };
        settle(done).await
    }

    /// The owners currently registered, in registration order.
    #[must_use]
    pub fn owners(&self) -> Vec<ExecutionOwner> {
        self.owners.lock().clone()
    }

    /// Lazily resolves every registered owner to its live execution.
    ///
    /// Owners whose execution finished or fails to load are dropped from the
    /// registry as they are encountered. Each call re-scans from the start.
    #[must_use]
    pub fn iter(&self) -> RegistryIter<'_> {
        RegistryIter {
            registry: self,
            pending: self.owners().into_iter(),
        }
    }

    fn submit(
        &self,
        owners: &[ExecutionOwner],
    ) -> Result<oneshot::Receiver<Result<(), StoreError>>, StoreError> {
        let record = RegistryRecord {
            version: REGISTRY_VERSION,
            owners: owners.to_vec(),
        };
        let bytes = serde_json::to_vec(&record)?;
        Ok(self.lane.submit(&self.key, bytes))
    }

    fn prune(&self, owner: &ExecutionOwner) {
        let mut owners = self.owners.lock();
        owners.retain(|existing| existing != owner);
        if let Err(err) = self.submit(&owners) {
            warn!(owner = %owner, error = %err, "Could not queue registry write");
        }
    }
}

impl fmt::Debug for ExecutionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRegistry")
            .field("key", &self.key)
            .field("owners", &self.owners.lock().len())
            .finish_non_exhaustive()
    }
}

/// Lazy iteration over live executions.
pub struct RegistryIter<'a> {
    registry: &'a ExecutionRegistry,
    pending: std::vec::IntoIter<ExecutionOwner>,
}

impl Iterator for RegistryIter<'_> {
    type Item = Arc<dyn FlowExecution>;

    fn next(&mut self) -> Option<Self::Item> {
        for owner in self.pending.by_ref() {
            match owner.get(self.registry.loader.as_ref()) {
                Ok(execution) if execution.is_complete() => {
                    debug!(owner = %owner, "Pruning finished execution");
                    self.registry.prune(&owner);
                }
                Ok(execution) => return Some(execution),
                Err(err) => {
                    warn!(owner = %owner, error = %err, "Dropping execution that failed to load");
                    self.registry.prune(&owner);
                }
            }
        }
        None
    }
}
