//! The process-wide gate controller.

use super::table::{BuildOracle, Effect, GateRecord, GateState, GateTable, Reattach, GATE_TABLE_VERSION};
use crate::config::RuntimeConfig;
use crate::context::{ExecutionOwner, StepContext};
use crate::errors::{GateError, RunResult, StoreError};
use crate::host::RunListener;
use crate::store::DurableStore;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Admits builds into named gates, at most `capacity` at a time, with a
/// single newest waiter per gate.
///
/// Every call runs under one lock. The whole table is written to the store
/// before the lock is released; contexts are completed afterwards.
pub struct GateController {
    store: Arc<dyn DurableStore>,
    key: String,
    table: Mutex<GateTable>,
    oracle: Option<Arc<dyn BuildOracle>>,
}

impl GateController {
    /// Opens the controller, reading back the persisted table.
    ///
    /// A corrupt or unsupported record is logged and treated as empty.
    pub fn open(store: Arc<dyn DurableStore>, key: impl Into<String>) -> Result<Self, GateError> {
        let key = key.into();
        let table = match store.read(&key)? {
            None => GateTable::default(),
            Some(bytes) => match serde_json::from_slice::<GateRecord>(&bytes) {
                Ok(record) if record.version == GATE_TABLE_VERSION => GateTable::from_record(record),
                Ok(record) => {
                    warn!(key = %key, version = record.version, "Unsupported gate table version; starting empty");
                    GateTable::default()
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "Corrupt gate table; starting empty");
                    GateTable::default()
                }
            },
        };
        info!(key = %key, jobs = table.jobs().len(), "Opened gate controller");
        Ok(Self {
            store,
            key,
            table: Mutex::new(table),
            oracle: None,
        })
    }

    /// Opens the controller under the configured record key.
    pub fn from_config(store: Arc<dyn DurableStore>, config: &RuntimeConfig) -> Result<Self, GateError> {
        Self::open(store, config.gates_key.clone())
    }

    /// Prunes holders whose build the oracle no longer knows.
    #[must_use]
    pub fn with_oracle(mut self, oracle: Arc<dyn BuildOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Enters `build` into `gate` of `job`.
    ///
    /// The context is completed when the build is admitted, or failed when a
    /// newer build takes its place. Entering a gate the build is already
    /// waiting for is a programming error.
    pub fn enter(
        &self,
        ctx: &StepContext,
        job: &str,
        gate: &str,
        build: u64,
        capacity: Option<u32>,
    ) -> Result<(), GateError> {
        debug!(job, gate, build, ?capacity, "Entering gate");
        let effects = {
            let mut table = self.table.lock();
            let effects = table.enter(ctx, job, gate, build, capacity, self.oracle.as_deref())?;
            self.save(&table);
            effects
        };
        apply(effects);
        Ok(())
    }

    /// Releases everything `job#build` holds.
    pub fn build_completed(&self, job: &str, build: u64) {
        let effects = {
            let mut table = self.table.lock();
            let Some(effects) = table.build_completed(job, build, self.oracle.as_deref()) else {
                return;
            };
            debug!(job, build, "Build left all gates");
            self.save(&table);
            effects
        };
        apply(effects);
    }

    /// Rebinds a resumed waiter. A build the table no longer knows enters again.
    pub(crate) fn reattach(
        &self,
        ctx: &StepContext,
        job: &str,
        gate: &str,
        build: u64,
        capacity: Option<u32>,
    ) -> Result<(), GateError> {
        let effects = {
            let mut table = self.table.lock();
            match table.reattach(ctx, job, gate, build) {
                Reattach::Decided(effects) => {
                    self.save(&table);
                    effects
                }
                Reattach::Waiting => {
                    debug!(job, gate, build, "Waiter reattached");
                    return Ok(());
                }
                Reattach::Unknown => {
                    drop(table);
                    warn!(job, gate, build, "Gate table lost this build; entering again");
                    return self.enter(ctx, job, gate, build, capacity);
                }
            }
        };
        apply(effects);
        Ok(())
    }

    pub(crate) fn detach(&self, job: &str, gate: &str, build: u64) {
        self.table.lock().detach(job, gate, build);
    }

    /// Removes a waiting build. Returns false if it was not waiting.
    pub(crate) fn withdraw(&self, job: &str, gate: &str, build: u64) -> bool {
        let effects = {
            let mut table = self.table.lock();
            let Some(effects) = table.withdraw(job, gate, build, self.oracle.as_deref()) else {
                return false;
            };
            self.save(&table);
            effects
        };
        apply(effects);
        true
    }

    /// A copy of one gate's state.
    #[must_use]
    pub fn gate(&self, job: &str, gate: &str) -> Option<GateState> {
        self.table.lock().gate(job, gate).cloned()
    }

    /// A copy of the whole table.
    #[must_use]
    pub fn gates(&self) -> BTreeMap<String, BTreeMap<String, GateState>> {
        self.table.lock().jobs().clone()
    }

    /// Writes the table now.
    pub fn flush(&self) -> Result<(), GateError> {
        let table = self.table.lock();
        self.write(&table)?;
        Ok(())
    }

    fn save(&self, table: &GateTable) {
        if let Err(err) = self.write(table) {
            warn!(key = %self.key, error = %err, "Could not persist gate table");
        }
    }

    fn write(&self, table: &GateTable) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&table.to_record())?;
        self.store.write(&self.key, &bytes)
    }
}

fn apply(effects: Vec<Effect>) {
    for effect in effects {
        effect.apply();
    }
}

impl RunListener for GateController {
    fn on_completed(&self, owner: &ExecutionOwner, _result: RunResult) {
        self.build_completed(&owner.job, owner.build);
    }
}

impl fmt::Debug for GateController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateController")
            .field("key", &self.key)
            .field("jobs", &self.table.lock().jobs().len())
            .field("has_oracle", &self.oracle.is_some())
            .finish()
    }
}
