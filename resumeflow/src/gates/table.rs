//! The gate table and its admission rules.
//!
//! Everything here is pure bookkeeping: decisions come back as a list of
//! [`Effect`]s that the controller applies once its lock is released.

use crate::body::deliver;
use crate::context::StepContext;
use crate::errors::{GateError, InterruptCause, RunResult, StepError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Format version of the persisted gate table.
pub const GATE_TABLE_VERSION: u32 = 1;

/// Reports whether a build still exists.
#[cfg_attr(test, mockall::automock)]
pub trait BuildOracle: Send + Sync {
    /// Returns false once `job#build` has been deleted.
    fn exists(&self, job: &str, build: u64) -> bool;
}

/// State of one gate of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateState {
    /// How many builds may hold the gate at once. `None` is unbounded.
    pub capacity: Option<u32>,
    /// Builds currently inside the gate.
    pub holders: BTreeSet<u64>,
    /// The single build waiting to get in.
    pub waiter: Option<u64>,
}

impl GateState {
    /// Returns true if one more holder fits.
    #[must_use]
    pub fn has_room(&self) -> bool {
        self.capacity
            .map_or(true, |capacity| self.holders.len() < capacity as usize)
    }

    fn is_empty(&self) -> bool {
        self.holders.is_empty() && self.waiter.is_none()
    }
}

/// A decision taken for a waiter whose context was not attached at the time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// The waiter got in.
    Admitted {
        /// Console message for the waiter.
        message: String,
    },
    /// A newer build replaced the waiter.
    Superseded {
        /// The newer build.
        by: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PendingVerdict {
    pub(crate) job: String,
    pub(crate) gate: String,
    pub(crate) build: u64,
    pub(crate) verdict: Verdict,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct GateRecord {
    pub(crate) version: u32,
    #[serde(default)]
    pub(crate) jobs: BTreeMap<String, BTreeMap<String, GateState>>,
    #[serde(default)]
    pub(crate) pending: Vec<PendingVerdict>,
}

/// Something to do to a context once the table lock is released.
pub(crate) enum Effect {
    Print(StepContext, String),
    Succeed(StepContext),
    Fail(StepContext, StepError),
}

impl Effect {
    pub(crate) fn apply(self) {
        match self {
            Self::Print(ctx, message) => ctx.println(message),
            Self::Succeed(ctx) => deliver(&ctx, Ok(serde_json::Value::Null)),
            Self::Fail(ctx, cause) => deliver(&ctx, Err(cause)),
        }
    }
}

/// Outcome of reattaching a resumed gate step.
pub(crate) enum Reattach {
    /// A verdict was waiting; apply these.
    Decided(Vec<Effect>),
    /// Still waiting; the context is attached again.
    Waiting,
    /// The table knows nothing about this build.
    Unknown,
}

type GateKey = (String, String);

fn key(job: &str, gate: &str) -> GateKey {
    (job.to_string(), gate.to_string())
}

fn superseded(by: u64) -> StepError {
    StepError::interrupted(RunResult::NotBuilt, InterruptCause::Superseded { by })
}

/// The in-memory gate table plus the contexts of attached waiters.
#[derive(Default)]
pub(crate) struct GateTable {
    jobs: BTreeMap<String, BTreeMap<String, GateState>>,
    pending: Vec<PendingVerdict>,
    live: HashMap<GateKey, StepContext>,
}

impl GateTable {
    pub(crate) fn from_record(record: GateRecord) -> Self {
        Self {
            jobs: record.jobs,
            pending: record.pending,
            live: HashMap::new(),
        }
    }

    pub(crate) fn to_record(&self) -> GateRecord {
        GateRecord {
            version: GATE_TABLE_VERSION,
            jobs: self.jobs.clone(),
            pending: self.pending.clone(),
        }
    }

    pub(crate) fn jobs(&self) -> &BTreeMap<String, BTreeMap<String, GateState>> {
        &self.jobs
    }

    pub(crate) fn gate(&self, job: &str, gate: &str) -> Option<&GateState> {
        self.jobs.get(job)?.get(gate)
    }

    fn gate_mut(&mut self, job: &str, gate: &str) -> &mut GateState {
        self.jobs
            .entry(job.to_string())
            .or_default()
            .entry(gate.to_string())
            .or_default()
    }

    /// Runs the admission algorithm for `build` entering `gate`.
    pub(crate) fn enter(
        &mut self,
        ctx: &StepContext,
        job: &str,
        gate: &str,
        build: u64,
        capacity: Option<u32>,
        oracle: Option<&dyn BuildOracle>,
    ) -> Result<Vec<Effect>, GateError> {
        let existing = self.gate(job, gate).and_then(|state| state.waiter);
        if existing == Some(build) {
            return Err(GateError::Reentrant {
                job: job.to_string(),
                gate: gate.to_string(),
                build,
            });
        }

        let mut effects = vec![Effect::Print(ctx.clone(), format!("Entering stage {gate}"))];
        self.gate_mut(job, gate).capacity = capacity;

        let mut entrant = (build, Some(ctx.clone()));
        match existing {
            Some(waiter) if waiter < build => {
                self.cancel_waiter(job, gate, waiter, build, &mut effects);
                effects.push(Effect::Print(ctx.clone(), format!("Canceling older #{waiter}")));
            }
            Some(waiter) => {
                debug!(job, gate, build, waiter, "Newer build already waiting; giving way");
                let waiter_ctx = self.live.remove(&key(job, gate));
                effects.push(Effect::Print(ctx.clone(), format!("Canceled since #{waiter} got here")));
                if let Some(waiter_ctx) = &waiter_ctx {
                    effects.push(Effect::Print(waiter_ctx.clone(), format!("Canceling older #{build}")));
                }
                effects.push(Effect::Fail(ctx.clone(), superseded(waiter)));
                self.gate_mut(job, gate).waiter = None;
                entrant = (waiter, waiter_ctx);
            }
            None => {}
        }
        let (build, ctx) = entrant;

        let others: Vec<String> = self
            .jobs
            .get(job)
            .map(|gates| {
                gates
                    .iter()
                    .filter(|(name, state)| name.as_str() != gate && state.holders.contains(&build))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        for other in others {
            self.gate_mut(job, &other).holders.remove(&build);
            let message = format!("Unblocked since #{build} is moving into stage {gate}");
            self.admit_waiter(job, &other, &message, &mut effects);
        }

        let state = self.gate_mut(job, gate);
        if state.holders.contains(&build) {
            if let Some(ctx) = ctx {
                effects.push(Effect::Print(ctx.clone(), "Proceeding".to_string()));
                effects.push(Effect::Succeed(ctx));
            }
        } else {
            state.waiter = Some(build);
            if state.has_room() {
                if let Some(ctx) = ctx {
                    self.live.insert(key(job, gate), ctx);
                }
                self.admit_waiter(job, gate, "Proceeding", &mut effects);
            } else {
                let holders: Vec<u64> = state.holders.iter().copied().collect();
                if let Some(ctx) = ctx {
                    effects.push(Effect::Print(ctx.clone(), format!("Waiting for builds {holders:?}")));
                    self.live.insert(key(job, gate), ctx);
                }
            }
        }

        self.clean_up(job, oracle, &mut effects);
        Ok(effects)
    }

    /// Releases every gate `build` holds and drops it as a waiter.
    ///
    /// Returns `None` if the table did not change.
    pub(crate) fn build_completed(
        &mut self,
        job: &str,
        build: u64,
        oracle: Option<&dyn BuildOracle>,
    ) -> Option<Vec<Effect>> {
        let mut effects = Vec::new();
        let mut modified = false;
        let names: Vec<String> = self
            .jobs
            .get(job)
            .map(|gates| gates.keys().cloned().collect())
            .unwrap_or_default();
        for name in names {
            let state = self.gate_mut(job, &name);
            if state.waiter == Some(build) {
                state.waiter = None;
                self.live.remove(&key(job, &name));
                modified = true;
            }
            let state = self.gate_mut(job, &name);
            if state.holders.remove(&build) {
                modified = true;
                self.admit_waiter(job, &name, &format!("Unblocked since #{build} finished"), &mut effects);
            }
        }
        let before = self.pending.len();
        self.pending.retain(|p| !(p.job == job && p.build == build));
        modified |= self.pending.len() != before;

        if !modified {
            return None;
        }
        self.clean_up(job, oracle, &mut effects);
        Some(effects)
    }

    /// Binds a resumed waiter's context again, applying any stored verdict.
    pub(crate) fn reattach(
        &mut self,
        ctx: &StepContext,
        job: &str,
        gate: &str,
        build: u64,
    ) -> Reattach {
        if let Some(index) = self
            .pending
            .iter()
            .position(|p| p.job == job && p.gate == gate && p.build == build)
        {
            let pending = self.pending.remove(index);
            let effects = match pending.verdict {
                Verdict::Admitted { message } => {
                    vec![Effect::Print(ctx.clone(), message), Effect::Succeed(ctx.clone())]
                }
                Verdict::Superseded { by } => vec![
                    Effect::Print(ctx.clone(), format!("Canceled since #{by} got here")),
                    Effect::Fail(ctx.clone(), superseded(by)),
                ],
            };
            return Reattach::Decided(effects);
        }
        match self.gate(job, gate) {
            Some(state) if state.waiter == Some(build) => {
                self.live.insert(key(job, gate), ctx.clone());
                Reattach::Waiting
            }
            Some(state) if state.holders.contains(&build) => Reattach::Decided(vec![
                Effect::Print(ctx.clone(), "Proceeding".to_string()),
                Effect::Succeed(ctx.clone()),
            ]),
            _ => Reattach::Unknown,
        }
    }

    /// Forgets an attached waiter context without changing the table.
    pub(crate) fn detach(&mut self, job: &str, gate: &str, build: u64) {
        if self.gate(job, gate).is_some_and(|state| state.waiter == Some(build)) {
            self.live.remove(&key(job, gate));
        }
    }

    /// Removes `build` as the waiter of `gate`. Returns `None` if it was not waiting.
    pub(crate) fn withdraw(
        &mut self,
        job: &str,
        gate: &str,
        build: u64,
        oracle: Option<&dyn BuildOracle>,
    ) -> Option<Vec<Effect>> {
        if !self.gate(job, gate).is_some_and(|state| state.waiter == Some(build)) {
            return None;
        }
        self.gate_mut(job, gate).waiter = None;
        self.live.remove(&key(job, gate));
        self.pending
            .retain(|p| !(p.job == job && p.gate == gate && p.build == build));
        let mut effects = Vec::new();
        self.clean_up(job, oracle, &mut effects);
        Some(effects)
    }

    fn cancel_waiter(
        &mut self,
        job: &str,
        gate: &str,
        waiter: u64,
        by: u64,
        effects: &mut Vec<Effect>,
    ) {
        self.gate_mut(job, gate).waiter = None;
        match self.live.remove(&key(job, gate)) {
            Some(waiter_ctx) => {
                effects.push(Effect::Print(waiter_ctx.clone(), format!("Canceled since #{by} got here")));
                effects.push(Effect::Fail(waiter_ctx, superseded(by)));
            }
            None => self.pending.push(PendingVerdict {
                job: job.to_string(),
                gate: gate.to_string(),
                build: waiter,
                verdict: Verdict::Superseded { by },
            }),
        }
    }

    fn admit_waiter(&mut self, job: &str, gate: &str, message: &str, effects: &mut Vec<Effect>) {
        let state = self.gate_mut(job, gate);
        let Some(waiter) = state.waiter else {
            return;
        };
        if !state.has_room() {
            debug!(job, gate, waiter, "Gate still full; waiter keeps waiting");
            return;
        }
        state.waiter = None;
        state.holders.insert(waiter);
        match self.live.remove(&key(job, gate)) {
            Some(ctx) => {
                effects.push(Effect::Print(ctx.clone(), message.to_string()));
                effects.push(Effect::Succeed(ctx));
            }
            None => self.pending.push(PendingVerdict {
                job: job.to_string(),
                gate: gate.to_string(),
                build: waiter,
                verdict: Verdict::Admitted {
                    message: message.to_string(),
                },
            }),
        }
    }

    fn clean_up(&mut self, job: &str, oracle: Option<&dyn BuildOracle>, effects: &mut Vec<Effect>) {
        let Some(gates) = self.jobs.get_mut(job) else {
            return;
        };
        let mut reopened = Vec::new();
        if let Some(oracle) = oracle {
            for (name, state) in gates.iter_mut() {
                let before = state.holders.len();
                state.holders.retain(|build| {
                    let exists = oracle.exists(job, *build);
                    if !exists {
                        warn!(job, build, "Cleaning up apparently deleted build");
                    }
                    exists
                });
                if state.holders.len() != before && state.waiter.is_some() {
                    reopened.push(name.clone());
                }
            }
        }
        for name in reopened {
            self.admit_waiter(job, &name, "Proceeding", effects);
        }

        if let Some(gates) = self.jobs.get_mut(job) {
            gates.retain(|_, state| !state.is_empty());
            if gates.is_empty() {
                self.jobs.remove(job);
            }
        }
    }
}
