//! Identifiers for executions, steps and bodies.

use crate::errors::LoadError;
use crate::execution::{ExecutionLoader, FlowExecution};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A stable, identifier-only pointer to one top-level execution.
///
/// Owners hold no live reference; [`ExecutionOwner::get`] resolves them on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionOwner {
    /// The job the build belongs to.
    pub job: String,
    /// The build number within the job.
    pub build: u64,
}

impl ExecutionOwner {
    /// Creates a new owner.
    #[must_use]
    pub fn new(job: impl Into<String>, build: u64) -> Self {
        Self {
            job: job.into(),
            build,
        }
    }

    /// Resolves this owner to its live execution.
    pub fn get(&self, loader: &dyn ExecutionLoader) -> Result<Arc<dyn FlowExecution>, LoadError> {
        loader.load(self)
    }
}

impl fmt::Display for ExecutionOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job, self.build)
    }
}

/// Identifies one unit-of-work invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(Uuid);

impl StepId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one nested body invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BodyId(Uuid);

impl BodyId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BodyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_owner_display() {
        assert_eq!(ExecutionOwner::new("deploy", 12).to_string(), "deploy#12");
    }

    #[test]
    fn test_owner_equality_by_referent() {
        let mut set = HashSet::new();
        set.insert(ExecutionOwner::new("app", 1));
        set.insert(ExecutionOwner::new("app", 1));
        set.insert(ExecutionOwner::new("app", 2));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_step_id_is_transparent_in_json() {
        let id = StepId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
    }
}
