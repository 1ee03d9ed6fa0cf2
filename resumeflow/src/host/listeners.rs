//! Collaborator interfaces injected into the host.

use crate::context::{ContextVariables, ExecutionOwner};
use crate::errors::RunResult;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Notified when a flow finishes.
pub trait RunListener: Send + Sync {
    /// The flow of `owner` finished with `result`.
    fn on_completed(&self, owner: &ExecutionOwner, result: RunResult);
}

/// Supplies the ambient contextual values of a new flow.
pub trait ContextProvider: Send + Sync {
    /// Root variables for the flow of `owner`.
    fn provide(&self, owner: &ExecutionOwner) -> ContextVariables;
}

/// Hands every flow the same root variables.
#[derive(Debug, Clone, Default)]
pub struct StaticContextProvider(ContextVariables);

impl StaticContextProvider {
    /// Creates a provider.
    #[must_use]
    pub fn new(variables: ContextVariables) -> Self {
        Self(variables)
    }
}

impl ContextProvider for StaticContextProvider {
    fn provide(&self, _owner: &ExecutionOwner) -> ContextVariables {
        self.0.clone()
    }
}

/// Per-build, name-keyed archive store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Stash: Send + Sync {
    /// Stores `paths` under `name`.
    async fn store(&self, owner: &ExecutionOwner, name: &str, paths: Vec<PathBuf>) -> anyhow::Result<()>;

    /// Returns the paths stored under `name`.
    async fn retrieve(&self, owner: &ExecutionOwner, name: &str) -> anyhow::Result<Vec<PathBuf>>;

    /// Drops every stash of the build.
    async fn clear(&self, owner: &ExecutionOwner) -> anyhow::Result<()>;
}

/// Clears a build's stashes once its flow finished.
pub struct StashCleanup {
    stash: Arc<dyn Stash>,
}

impl StashCleanup {
    /// Creates the listener.
    #[must_use]
    pub fn new(stash: Arc<dyn Stash>) -> Self {
        Self { stash }
    }
}

impl RunListener for StashCleanup {
    fn on_completed(&self, owner: &ExecutionOwner, _result: RunResult) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(owner = %owner, "No runtime to clear stashes on");
            return;
        };
        let stash = self.stash.clone();
        let owner = owner.clone();
        runtime.spawn(async move {
            if let Err(err) = stash.clear(&owner).await {
                warn!(owner = %owner, error = %err, "Could not clear stashes");
            }
        });
    }
}
