//! The process-wide registry of in-flight executions.
//!
//! The registry is what makes restart recovery possible: at startup it is
//! read back, every owner is resolved to its execution, and suspended units
//! of work are resumed.

mod lane;
mod list;
mod recovery;

pub use lane::PersistLane;
pub use list::{ExecutionRegistry, RegistryIter, REGISTRY_VERSION};
pub use recovery::resume_all;
