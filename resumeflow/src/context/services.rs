//! Built-in contextual values.

use super::Contextual;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum EnvOp {
    Set(String, String),
    Unset(String),
}

/// An ordered list of environment changes.
///
/// Nested overlays compose in sequence: the outer overlay is applied first,
/// then the inner one, so `PATH+=` style references see the outer result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentOverlay {
    ops: Vec<EnvOp>,
}

impl EnvironmentOverlay {
    /// Creates an empty overlay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a variable. `${NAME}` in `value` refers to the value before this change.
    #[must_use]
    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(EnvOp::Set(name.into(), value.into()));
        self
    }

    /// Removes a variable.
    #[must_use]
    pub fn unset(mut self, name: impl Into<String>) -> Self {
        self.ops.push(EnvOp::Unset(name.into()));
        self
    }

    /// Applies the overlay to `env` in place.
    pub fn expand(&self, env: &mut BTreeMap<String, String>) {
        for op in &self.ops {
            match op {
                EnvOp::Set(name, value) => {
                    let resolved = substitute(value, env);
                    env.insert(name.clone(), resolved);
                }
                EnvOp::Unset(name) => {
                    env.remove(name);
                }
            }
        }
    }

    /// Returns `base` with the overlay applied.
    #[must_use]
    pub fn apply_to(&self, base: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = base.clone();
        self.expand(&mut env);
        env
    }
}

fn substitute(value: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(env.get(name).map_or("", String::as_str));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

impl Contextual for EnvironmentOverlay {
    fn merge(original: &Self, subsequent: &Self) -> Self {
        let mut ops = original.ops.clone();
        ops.extend(subsequent.ops.iter().cloned());
        Self { ops }
    }
}

type LineFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Transforms or drops console lines before they reach the console.
///
/// Nested filters compose like decorators: the innermost filter sees each
/// line first and the outer filter sees what it produced.
#[derive(Clone)]
pub struct LogFilter {
    stages: Vec<LineFn>,
}

impl LogFilter {
    /// Creates a filter from a function. Returning `None` drops the line.
    #[must_use]
    pub fn new<F>(filter: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            stages: vec![Arc::new(filter)],
        }
    }

    /// Replaces every occurrence of `secret` with `****`.
    #[must_use]
    pub fn masking(secret: impl Into<String>) -> Self {
        let secret = secret.into();
        Self::new(move |line| Some(line.replace(secret.as_str(), "****")))
    }

    /// Runs `line` through every stage.
    #[must_use]
    pub fn apply(&self, line: &str) -> Option<String> {
        let mut current = line.to_string();
        for stage in &self.stages {
            current = stage(&current)?;
        }
        Some(current)
    }
}

impl Contextual for LogFilter {
    fn merge(original: &Self, subsequent: &Self) -> Self {
        let mut stages = subsequent.stages.clone();
        stages.extend(original.stages.iter().cloned());
        Self { stages }
    }
}

impl fmt::Debug for LogFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogFilter")
            .field("stages", &self.stages.len())
            .finish()
    }
}

/// The directory steps operate in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDirectory(PathBuf);

impl WorkingDirectory {
    /// Creates a working directory value.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Returns the path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Contextual for WorkingDirectory {
    fn merge(original: &Self, subsequent: &Self) -> Self {
        Self(original.0.join(&subsequent.0))
    }
}
