//! Console sink trait and implementations.

use crate::context::Contextual;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn, Level};

/// Receives console lines written by steps.
///
/// Implementations must not panic and must not block for long.
pub trait ConsoleSink: Send + Sync {
    /// Writes one line.
    fn line(&self, text: &str);
}

/// A console sink that discards all output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpConsoleSink;

impl ConsoleSink for NoOpConsoleSink {
    fn line(&self, _text: &str) {}
}

/// A console sink that forwards lines to the tracing framework.
#[derive(Debug, Clone)]
pub struct TracingConsoleSink {
    level: Level,
    source: String,
}

impl Default for TracingConsoleSink {
    fn default() -> Self {
        Self::new(Level::INFO, "console")
    }
}

impl TracingConsoleSink {
    /// Creates a sink logging at `level`, tagging each line with `source`.
    #[must_use]
    pub fn new(level: Level, source: impl Into<String>) -> Self {
        Self {
            level,
            source: source.into(),
        }
    }
}

impl ConsoleSink for TracingConsoleSink {
    fn line(&self, text: &str) {
        match self.level {
            Level::DEBUG | Level::TRACE => debug!(source = %self.source, "{}", text),
            Level::WARN | Level::ERROR => warn!(source = %self.source, "{}", text),
            _ => info!(source = %self.source, "{}", text),
        }
    }
}

/// A collecting console sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingConsoleSink {
    lines: RwLock<Vec<String>>,
}

impl CollectingConsoleSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected lines.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.read().clone()
    }

    /// Returns true if any collected line contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.read().iter().any(|line| line.contains(needle))
    }

    /// Clears all collected lines.
    pub fn clear(&self) {
        self.lines.write().clear();
    }
}

impl ConsoleSink for CollectingConsoleSink {
    fn line(&self, text: &str) {
        self.lines.write().push(text.to_string());
    }
}

/// Writes every line to two sinks.
pub struct TeeConsoleSink {
    first: Arc<dyn ConsoleSink>,
    second: Arc<dyn ConsoleSink>,
}

impl TeeConsoleSink {
    /// Creates a tee over two sinks.
    #[must_use]
    pub fn new(first: Arc<dyn ConsoleSink>, second: Arc<dyn ConsoleSink>) -> Self {
        Self { first, second }
    }
}

impl ConsoleSink for TeeConsoleSink {
    fn line(&self, text: &str) {
        self.first.line(text);
        self.second.line(text);
    }
}

/// The console visible to a step.
#[derive(Clone)]
pub struct ConsoleLog {
    sink: Arc<dyn ConsoleSink>,
}

impl ConsoleLog {
    /// Wraps a sink.
    #[must_use]
    pub fn new(sink: Arc<dyn ConsoleSink>) -> Self {
        Self { sink }
    }

    /// Writes one line.
    pub fn println(&self, text: &str) {
        self.sink.line(text);
    }
}

impl Contextual for ConsoleLog {
    fn merge(original: &Self, subsequent: &Self) -> Self {
        Self::new(Arc::new(TeeConsoleSink::new(
            original.sink.clone(),
            subsequent.sink.clone(),
        )))
    }
}

impl fmt::Debug for ConsoleLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleLog").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextVariables;

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingConsoleSink::new();
        sink.line("Entering stage build");
        sink.line("Proceeding");
        assert_eq!(sink.lines().len(), 2);
        assert!(sink.contains("Proceeding"));
        sink.clear();
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_nested_console_logs_tee() {
        let outer = Arc::new(CollectingConsoleSink::new());
        let inner = Arc::new(CollectingConsoleSink::new());
        let vars = ContextVariables::new()
            .with(ConsoleLog::new(outer.clone()))
            .with(ConsoleLog::new(inner.clone()));

        vars.get::<ConsoleLog>().unwrap().println("hello");

        assert_eq!(outer.lines(), vec!["hello".to_string()]);
        assert_eq!(inner.lines(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_tracing_sink_does_not_panic() {
        TracingConsoleSink::new(Level::DEBUG, "test").line("quiet");
        NoOpConsoleSink.line("dropped");
    }
}
