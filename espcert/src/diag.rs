//! Diagnostic message sinks.
//!
//! The session and the certificate detector report progress and failures
//! through a [`DiagnosticSink`] handed to them by the caller, instead of a
//! process-wide logger. [`LogSink`] forwards to the `log` facade; tests and
//! embedders that want to show the messages themselves use [`MemorySink`].

use std::sync::{Arc, Mutex};

/// Receiver for component-level diagnostics.
pub trait DiagnosticSink: Send + Sync {
    /// Record a debug message.
    fn debug(&self, message: &str);

    /// Record an error message.
    fn error(&self, message: &str);
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn DiagnosticSink>;

/// Forwards diagnostics to `log::debug!` and `log::error!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn debug(&self, message: &str) {
        log::debug!("{message}");
    }

    fn error(&self, message: &str) {
        log::error!("{message}");
    }
}

/// Severity of a captured message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Debug output.
    Debug,
    /// Error output.
    Error,
}

/// Captures diagnostics in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(Level, String)>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn entries(&self) -> Vec<(Level, String)> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Messages recorded at `level`.
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, message)| message)
            .collect()
    }

    fn push(&self, level: Level, message: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((level, message.to_string()));
        }
    }
}

impl DiagnosticSink for MemorySink {
    fn debug(&self, message: &str) {
        self.push(Level::Debug, message);
    }

    fn error(&self, message: &str) {
        self.push(Level::Error, message);
    }
}
