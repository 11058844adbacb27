//! Capture of user-facing progress and fault messages.
//!
//! The sensor code never talks to a widget. It reports through a [`Reporter`]
//! holding two [`MessageSink`]s: one for informational progress and one for
//! warnings and errors. Faults and notices on the error sink are stamped
//! with the local wall-clock time; progress lines are not. Everything is
//! mirrored to the `log` facade.

use chrono::Local;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Anything text can be appended to.
pub trait MessageSink: Send + Sync {
    /// Append one line.
    fn append(&self, text: &str);
}

/// Sink that only forwards to the `log` facade (the [`Reporter`] already does that).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MessageSink for LogSink {
    fn append(&self, _text: &str) {}
}

/// Bounded in-memory sink. Clones share the same buffer.
#[derive(Debug, Clone)]
pub struct MemorySink {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl MemorySink {
    /// Sink keeping at most `capacity` lines, dropping the oldest.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Snapshot of the stored lines.
    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// True if any stored line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }

    /// Number of stored lines containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(needle)).count()
    }

    /// Drop every stored line.
    pub fn clear(&self) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.clear();
        }
    }
}

impl MessageSink for MemorySink {
    fn append(&self, text: &str) {
        let mut lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(text.to_string());
    }
}

/// Pair of sinks used by the session and the acquisition loop.
#[derive(Clone)]
pub struct Reporter {
    info: Arc<dyn MessageSink>,
    errors: Arc<dyn MessageSink>,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(Arc::new(LogSink), Arc::new(LogSink))
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter").finish_non_exhaustive()
    }
}

impl Reporter {
    /// Reporter writing progress to `info` and faults to `errors`.
    pub fn new(info: Arc<dyn MessageSink>, errors: Arc<dyn MessageSink>) -> Self {
        Self { info, errors }
    }

    /// Reporter backed by two fresh memory sinks, returned alongside it.
    pub fn in_memory() -> (Self, MemorySink, MemorySink) {
        let info = MemorySink::default();
        let errors = MemorySink::default();
        let reporter = Self::new(Arc::new(info.clone()), Arc::new(errors.clone()));
        (reporter, info, errors)
    }

    /// Progress message, not timestamped.
    pub fn info(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        log::info!("{}", text);
        self.info.append(text);
    }

    /// Timestamped notice on the error sink (e.g. "waiting for device").
    pub fn notice(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        log::info!("{}", text);
        self.errors.append(&stamped(text));
    }

    /// Timestamped warning.
    pub fn warn(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        log::warn!("{}", text);
        self.errors.append(&stamped(&format!("WARNING: {}", text)));
    }

    /// Timestamped error.
    pub fn error(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        log::error!("{}", text);
        self.errors.append(&stamped(&format!("ERROR: {}", text)));
    }
}

fn stamped(text: &str) -> String {
    format!("{}\t {}", Local::now().format("%H:%M:%S"), text)
}
