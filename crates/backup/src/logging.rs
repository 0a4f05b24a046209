//! Logging handle passed to each component at construction
//!
//! Components never reach for the process-wide logger on their own. They
//! receive a [`Logger`], which either forwards to the installed `log`
//! backend ([`Logger::global`]) or to an explicit [`log::Log`]
//! implementation such as [`MemoryLog`].

use std::fmt;
use std::sync::{Arc, RwLock};

use log::{Level, Log, Metadata, Record};

const TARGET: &str = "imap_backup";

#[derive(Clone)]
enum Backend {
    Global,
    Custom(Arc<dyn Log>),
}

/// Cloneable logging capability
#[derive(Clone)]
pub struct Logger {
    backend: Backend,
}

impl Logger {
    /// Forward to whatever `log` backend the process installed
    pub fn global() -> Self {
        Self {
            backend: Backend::Global,
        }
    }

    /// Forward to a specific backend
    pub fn new(backend: Arc<dyn Log>) -> Self {
        Self {
            backend: Backend::Custom(backend),
        }
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        let record = Record::builder()
            .level(level)
            .target(TARGET)
            .args(args)
            .build();

        match &self.backend {
            Backend::Global => {
                if level <= log::max_level() {
                    let logger = log::logger();
                    if logger.enabled(record.metadata()) {
                        logger.log(&record);
                    }
                }
            }
            Backend::Custom(logger) => {
                if logger.enabled(record.metadata()) {
                    logger.log(&record);
                }
            }
        }
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.backend {
            Backend::Global => f.write_str("Logger(global)"),
            Backend::Custom(_) => f.write_str("Logger(custom)"),
        }
    }
}

/// Log backend that keeps every record in memory
///
/// Useful for tests and for callers that want to show a run's log after
/// the fact.
#[derive(Default)]
pub struct MemoryLog {
    records: RwLock<Vec<(Level, String)>>,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All captured records, oldest first
    pub fn records(&self) -> Vec<(Level, String)> {
        self.records.read().map(|r| r.clone()).unwrap_or_default()
    }

    /// Captured messages at the given level
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }

    /// Whether any captured message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.records().iter().any(|(_, m)| m.contains(needle))
    }
}

impl Log for MemoryLog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if let Ok(mut guard) = self.records.write() {
            guard.push((record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}
