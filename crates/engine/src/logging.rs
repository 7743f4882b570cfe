//! Injected logging capability.
//!
//! The engine never touches a process-wide logger directly; every component
//! that logs receives a [`LogSink`] at construction. Where the events end up
//! (console, file, a host-language callback) is the caller's decision.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Fatal,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Trace => "Trace",
            LogLevel::Debug => "Debug",
            LogLevel::Information => "Information",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
            LogLevel::Fatal => "Fatal",
        };
        f.write_str(s)
    }
}

pub trait LogSink: Send + Sync {
    fn emit(&self, level: LogLevel, message: &str);

    fn trace(&self, message: &str) {
        self.emit(LogLevel::Trace, message)
    }
    fn debug(&self, message: &str) {
        self.emit(LogLevel::Debug, message)
    }
    fn info(&self, message: &str) {
        self.emit(LogLevel::Information, message)
    }
    fn warn(&self, message: &str) {
        self.emit(LogLevel::Warning, message)
    }
    fn error(&self, message: &str) {
        self.emit(LogLevel::Error, message)
    }
    fn fatal(&self, message: &str) {
        self.emit(LogLevel::Fatal, message)
    }
}

// ---------------------------------------------------------------------------
// tracing
// ---------------------------------------------------------------------------

/// Forwards events to the `tracing` dispatcher installed by the host.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(target: "commissioning", "{}", message),
            LogLevel::Debug => tracing::debug!(target: "commissioning", "{}", message),
            LogLevel::Information => tracing::info!(target: "commissioning", "{}", message),
            LogLevel::Warning => tracing::warn!(target: "commissioning", "{}", message),
            LogLevel::Error => tracing::error!(target: "commissioning", "{}", message),
            LogLevel::Fatal => {
                tracing::error!(target: "commissioning", fatal = true, "{}", message)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Callback – bridge into a foreign host
// ---------------------------------------------------------------------------

type Callback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Hands each event at or above `min_level` to a closure.
pub struct CallbackSink {
    callback: Callback,
    min_level: LogLevel,
}

impl CallbackSink {
    pub fn new(min_level: LogLevel, callback: impl Fn(LogLevel, &str) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            min_level,
        }
    }
}

impl LogSink for CallbackSink {
    fn emit(&self, level: LogLevel, message: &str) {
        if level >= self.min_level {
            (self.callback)(level, message);
        }
    }
}

// ---------------------------------------------------------------------------
// Memory / null
// ---------------------------------------------------------------------------

/// Keeps every event in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<(LogLevel, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(LogLevel, String)> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn emit(&self, level: LogLevel, message: &str) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((level, message.to_string()));
    }
}

pub struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, _level: LogLevel, _message: &str) {}
}
