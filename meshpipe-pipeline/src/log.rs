//! Per-request processing log
//!
//! Every entry is mirrored to `tracing` as it is recorded. The full log is
//! written next to the result and embedded in the archive metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: String,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.timestamp.to_rfc3339(),
            self.level,
            self.stage,
            self.message
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessingLog {
    entries: Vec<LogEntry>,
}

impl ProcessingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, level: LogLevel, stage: &str, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(stage, "{message}"),
            LogLevel::Info => tracing::info!(stage, "{message}"),
            LogLevel::Warn => tracing::warn!(stage, "{message}"),
            LogLevel::Error => tracing::error!(stage, "{message}"),
        }
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            stage: stage.to_string(),
            level,
            message,
        });
    }

    pub fn debug(&mut self, stage: &str, message: impl Into<String>) {
        self.record(LogLevel::Debug, stage, message);
    }

    pub fn info(&mut self, stage: &str, message: impl Into<String>) {
        self.record(LogLevel::Info, stage, message);
    }

    pub fn warn(&mut self, stage: &str, message: impl Into<String>) {
        self.record(LogLevel::Warn, stage, message);
    }

    pub fn error(&mut self, stage: &str, message: impl Into<String>) {
        self.record(LogLevel::Error, stage, message);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries at warning level or above
    pub fn problems(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|e| e.level >= LogLevel::Warn)
    }

    /// Whether any message contains `needle`
    pub fn mentions(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.message.contains(needle))
    }

    /// Write one line per entry, creating parent directories
    pub fn flush_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_string())
    }
}

impl fmt::Display for ProcessingLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}
