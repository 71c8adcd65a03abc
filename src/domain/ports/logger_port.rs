//! Logger capability: a pure side channel for leveled log records.

/// Syslog-style severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Information,
    Debug,
}

impl From<tracing::Level> for Severity {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => Self::Error,
            tracing::Level::WARN => Self::Warning,
            tracing::Level::INFO => Self::Information,
            tracing::Level::DEBUG | tracing::Level::TRACE => Self::Debug,
        }
    }
}

/// One log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity.
    pub severity: Severity,
    /// Rendered message, followed by any structured fields as `key=value`.
    pub message: String,
    /// Module path that emitted the record.
    pub target: String,
    /// Source file, when known.
    pub file: Option<String>,
    /// Source line, when known.
    pub line: Option<u32>,
}

/// Receives pipeline log records. Must not block.
pub trait PipelineLogger: Send + Sync {
    /// Returns false to skip formatting records at `severity`.
    fn can_log(&self, _severity: Severity) -> bool {
        true
    }

    /// Handles one record.
    fn log(&self, record: &LogRecord);
}
