//! Bridges this crate's `tracing` events to the host's [`PipelineLogger`].

use std::fmt::{self, Write as _};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::domain::ports::{LogRecord, Severity};
use crate::infrastructure::config::GlobalConfiguration;

/// A `tracing` layer forwarding events whose target belongs to this crate to
/// the logger installed in [`GlobalConfiguration`]. Does nothing while no
/// logger is installed.
pub struct LoggerLayer {
    config: Arc<GlobalConfiguration>,
}

impl LoggerLayer {
    /// Creates a layer reading the logger from `config` on every event.
    #[must_use]
    pub const fn new(config: Arc<GlobalConfiguration>) -> Self {
        Self { config }
    }
}

impl fmt::Debug for LoggerLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerLayer")
            .field("installed", &self.config.logger().is_some())
            .finish()
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for LoggerLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with(crate::NAME) {
            return;
        }
        let Some(logger) = self.config.logger() else {
            return;
        };
        let severity = Severity::from(*metadata.level());
        if !logger.can_log(severity) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.message.push_str(&visitor.fields);
        logger.log(&LogRecord {
            severity,
            message: visitor.message,
            target: metadata.target().to_string(),
            file: metadata.file().map(String::from),
            line: metadata.line(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::PipelineLogger;
    use parking_lot::Mutex;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Default)]
    struct Collect(Mutex<Vec<LogRecord>>);

    impl PipelineLogger for Collect {
        fn can_log(&self, severity: Severity) -> bool {
            severity <= Severity::Information
        }

        fn log(&self, record: &LogRecord) {
            self.0.lock().push(record.clone());
        }
    }

    #[test]
    fn test_forwards_crate_events() {
        let config = Arc::new(GlobalConfiguration::default());
        let sink = Arc::new(Collect::default());
        config.set_logger(Some(sink.clone() as Arc<dyn PipelineLogger>));

        let subscriber = tracing_subscriber::registry().with(config.logging_layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(id = "abc", "cache miss");
            tracing::debug!("below threshold");
            tracing::error!(target: "elsewhere", "not ours");
        });

        let records = sink.0.lock().clone();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, Severity::Warning);
        assert_eq!(records[0].message, "cache miss id=abc");
        assert!(records[0].target.starts_with(crate::NAME));
        assert!(records[0].line.is_some());
    }

    #[test]
    fn test_silent_without_logger() {
        let config = Arc::new(GlobalConfiguration::default());
        let sink = Arc::new(Collect::default());

        let subscriber = tracing_subscriber::registry().with(config.logging_layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!("dropped");
        });

        config.set_logger(Some(sink.clone() as Arc<dyn PipelineLogger>));
        config.set_logger(None);
        assert!(sink.0.lock().is_empty());
    }
}
