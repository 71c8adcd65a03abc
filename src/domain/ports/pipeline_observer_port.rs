//! Process-wide observer port for cross-cutting concerns such as activity indicators.

use crate::domain::entities::{DownloadSummary, ImageId};

/// Notified of operation and download lifecycle events.
/// Has no effect on the fetch state machine. Called from pipeline tasks, so
/// implementations should return quickly.
pub trait PipelineObserver: Send + Sync {
    /// An operation started.
    fn operation_did_start(&self, _id: &ImageId) {}

    /// An operation reached a terminal state.
    fn operation_did_finish(&self, _id: &ImageId) {}

    /// A network download started.
    fn did_start_download(&self, _url: &str) {}

    /// A network download ended. `summary.dimensions` is set only when the
    /// payload decoded.
    fn did_finish_download(&self, _summary: &DownloadSummary) {}
}
