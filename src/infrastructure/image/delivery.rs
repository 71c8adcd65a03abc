//! The callback executor: one task delivering every observer callback in
//! submission order.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::domain::entities::{ImageRequest, LoadSource, LoadedImage};
use crate::domain::errors::FetchError;
use crate::domain::ports::{FetchDelegate, PreviewDecision, ProgressiveQuery};

/// One observer callback.
pub(crate) enum Callback {
    Started,
    WillAttempt(LoadSource),
    Preview(Arc<LoadedImage>, oneshot::Sender<PreviewDecision>),
    /// Asks whether to receive progressive partials; on acceptance the
    /// attached partial is delivered straight away.
    ProgressiveQuery {
        query: ProgressiveQuery,
        partial: Arc<LoadedImage>,
        progress: f32,
        reply: oneshot::Sender<bool>,
    },
    Progressive(Arc<LoadedImage>, f32),
    FirstFrame(Arc<LoadedImage>, f32),
    Progress(f32),
    Finished(Arc<LoadedImage>),
    Failed(FetchError),
}

impl Callback {
    const fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::WillAttempt(_) => "will_attempt",
            Self::Preview(..) => "preview",
            Self::ProgressiveQuery { .. } => "progressive_query",
            Self::Progressive(..) => "progressive",
            Self::FirstFrame(..) => "first_frame",
            Self::Progress(_) => "progress",
            Self::Finished(_) => "finished",
            Self::Failed(_) => "failed",
        }
    }
}

/// A callback addressed to one observer attachment.
pub(crate) struct Delivery {
    pub observer: Weak<dyn FetchDelegate>,
    /// Cleared when the attachment is cancelled; queued deliveries are then dropped.
    pub active: Arc<AtomicBool>,
    pub request: Arc<ImageRequest>,
    pub callback: Callback,
}

/// Serialises observer callbacks onto a single task.
///
/// A query whose delivery is dropped (observer gone or detached) resolves to
/// the default answer because its reply sender is dropped with it.
#[derive(Debug, Clone)]
pub struct CallbackExecutor {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("callback", &self.callback.name())
            .field("request", &self.request.id)
            .finish_non_exhaustive()
    }
}

impl CallbackExecutor {
    /// Spawns the executor task. Must be called within a tokio runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(rx));
        Self { tx }
    }

    pub(crate) fn submit(&self, delivery: Delivery) {
        if self.tx.send(delivery).is_err() {
            warn!("Callback executor stopped, dropping callback");
        }
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = rx.recv().await {
            Self::deliver(delivery).await;
        }
        trace!("Callback executor finished");
    }

    async fn deliver(delivery: Delivery) {
        let Delivery {
            observer,
            active,
            request,
            callback,
        } = delivery;
        if !active.load(Ordering::Acquire) {
            return;
        }
        let Some(observer) = observer.upgrade() else {
            return;
        };
        let name = callback.name();
        let call = async move {
            let request = request.as_ref();
            match callback {
                Callback::Started => observer.did_start(request).await,
                Callback::WillAttempt(source) => {
                    observer.will_attempt_source(request, source).await;
                }
                Callback::Preview(preview, reply) => {
                    let decision = observer.did_load_preview(request, preview).await;
                    let _ = reply.send(decision);
                }
                Callback::ProgressiveQuery {
                    query,
                    partial,
                    progress,
                    reply,
                } => {
                    let accepted = observer.should_load_progressively(request, &query).await;
                    if accepted {
                        observer
                            .did_update_progressive(request, partial, progress)
                            .await;
                    }
                    let _ = reply.send(accepted);
                }
                Callback::Progressive(partial, progress) => {
                    observer
                        .did_update_progressive(request, partial, progress)
                        .await;
                }
                Callback::FirstFrame(frame, progress) => {
                    observer
                        .did_load_first_animated_frame(request, frame, progress)
                        .await;
                }
                Callback::Progress(progress) => {
                    observer.did_update_progress(request, progress).await;
                }
                Callback::Finished(result) => observer.did_load_final(request, result).await,
                Callback::Failed(error) => observer.did_fail(request, error).await,
            }
        };
        if AssertUnwindSafe(call).catch_unwind().await.is_err() {
            warn!(callback = name, "Observer callback panicked");
        }
    }
}
