//! Per-request fetch state machine.
//!
//! An operation walks memory cache, disk cache, additional caches and the
//! network in order, and fans its callbacks out to every attached observer
//! through the callback executor. All per-observer bookkeeping happens under
//! the operation lock, so the order in which callbacks are submitted is the
//! order in which each observer sees them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use super::codec::CodecLookup;
use super::delivery::{Callback, Delivery};
use super::pipeline::Shared;
use crate::domain::entities::{
    CoalescingKey, ContentMode, Dimensions, DownloadSummary, EntryMetadata, ImageContainer, ImageId,
    ImageRequest, ImageType, LoadSource, LoadedImage, LoadingSources,
};
use crate::domain::errors::{FetchError, FetchResult};
use crate::domain::ports::{
    DecodeSession, FetchDelegate, ImageCachePort, PartialImage, PipelineObserver,
    PreviewDecision, ProgressiveQuery,
};

/// Lifecycle of a fetch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    /// Created, task not yet running.
    Queued,
    /// Consulting the memory cache.
    ResolvingMemoryCache,
    /// Consulting the disk cache.
    ResolvingDiskCache,
    /// Consulting registered additional caches.
    ResolvingAdditionalCache,
    /// Downloading.
    Fetching,
    /// Finishing the decode of downloaded bytes.
    Decoding,
    /// Delivered a final image.
    Completed,
    /// Delivered an error.
    Failed,
    /// Every observer detached.
    Cancelled,
}

impl OperationState {
    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::ResolvingMemoryCache => "memory",
            Self::ResolvingDiskCache => "disk",
            Self::ResolvingAdditionalCache => "additional",
            Self::Fetching => "fetching",
            Self::Decoding => "decoding",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressiveOptIn {
    Unknown,
    Pending,
    Accepted,
    Declined,
}

struct ObserverSlot {
    id: u64,
    delegate: Weak<dyn FetchDelegate>,
    request: Arc<ImageRequest>,
    active: Arc<AtomicBool>,
    progress: f32,
    partial_progress: Option<f32>,
    progressive: ProgressiveOptIn,
    first_frame_sent: bool,
}

impl ObserverSlot {
    fn is_alive(&self) -> bool {
        self.delegate.strong_count() > 0
    }

    fn delivery(&self, callback: Callback) -> Delivery {
        Delivery {
            observer: self.delegate.clone(),
            active: self.active.clone(),
            request: self.request.clone(),
            callback,
        }
    }

    fn rendition_key(&self) -> RenditionKey {
        (self.request.target, self.request.content_mode)
    }
}

type RenditionKey = (Option<Dimensions>, ContentMode);

struct ProgressiveSnapshot {
    query: ProgressiveQuery,
    partial: Arc<LoadedImage>,
    progress: f32,
}

struct Inner {
    state: OperationState,
    observers: Vec<ObserverSlot>,
    progress: Option<f32>,
    progressive: Option<ProgressiveSnapshot>,
    first_frame: Option<(Arc<LoadedImage>, f32)>,
    preview: Option<Arc<LoadedImage>>,
    /// Set once the terminal callbacks have been submitted; no attach after this.
    finalized: bool,
    task: Option<AbortHandle>,
}

/// Result of detaching an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Detached {
    /// The observer was not attached (already finished or detached).
    NotAttached,
    /// Detached; other observers remain or the result is being delivered.
    Detached,
    /// Detached the last observer; the operation is cancelled.
    Cancelled,
}

/// One coalesced fetch shared by every observer of the same key.
pub(crate) struct FetchOperation {
    request: Arc<ImageRequest>,
    key: CoalescingKey,
    inner: Mutex<Inner>,
    next_observer: AtomicU64,
}

impl FetchOperation {
    pub(crate) fn new(request: Arc<ImageRequest>) -> Arc<Self> {
        Arc::new(Self {
            key: request.coalescing_key(),
            request,
            inner: Mutex::new(Inner {
                state: OperationState::Queued,
                observers: Vec::new(),
                progress: None,
                progressive: None,
                first_frame: None,
                preview: None,
                finalized: false,
                task: None,
            }),
            next_observer: AtomicU64::new(1),
        })
    }

    pub(crate) fn id(&self) -> &ImageId {
        &self.request.id
    }

    pub(crate) const fn key(&self) -> &CoalescingKey {
        &self.key
    }

    pub(crate) fn state(&self) -> OperationState {
        self.inner.lock().state
    }

    pub(crate) fn set_task(&self, handle: AbortHandle) {
        let mut inner = self.inner.lock();
        if inner.state == OperationState::Cancelled {
            handle.abort();
        } else {
            inner.task = Some(handle);
        }
    }

    /// Attaches an observer, replaying what it missed. Returns the attachment
    /// id, or `None` when the operation can no longer accept observers.
    pub(crate) fn attach(
        self: &Arc<Self>,
        shared: &Arc<Shared>,
        delegate: Weak<dyn FetchDelegate>,
        request: Arc<ImageRequest>,
    ) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.finalized
            || matches!(
                inner.state,
                OperationState::Cancelled | OperationState::Failed
            )
        {
            return None;
        }
        if let Some(existing) = inner
            .observers
            .iter()
            .find(|slot| slot.delegate.ptr_eq(&delegate))
        {
            return Some(existing.id);
        }

        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        let mut slot = ObserverSlot {
            id,
            delegate,
            request,
            active: Arc::new(AtomicBool::new(true)),
            progress: 0.0,
            partial_progress: None,
            progressive: ProgressiveOptIn::Unknown,
            first_frame_sent: false,
        };

        shared.executor.submit(slot.delivery(Callback::Started));
        if let Some(progress) = inner.progress {
            shared
                .executor
                .submit(slot.delivery(Callback::Progress(progress)));
            slot.progress = progress;
        }
        if let Some((frame, progress)) = &inner.first_frame {
            shared
                .executor
                .submit(slot.delivery(Callback::FirstFrame(frame.clone(), *progress)));
            slot.first_frame_sent = true;
        }
        let mut progressive_reply = None;
        if let Some(snapshot) = &inner.progressive {
            let (tx, rx) = oneshot::channel();
            slot.progressive = ProgressiveOptIn::Pending;
            slot.partial_progress = Some(snapshot.progress);
            shared.executor.submit(slot.delivery(Callback::ProgressiveQuery {
                query: snapshot.query.clone(),
                partial: snapshot.partial.clone(),
                progress: snapshot.progress,
                reply: tx,
            }));
            progressive_reply = Some(rx);
        }
        let mut preview_reply = None;
        if let Some(preview) = &inner.preview {
            let (tx, rx) = oneshot::channel();
            shared
                .executor
                .submit(slot.delivery(Callback::Preview(preview.clone(), tx)));
            preview_reply = Some((preview.clone(), rx));
        }

        inner.observers.push(slot);
        drop(inner);

        trace!(id = %self.request.id, observer = id, "Observer attached");
        if let Some(rx) = progressive_reply {
            tokio::spawn(self.clone().await_progressive_answer(shared.clone(), id, rx));
        }
        if let Some((preview, rx)) = preview_reply {
            tokio::spawn(self.clone().await_late_preview(shared.clone(), id, preview, rx));
        }
        Some(id)
    }

    /// Detaches an observer. Its queued callbacks are discarded.
    pub(crate) fn detach(&self, observer_id: u64) -> Detached {
        let mut inner = self.inner.lock();
        let Some(position) = inner.observers.iter().position(|s| s.id == observer_id) else {
            return Detached::NotAttached;
        };
        let slot = inner.observers.remove(position);
        slot.active.store(false, Ordering::Release);
        trace!(id = %self.request.id, observer = observer_id, "Observer detached");

        if inner.observers.is_empty()
            && !inner.finalized
            && inner.state != OperationState::Completed
        {
            inner.state = OperationState::Cancelled;
            inner.finalized = true;
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            debug!(id = %self.request.id, "Fetch cancelled");
            return Detached::Cancelled;
        }
        Detached::Detached
    }

    /// Runs the operation to a terminal state.
    pub(crate) async fn run(self: Arc<Self>, shared: Arc<Shared>) {
        debug!(id = %self.request.id, url = %self.request.url, "Fetch operation started");
        if let Err(error) = self.resolve(&shared).await {
            self.fail(&shared, error);
        }
    }

    /// Walks the stages the request allows, in order.
    async fn resolve(self: &Arc<Self>, shared: &Arc<Shared>) -> FetchResult<()> {
        if self.request.allows(LoadingSources::MEMORY_CACHE) {
            if !self.advance(
                shared,
                OperationState::ResolvingMemoryCache,
                Some(LoadSource::MemoryCache),
            ) {
                return Ok(());
            }
            if let Some((image, metadata)) = self.lookup_memory(shared).await {
                if self.request.is_satisfied_by(&metadata) {
                    self.complete(shared, image, LoadSource::MemoryCache, None)
                        .await;
                    return Ok(());
                }
                if !self
                    .offer_preview(shared, image, LoadSource::MemoryCache)
                    .await
                {
                    return Ok(());
                }
            }
        }

        if self.request.allows(LoadingSources::DISK_CACHE) {
            if !self.advance(
                shared,
                OperationState::ResolvingDiskCache,
                Some(LoadSource::DiskCache),
            ) {
                return Ok(());
            }
            if let Some((image, metadata)) = self.lookup_disk(shared).await {
                if self.request.is_satisfied_by(&metadata) {
                    self.complete(shared, image, LoadSource::DiskCache, None)
                        .await;
                    return Ok(());
                }
                if !self
                    .offer_preview(shared, image, LoadSource::DiskCache)
                    .await
                {
                    return Ok(());
                }
            }
        }

        let hooks = shared.config.additional_caches();
        if self.request.allows(LoadingSources::ADDITIONAL_CACHE) && !hooks.is_empty() {
            if !self.advance(
                shared,
                OperationState::ResolvingAdditionalCache,
                Some(LoadSource::AdditionalCache),
            ) {
                return Ok(());
            }
            for hook in hooks {
                let Some(image) = hook.resolve(&self.request.url).await else {
                    continue;
                };
                debug!(id = %self.request.id, "Resolved by additional cache");
                if self.request.is_satisfied_by(&self.metadata_for(&image)) {
                    self.complete(shared, image, LoadSource::AdditionalCache, None)
                        .await;
                    return Ok(());
                }
                if !self
                    .offer_preview(shared, image, LoadSource::AdditionalCache)
                    .await
                {
                    return Ok(());
                }
                break;
            }
        }

        if !self.request.allows(LoadingSources::NETWORK) {
            debug!(id = %self.request.id, sources = ?self.request.sources, "Allowed sources exhausted");
            return Err(FetchError::Unavailable);
        }
        self.fetch_network(shared).await
    }

    async fn lookup_memory(&self, shared: &Shared) -> Option<(ImageContainer, EntryMetadata)> {
        let id = &self.request.id;
        let lookup = if self.request.resets_expiry() {
            shared.memory.get(id).await
        } else {
            shared.memory.peek(id).await
        };
        match lookup {
            Ok(Some(entry)) => {
                let image = entry.decoded_image()?.clone();
                Some((image, entry.metadata))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(id = %id, error = %e, "Memory cache lookup failed, treating as miss");
                None
            }
        }
    }

    async fn lookup_disk(&self, shared: &Shared) -> Option<(ImageContainer, EntryMetadata)> {
        let id = &self.request.id;
        let lookup = if self.request.resets_expiry() {
            shared.disk.get(id).await
        } else {
            shared.disk.peek(id).await
        };
        let entry = match lookup {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(id = %id, error = %e, "Disk cache lookup failed, treating as miss");
                return None;
            }
        };
        let bytes = entry.encoded_bytes()?.clone();
        let hint = entry.metadata.image_type.clone();
        match shared.decode(bytes, hint.as_ref()).await {
            Ok(image) => Some((image, entry.metadata)),
            Err(e) => {
                warn!(id = %id, error = %e, "Discarding undecodable disk cache entry");
                if let Err(e) = shared.disk.remove(id).await {
                    warn!(id = %id, error = %e, "Failed to remove disk cache entry");
                }
                None
            }
        }
    }

    async fn fetch_network(self: &Arc<Self>, shared: &Arc<Shared>) -> FetchResult<()> {
        if !self.advance(shared, OperationState::Fetching, Some(LoadSource::Network)) {
            return Ok(());
        }
        let permit = shared.gate.acquire(self.request.priority).await;
        if !self.checkpoint(shared) {
            return Ok(());
        }

        let url = self.request.url.as_str();
        let mut report = DownloadReport::start(shared.config.observers(), url);
        info!(id = %self.request.id, url = %url, "Downloading image");

        let mut stream = shared.downloader.start(url).await?;
        let expected = stream.expected_len().filter(|len| *len > 0);
        let hint = self
            .request
            .type_hint
            .clone()
            .or_else(|| stream.content_type().and_then(ImageType::from_mime));

        let mut buffer: Vec<u8> = Vec::new();
        let mut decoder: Option<(ImageType, Box<dyn DecodeSession>)> = None;
        while let Some(chunk) = stream.next_chunk().await? {
            if chunk.is_empty() {
                continue;
            }
            buffer.extend_from_slice(&chunk);
            report.summary.byte_size = buffer.len() as u64;
            let fraction = expected.map(|len| transfer_fraction(buffer.len() as u64, len));

            let partial = match decoder.take() {
                Some((image_type, session)) => {
                    let (session, partial) = append_blocking(session, chunk).await?;
                    decoder = Some((image_type.clone(), session));
                    partial.map(|p| (p, image_type))
                }
                None => match shared.codecs.resolve(&buffer, hint.as_ref()) {
                    CodecLookup::Found(image_type, codec) => {
                        trace!(id = %self.request.id, image_type = %image_type, "Detected image type");
                        report.summary.image_type = Some(image_type.clone());
                        let session = codec.begin_decode(expected);
                        let (session, partial) =
                            append_blocking(session, Bytes::copy_from_slice(&buffer)).await?;
                        decoder = Some((image_type.clone(), session));
                        partial.map(|p| (p, image_type))
                    }
                    CodecLookup::Pending => None,
                    CodecLookup::Unknown => {
                        return Err(FetchError::decode("unrecognised image data"));
                    }
                },
            };

            // Without a length, decoded completeness is the only progress signal.
            let decoded = partial.as_ref().and_then(|(partial, _)| match partial {
                PartialImage::Progressive { completeness, .. } => Some(*completeness),
                PartialImage::FirstFrame(_) => None,
            });
            if let Some((partial, image_type)) = partial {
                let progress = fraction.or(decoded).unwrap_or(0.0);
                self.deliver_partial(shared, partial, image_type, progress);
            }
            if let Some(progress) = fraction.or(decoded) {
                self.deliver_progress(shared, progress);
            }
            if !self.checkpoint(shared) {
                return Ok(());
            }
        }
        drop(stream);
        drop(permit);
        debug!(id = %self.request.id, bytes = buffer.len(), "Download complete");

        if !self.advance(shared, OperationState::Decoding, None) {
            return Ok(());
        }
        let bytes = Bytes::from(buffer);
        let image = match decoder {
            Some((_, session)) => tokio::task::spawn_blocking(move || session.finish())
                .await
                .map_err(|e| FetchError::decode(format!("Decode task panicked: {e}")))??,
            None => shared.decode(bytes.clone(), hint.as_ref()).await?,
        };
        report.summary.image_type = image.image_type().cloned();
        report.summary.dimensions = Some(image.dimensions());
        drop(report);

        self.complete(shared, image, LoadSource::Network, Some(bytes))
            .await;
        Ok(())
    }

    /// Prunes released observers and moves to `state`, announcing `source`.
    /// Returns false when the operation has nobody left to serve.
    fn advance(
        self: &Arc<Self>,
        shared: &Shared,
        state: OperationState,
        source: Option<LoadSource>,
    ) -> bool {
        if !self.checkpoint(shared) {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.finalized {
            return false;
        }
        inner.state = state;
        if let Some(source) = source {
            for slot in &inner.observers {
                shared
                    .executor
                    .submit(slot.delivery(Callback::WillAttempt(source)));
            }
        }
        true
    }

    fn checkpoint(self: &Arc<Self>, shared: &Shared) -> bool {
        let mut inner = self.inner.lock();
        if inner.finalized || inner.state == OperationState::Cancelled {
            return false;
        }
        let before = inner.observers.len();
        inner.observers.retain(ObserverSlot::is_alive);
        if inner.observers.len() != before {
            debug!(
                id = %self.request.id,
                released = before - inner.observers.len(),
                "Dropped released observers"
            );
        }
        if !inner.observers.is_empty() {
            return true;
        }
        inner.state = OperationState::Cancelled;
        inner.finalized = true;
        drop(inner);
        debug!(id = %self.request.id, "No observers left, cancelling fetch");
        shared.retire(self);
        false
    }

    /// Offers a lower-fidelity image to every observer. Returns false when no
    /// observer wants to keep waiting.
    async fn offer_preview(
        self: &Arc<Self>,
        shared: &Arc<Shared>,
        image: ImageContainer,
        source: LoadSource,
    ) -> bool {
        let preview = Arc::new(self.loaded(image, source, None));
        let pending: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.preview = Some(preview.clone());
            inner
                .observers
                .iter()
                .map(|slot| {
                    let (tx, rx) = oneshot::channel();
                    shared
                        .executor
                        .submit(slot.delivery(Callback::Preview(preview.clone(), tx)));
                    (slot.id, rx)
                })
                .collect()
        };
        debug!(id = %self.request.id, source = %source, "Offering preview");

        let answers = join_all(
            pending
                .into_iter()
                .map(|(id, rx)| async move { (id, rx.await.unwrap_or_default()) }),
        )
        .await;

        let mut inner = self.inner.lock();
        inner.preview = None;
        if inner.finalized {
            return false;
        }
        for (observer_id, decision) in answers {
            if decision != PreviewDecision::Stop {
                continue;
            }
            if let Some(position) = inner.observers.iter().position(|s| s.id == observer_id) {
                let slot = inner.observers.remove(position);
                finish_slot(shared, &slot, preview.clone());
            }
        }
        if !inner.observers.is_empty() {
            return true;
        }
        inner.state = OperationState::Completed;
        inner.finalized = true;
        drop(inner);
        debug!(id = %self.request.id, "Every observer accepted the preview");
        shared.retire(self);
        false
    }

    async fn await_late_preview(
        self: Arc<Self>,
        shared: Arc<Shared>,
        observer_id: u64,
        preview: Arc<LoadedImage>,
        rx: oneshot::Receiver<PreviewDecision>,
    ) {
        if rx.await.unwrap_or_default() != PreviewDecision::Stop {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.finalized {
            return;
        }
        if let Some(position) = inner.observers.iter().position(|s| s.id == observer_id) {
            let slot = inner.observers.remove(position);
            finish_slot(&shared, &slot, preview);
        }
    }

    async fn await_progressive_answer(
        self: Arc<Self>,
        shared: Arc<Shared>,
        observer_id: u64,
        rx: oneshot::Receiver<bool>,
    ) {
        let accepted = rx.await.unwrap_or(false);
        let mut inner = self.inner.lock();
        let Inner {
            observers,
            progressive,
            finalized,
            ..
        } = &mut *inner;
        let Some(slot) = observers.iter_mut().find(|s| s.id == observer_id) else {
            return;
        };
        if !accepted {
            slot.progressive = ProgressiveOptIn::Declined;
            return;
        }
        slot.progressive = ProgressiveOptIn::Accepted;
        // A newer partial may have arrived while the answer was pending.
        if let Some(snapshot) = progressive
            && !*finalized
            && slot.partial_progress.is_some_and(|last| snapshot.progress > last)
        {
            shared.executor.submit(slot.delivery(Callback::Progressive(
                snapshot.partial.clone(),
                snapshot.progress,
            )));
            slot.partial_progress = Some(snapshot.progress);
        }
    }

    fn deliver_partial(
        self: &Arc<Self>,
        shared: &Arc<Shared>,
        partial: PartialImage,
        image_type: ImageType,
        progress: f32,
    ) {
        match partial {
            PartialImage::FirstFrame(frame) => {
                let frame = Arc::new(self.loaded(frame, LoadSource::Network, None));
                let mut inner = self.inner.lock();
                if inner.finalized || inner.first_frame.is_some() {
                    return;
                }
                inner.first_frame = Some((frame.clone(), progress));
                for slot in inner.observers.iter_mut().filter(|s| !s.first_frame_sent) {
                    shared
                        .executor
                        .submit(slot.delivery(Callback::FirstFrame(frame.clone(), progress)));
                    slot.first_frame_sent = true;
                }
                debug!(id = %self.request.id, "Delivered first animated frame");
            }
            PartialImage::Progressive { image, .. } => {
                let query = ProgressiveQuery {
                    id: self.request.id.clone(),
                    url: self.request.url.clone(),
                    image_type,
                    dimensions: image.dimensions(),
                };
                let partial = Arc::new(self.loaded(image, LoadSource::Network, None));
                let mut replies = Vec::new();
                let mut inner = self.inner.lock();
                if inner.finalized {
                    return;
                }
                for slot in &mut inner.observers {
                    match slot.progressive {
                        ProgressiveOptIn::Unknown => {
                            let (tx, rx) = oneshot::channel();
                            slot.progressive = ProgressiveOptIn::Pending;
                            slot.partial_progress = Some(progress);
                            shared.executor.submit(slot.delivery(Callback::ProgressiveQuery {
                                query: query.clone(),
                                partial: partial.clone(),
                                progress,
                                reply: tx,
                            }));
                            replies.push((slot.id, rx));
                        }
                        ProgressiveOptIn::Accepted => {
                            if slot.partial_progress.is_none_or(|last| progress >= last) {
                                shared.executor.submit(
                                    slot.delivery(Callback::Progressive(partial.clone(), progress)),
                                );
                                slot.partial_progress = Some(progress);
                            }
                        }
                        ProgressiveOptIn::Pending | ProgressiveOptIn::Declined => {}
                    }
                }
                inner.progressive = Some(ProgressiveSnapshot {
                    query,
                    partial,
                    progress,
                });
                drop(inner);
                for (observer_id, rx) in replies {
                    tokio::spawn(self.clone().await_progressive_answer(
                        shared.clone(),
                        observer_id,
                        rx,
                    ));
                }
            }
        }
    }

    fn deliver_progress(&self, shared: &Shared, progress: f32) {
        let mut inner = self.inner.lock();
        if inner.finalized {
            return;
        }
        inner.progress = Some(inner.progress.map_or(progress, |p| p.max(progress)));
        for slot in inner.observers.iter_mut().filter(|s| progress > s.progress) {
            shared
                .executor
                .submit(slot.delivery(Callback::Progress(progress)));
            slot.progress = progress;
        }
    }

    /// Writes the result back to the caches and delivers it to every observer.
    async fn complete(
        self: &Arc<Self>,
        shared: &Arc<Shared>,
        image: ImageContainer,
        source: LoadSource,
        encoded: Option<Bytes>,
    ) {
        {
            let mut inner = self.inner.lock();
            if inner.finalized || inner.state == OperationState::Cancelled {
                return;
            }
            inner.state = OperationState::Completed;
        }
        if source != LoadSource::MemoryCache {
            shared.put_memory(&self.request, &image).await;
        }
        if !self.request.is_placeholder()
            && matches!(source, LoadSource::Network | LoadSource::AdditionalCache)
        {
            shared
                .put_disk(&self.request, &image, encoded.clone())
                .await;
        }

        let byte_size = encoded.map(|bytes| bytes.len() as u64);
        let mut renditions: HashMap<RenditionKey, Arc<LoadedImage>> = HashMap::new();
        loop {
            let missing: Vec<RenditionKey> = {
                let mut inner = self.inner.lock();
                let mut missing: Vec<RenditionKey> = Vec::new();
                for key in inner.observers.iter().map(ObserverSlot::rendition_key) {
                    if !renditions.contains_key(&key) && !missing.contains(&key) {
                        missing.push(key);
                    }
                }
                if missing.is_empty() {
                    inner.finalized = true;
                    for slot in inner.observers.drain(..) {
                        if let Some(result) = renditions.get(&slot.rendition_key()) {
                            finish_slot(shared, &slot, result.clone());
                        }
                    }
                    break;
                }
                missing
            };
            for key in missing {
                let rendition = scale_for(image.clone(), key).await;
                renditions.insert(key, Arc::new(self.loaded(rendition, source, byte_size)));
            }
        }

        info!(id = %self.request.id, source = %source, "Image loaded");
        shared.retire(self);
    }

    fn fail(self: &Arc<Self>, shared: &Shared, error: FetchError) {
        let mut inner = self.inner.lock();
        if inner.finalized || inner.state == OperationState::Cancelled {
            return;
        }
        inner.state = OperationState::Failed;
        inner.finalized = true;
        warn!(id = %self.request.id, error = %error, "Fetch failed");
        for slot in inner.observers.drain(..) {
            shared
                .executor
                .submit(slot.delivery(Callback::Failed(error.clone())));
        }
        drop(inner);
        shared.retire(self);
    }

    fn metadata_for(&self, image: &ImageContainer) -> EntryMetadata {
        EntryMetadata {
            dimensions: image.dimensions(),
            byte_size: image.byte_cost(),
            image_type: image.image_type().cloned(),
            animated: image.is_animated(),
            placeholder: self.request.is_placeholder(),
            url: self.request.url.clone(),
        }
    }

    fn loaded(&self, image: ImageContainer, source: LoadSource, byte_size: Option<u64>) -> LoadedImage {
        let byte_size = byte_size.unwrap_or_else(|| image.byte_cost());
        LoadedImage {
            id: self.request.id.clone(),
            url: self.request.url.clone(),
            image,
            source,
            placeholder: self.request.is_placeholder(),
            byte_size,
        }
    }
}

/// Submits the success terminal, preceded by progress 1.0 if still owed.
fn finish_slot(shared: &Shared, slot: &ObserverSlot, result: Arc<LoadedImage>) {
    if slot.progress < 1.0 {
        shared
            .executor
            .submit(slot.delivery(Callback::Progress(1.0)));
    }
    shared
        .executor
        .submit(slot.delivery(Callback::Finished(result)));
}

async fn scale_for(image: ImageContainer, (target, mode): RenditionKey) -> ImageContainer {
    let Some(target) = target else {
        return image;
    };
    let fallback = image.clone();
    tokio::task::spawn_blocking(move || image.scaled_to(target, mode))
        .await
        .unwrap_or(fallback)
}

async fn append_blocking(
    mut session: Box<dyn DecodeSession>,
    data: Bytes,
) -> FetchResult<(Box<dyn DecodeSession>, Option<PartialImage>)> {
    tokio::task::spawn_blocking(move || {
        let partial = session.append(&data);
        (session, partial)
    })
    .await
    .map_err(|e| FetchError::decode(format!("Decode task panicked: {e}")))
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn transfer_fraction(received: u64, expected: u64) -> f32 {
    (received as f64 / expected as f64).clamp(0.0, 1.0) as f32
}

/// Reports a download's end to pipeline observers when dropped, including
/// when the operation's task is aborted mid-transfer.
struct DownloadReport {
    observers: Vec<Arc<dyn PipelineObserver>>,
    summary: DownloadSummary,
}

impl DownloadReport {
    fn start(observers: Vec<Arc<dyn PipelineObserver>>, url: &str) -> Self {
        for observer in &observers {
            observer.did_start_download(url);
        }
        Self {
            observers,
            summary: DownloadSummary {
                url: url.to_string(),
                image_type: None,
                byte_size: 0,
                dimensions: None,
                resumed: false,
            },
        }
    }
}

impl Drop for DownloadReport {
    fn drop(&mut self) {
        for observer in &self.observers {
            observer.did_finish_download(&self.summary);
        }
    }
}
