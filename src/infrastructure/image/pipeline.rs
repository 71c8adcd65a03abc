//! The image pipeline: entry point for fetching, storing and evicting images.
//!
//! Concurrent fetches with the same identifier and options share a single
//! [`FetchOperation`]; each caller is an observer of that operation and can
//! detach independently through its [`FetchHandle`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::codec::{CodecCatalogue, CodecLookup};
use super::delivery::CallbackExecutor;
use super::disk_cache::DiskImageCache;
use super::downloader::{HttpDownloader, HttpDownloaderConfig};
use super::memory_cache::{CacheStats, MemoryImageCache};
use super::operation::{Detached, FetchOperation, OperationState};
use super::throttle::DownloadGate;
use crate::domain::entities::{
    CacheEntry, CoalescingKey, EntryMetadata, ImageContainer, ImageId, ImageRequest, ImageType,
};
use crate::domain::errors::{FetchError, FetchResult};
use crate::domain::ports::{
    CodecCapabilities, FetchDelegate, ImageCachePort, ImageDownloader, decode_complete,
};
use crate::infrastructure::config::{GlobalConfiguration, PipelineConfig};

/// Severity of a host memory warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    /// The host moved to the background.
    Background,
    /// Memory is getting low; the memory cache is trimmed to half its budget.
    Warning,
    /// Memory is critically low; the memory cache is emptied.
    Critical,
}

/// Snapshot of pipeline activity.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStats {
    /// Memory tier statistics.
    pub memory: CacheStats,
    /// Disk tier statistics.
    pub disk: CacheStats,
    /// Operations currently in flight.
    pub inflight: usize,
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "memory: {}", self.memory)?;
        writeln!(f, "disk:   {}", self.disk)?;
        write!(f, "in flight: {}", self.inflight)
    }
}

/// Returned by [`ImagePipeline::fetch`]; pass it to [`ImagePipeline::cancel`]
/// to detach.
#[derive(Debug, Clone)]
pub struct FetchHandle {
    key: CoalescingKey,
    observer_id: u64,
    operation: Weak<FetchOperation>,
}

impl FetchHandle {
    /// Returns the coalescing key of the underlying operation.
    #[must_use]
    pub const fn key(&self) -> &CoalescingKey {
        &self.key
    }

    /// Returns the operation state, or `None` once the operation is gone.
    #[must_use]
    pub fn state(&self) -> Option<OperationState> {
        self.operation.upgrade().map(|op| op.state())
    }
}

/// State shared between the pipeline and its operations.
pub(crate) struct Shared {
    pub config: Arc<GlobalConfiguration>,
    pub memory: Arc<MemoryImageCache>,
    pub disk: Arc<DiskImageCache>,
    pub codecs: Arc<CodecCatalogue>,
    pub downloader: Arc<dyn ImageDownloader>,
    pub executor: CallbackExecutor,
    pub gate: Arc<DownloadGate>,
    registry: Mutex<HashMap<CoalescingKey, Arc<FetchOperation>>>,
}

impl Shared {
    /// Removes `operation` from the registry if it is still the registered one.
    pub(crate) fn unregister(&self, operation: &Arc<FetchOperation>) {
        let mut registry = self.registry.lock();
        if registry
            .get(operation.key())
            .is_some_and(|current| Arc::ptr_eq(current, operation))
        {
            registry.remove(operation.key());
        }
    }

    /// Reports the operation's end to pipeline observers and unregisters it.
    pub(crate) fn retire(&self, operation: &Arc<FetchOperation>) {
        self.notify_finished(operation.id());
        self.unregister(operation);
    }

    pub(crate) fn notify_started(&self, id: &ImageId) {
        for observer in self.config.observers() {
            observer.operation_did_start(id);
        }
    }

    fn notify_finished(&self, id: &ImageId) {
        for observer in self.config.observers() {
            observer.operation_did_finish(id);
        }
    }

    /// Decodes a complete payload off the async threads.
    pub(crate) async fn decode(
        &self,
        bytes: Bytes,
        hint: Option<&ImageType>,
    ) -> FetchResult<ImageContainer> {
        let codec = match self.codecs.resolve(&bytes, hint) {
            CodecLookup::Found(_, codec) => codec,
            CodecLookup::Pending | CodecLookup::Unknown => {
                return Err(FetchError::decode("unrecognised image data"));
            }
        };
        tokio::task::spawn_blocking(move || decode_complete(codec.as_ref(), &bytes))
            .await
            .map_err(|e| FetchError::decode(format!("Decode task panicked: {e}")))?
    }

    pub(crate) async fn put_memory(&self, request: &ImageRequest, image: &ImageContainer) {
        let entry = CacheEntry::decoded(
            request.id.clone(),
            image.clone(),
            request.url.clone(),
            request.is_placeholder(),
        )
        .with_time_to_live(request.time_to_live);
        match self.memory.put(entry).await {
            Ok(true) => {}
            Ok(false) => debug!(id = %request.id, "No room in memory budget, not cached"),
            Err(e) => warn!(id = %request.id, error = %e, "Failed to cache image in memory"),
        }
    }

    /// Stores `encoded` (or a fresh encoding of `image`) in the disk cache.
    pub(crate) async fn put_disk(
        &self,
        request: &ImageRequest,
        image: &ImageContainer,
        encoded: Option<Bytes>,
    ) {
        let (bytes, image_type) = match encoded {
            Some(bytes) => (bytes, image.image_type().cloned()),
            None => match self.encode_for_disk(image).await {
                Ok((bytes, image_type)) => (bytes, Some(image_type)),
                Err(e) => {
                    debug!(id = %request.id, error = %e, "Not caching image on disk");
                    return;
                }
            },
        };
        let metadata = EntryMetadata {
            dimensions: image.dimensions(),
            byte_size: 0,
            image_type,
            animated: image.is_animated(),
            placeholder: false,
            url: request.url.clone(),
        };
        match self
            .disk
            .put(
                CacheEntry::encoded(request.id.clone(), bytes, metadata)
                    .with_time_to_live(request.time_to_live),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(id = %request.id, "No room in disk budget, not cached"),
            Err(e) => warn!(id = %request.id, error = %e, "Failed to cache image on disk"),
        }
    }

    /// Encodes with the image's own codec when it can encode, PNG otherwise.
    async fn encode_for_disk(&self, image: &ImageContainer) -> FetchResult<(Bytes, ImageType)> {
        let native = image
            .image_type()
            .and_then(|image_type| self.codecs.codec(image_type))
            .filter(|codec| codec.capabilities().contains(CodecCapabilities::ENCODE));
        let fallback = if image.is_animated() {
            ImageType::GIF
        } else {
            ImageType::PNG
        };
        let codec = match native {
            Some(codec) => codec,
            None => self
                .codecs
                .codec(&fallback)
                .ok_or_else(|| FetchError::EncodingUnsupported(fallback.to_string()))?,
        };
        let image_type = codec.image_type();
        let image = image.clone();
        let bytes = tokio::task::spawn_blocking(move || codec.encode(&image))
            .await
            .map_err(|e| FetchError::decode(format!("Encode task panicked: {e}")))??;
        Ok((Bytes::from(bytes), image_type))
    }
}

/// Fetches images through memory cache, disk cache, additional caches and
/// the network, coalescing concurrent requests.
#[derive(Clone)]
pub struct ImagePipeline {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("config", &self.shared.config)
            .field("inflight", &self.inflight_count())
            .finish_non_exhaustive()
    }
}

impl ImagePipeline {
    /// Assembles a pipeline from its parts.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfiguration>,
        memory: Arc<MemoryImageCache>,
        disk: Arc<DiskImageCache>,
        codecs: Arc<CodecCatalogue>,
        downloader: Arc<dyn ImageDownloader>,
    ) -> Self {
        let gate = DownloadGate::new(config.max_concurrent_downloads());
        Self {
            shared: Arc::new(Shared {
                config,
                memory,
                disk,
                codecs,
                downloader,
                executor: CallbackExecutor::spawn(),
                gate,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Builds a pipeline with the standard codecs, an HTTP downloader and
    /// caches sized by `config`.
    ///
    /// # Errors
    /// Returns error if the disk cache cannot be opened or the HTTP client
    /// cannot be created.
    pub async fn with_defaults(
        config: Arc<GlobalConfiguration>,
        settings: &PipelineConfig,
    ) -> FetchResult<Self> {
        let policy = settings.cache.eviction.policy();
        let memory = Arc::new(MemoryImageCache::new(
            config.memory_budget().clone(),
            policy.clone(),
        ));
        let disk = Arc::new(
            DiskImageCache::open(
                settings.effective_cache_dir(),
                config.disk_budget().clone(),
                policy,
            )
            .await?,
        );
        let downloader = HttpDownloader::new(&HttpDownloaderConfig {
            timeout_secs: settings.network.timeout_secs,
            connect_timeout_secs: settings.network.connect_timeout_secs,
            user_agent: settings.network.user_agent.clone(),
        })?;
        info!(
            dir = %disk.cache_dir().display(),
            eviction = settings.cache.eviction.policy().name(),
            "Image pipeline ready"
        );
        Ok(Self::new(
            config,
            memory,
            disk,
            Arc::new(CodecCatalogue::with_defaults()),
            Arc::new(downloader),
        ))
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<GlobalConfiguration> {
        &self.shared.config
    }

    /// Returns the codec catalogue.
    #[must_use]
    pub fn codecs(&self) -> &Arc<CodecCatalogue> {
        &self.shared.codecs
    }

    /// Returns the memory cache.
    #[must_use]
    pub fn memory_cache(&self) -> &Arc<MemoryImageCache> {
        &self.shared.memory
    }

    /// Returns the disk cache.
    #[must_use]
    pub fn disk_cache(&self) -> &Arc<DiskImageCache> {
        &self.shared.disk
    }

    /// Starts or joins a fetch for `request`, reporting to `delegate`.
    ///
    /// The pipeline holds the delegate weakly; dropping it detaches.
    ///
    /// # Errors
    /// Returns `FetchError::InvalidRequest` if the request does not validate.
    pub fn fetch<D: FetchDelegate + 'static>(
        &self,
        request: ImageRequest,
        delegate: &Arc<D>,
    ) -> FetchResult<FetchHandle> {
        let delegate: Arc<dyn FetchDelegate> = delegate.clone();
        self.fetch_dyn(request, &delegate)
    }

    /// [`fetch`](Self::fetch) for trait objects.
    ///
    /// # Errors
    /// Returns `FetchError::InvalidRequest` if the request does not validate.
    pub fn fetch_dyn(
        &self,
        request: ImageRequest,
        delegate: &Arc<dyn FetchDelegate>,
    ) -> FetchResult<FetchHandle> {
        request.validate()?;
        let request = Arc::new(request);
        let key = request.coalescing_key();
        let observer = Arc::downgrade(delegate);

        let (operation, observer_id, created) = {
            let mut registry = self.shared.registry.lock();
            let joined = registry.get(&key).and_then(|existing| {
                existing
                    .attach(&self.shared, observer.clone(), request.clone())
                    .map(|id| (existing.clone(), id))
            });
            match joined {
                Some((operation, id)) => (operation, id, false),
                None => {
                    let operation = FetchOperation::new(request.clone());
                    let Some(id) = operation.attach(&self.shared, observer, request.clone())
                    else {
                        return Err(FetchError::InvalidRequest(
                            "fetch operation rejected observer".into(),
                        ));
                    };
                    registry.insert(key.clone(), operation.clone());
                    (operation, id, true)
                }
            }
        };

        if created {
            debug!(id = %request.id, url = %request.url, "Starting fetch operation");
            self.shared.notify_started(&request.id);
            let task = tokio::spawn(operation.clone().run(self.shared.clone()));
            operation.set_task(task.abort_handle());
        } else {
            debug!(id = %request.id, "Joined in-flight fetch");
        }

        Ok(FetchHandle {
            key,
            observer_id,
            operation: Arc::downgrade(&operation),
        })
    }

    /// Detaches the handle's observer. Cancels the operation when it was the
    /// last one. Undelivered callbacks for this observer are discarded.
    pub fn cancel(&self, handle: &FetchHandle) {
        let Some(operation) = handle.operation.upgrade() else {
            return;
        };
        if operation.detach(handle.observer_id) == Detached::Cancelled {
            self.shared.retire(&operation);
        }
    }

    /// Inserts an image into the caches under `request`'s identifier.
    ///
    /// Placeholder requests are only cached in memory.
    ///
    /// # Errors
    /// Returns `FetchError::InvalidRequest` if the request does not validate.
    pub async fn store(&self, request: &ImageRequest, image: ImageContainer) -> FetchResult<()> {
        request.validate()?;
        self.shared.put_memory(request, &image).await;
        if !request.is_placeholder() {
            self.shared.put_disk(request, &image, None).await;
        }
        Ok(())
    }

    /// Removes one image from both tiers.
    pub async fn clear_image(&self, id: &ImageId) {
        if let Err(e) = self.shared.memory.remove(id).await {
            warn!(id = %id, error = %e, "Failed to remove image from memory cache");
        }
        if let Err(e) = self.shared.disk.remove(id).await {
            warn!(id = %id, error = %e, "Failed to remove image from disk cache");
        }
    }

    /// Empties the memory cache.
    pub async fn clear_memory_cache(&self) {
        if let Err(e) = self.shared.memory.clear().await {
            warn!(error = %e, "Failed to clear memory cache");
        }
    }

    /// Empties the disk cache.
    ///
    /// # Errors
    /// Returns error if cache files cannot be removed.
    pub async fn clear_disk_cache(&self) -> FetchResult<()> {
        self.shared.disk.clear().await?;
        Ok(())
    }

    /// Reacts to a host memory warning.
    pub async fn handle_memory_pressure(&self, pressure: MemoryPressure) {
        info!(pressure = ?pressure, "Handling memory pressure");
        match pressure {
            MemoryPressure::Background => {
                if self.shared.config.clear_memory_on_background() {
                    self.clear_memory_cache().await;
                }
            }
            MemoryPressure::Warning => {
                let half = self.shared.config.memory_budget().max_bytes() / 2;
                self.shared.memory.trim_to(half).await;
            }
            MemoryPressure::Critical => self.clear_memory_cache().await,
        }
    }

    /// Re-applies the cache budgets, evicting as needed. Call after changing them.
    ///
    /// # Errors
    /// Returns error if the disk index cannot be written.
    pub async fn trim_to_budgets(&self) -> FetchResult<()> {
        self.shared.memory.trim().await;
        self.shared.disk.trim().await?;
        Ok(())
    }

    /// Writes cache recency recorded by reads. Call before exiting.
    ///
    /// # Errors
    /// Returns error if the disk index cannot be written.
    pub async fn flush(&self) -> FetchResult<()> {
        self.shared.disk.flush().await?;
        Ok(())
    }

    /// Number of operations in flight.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Returns cache and activity statistics.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            memory: self.shared.memory.stats(),
            disk: self.shared.disk.stats(),
            inflight: self.inflight_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use chrono::TimeDelta;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    use super::super::codec::test_images;
    use super::super::placeholder::PlaceholderSchemeCache;
    use crate::domain::entities::{
        AnimationFrame, Dimensions, FetchOptions, LoadSource, LoadingSources,
    };
    use crate::domain::ports::PreviewDecision;
    use crate::domain::ports::mocks::{
        CountingObserver, DelegateEvent, MockDownloader, RecordingDelegate, StripeCodec,
        encode_stripe, stripe_type,
    };

    const URL: &str = "https://example.com/image.png";

    struct Harness {
        pipeline: ImagePipeline,
        downloader: Arc<MockDownloader>,
        observer: Arc<CountingObserver>,
        _dir: TempDir,
    }

    async fn pipeline_in(dir: &Path, downloader: Arc<MockDownloader>) -> ImagePipeline {
        let config = Arc::new(GlobalConfiguration::default());
        let memory = Arc::new(MemoryImageCache::with_capacity(4 * 1024 * 1024));
        let disk = Arc::new(
            DiskImageCache::with_capacity(dir.join("images"), 4 * 1024 * 1024)
                .await
                .unwrap(),
        );
        let codecs = Arc::new(CodecCatalogue::with_defaults());
        codecs.register(stripe_type(), Arc::new(StripeCodec));
        ImagePipeline::new(config, memory, disk, codecs, downloader)
    }

    async fn harness(downloader: MockDownloader) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(downloader);
        let pipeline = pipeline_in(dir.path(), downloader.clone()).await;
        let observer = Arc::new(CountingObserver::default());
        pipeline.config().add_observer(observer.clone());
        Harness {
            pipeline,
            downloader,
            observer,
            _dir: dir,
        }
    }

    async fn wait_for_download(downloader: &MockDownloader, url: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while downloader.calls(url) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_idle(pipeline: &ImagePipeline) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while pipeline.inflight_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_for_event(delegate: &RecordingDelegate, seen: impl Fn(&DelegateEvent) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !delegate.events().iter().any(&seen) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Lets the gated download through one chunk at a time until `delegate` sees an event.
    async fn release_until(
        gate: &Semaphore,
        delegate: &RecordingDelegate,
        seen: impl Fn(&DelegateEvent) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !delegate.events().iter().any(&seen) {
                if gate.available_permits() == 0 {
                    gate.add_permits(1);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn progressive_values(delegate: &RecordingDelegate) -> Vec<f32> {
        delegate
            .events()
            .into_iter()
            .filter_map(|e| match e {
                DelegateEvent::Progressive(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn is_monotonic(values: &[f32]) -> bool {
        values.windows(2).all(|w| w[0] <= w[1])
    }

    fn finished_source(delegate: &RecordingDelegate) -> Option<LoadSource> {
        delegate.events().into_iter().find_map(|e| match e {
            DelegateEvent::Finished(source) => Some(source),
            _ => None,
        })
    }

    fn terminal_count(delegate: &RecordingDelegate) -> usize {
        delegate.events().iter().filter(|e| e.is_terminal()).count()
    }

    #[tokio::test]
    async fn test_network_fetch_delivers_and_caches() {
        let h = harness(MockDownloader::new()).await;
        h.downloader.respond(URL, &test_images::png(8, 8), 4);
        let delegate = Arc::new(RecordingDelegate::new());

        h.pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
        delegate.wait_terminal().await;

        let events = delegate.events();
        assert_eq!(
            &events[..4],
            &[
                DelegateEvent::Started,
                DelegateEvent::WillAttempt(LoadSource::MemoryCache),
                DelegateEvent::WillAttempt(LoadSource::DiskCache),
                DelegateEvent::WillAttempt(LoadSource::Network),
            ]
        );
        assert_eq!(events.last(), Some(&DelegateEvent::Finished(LoadSource::Network)));
        assert_eq!(terminal_count(&delegate), 1);

        let progress = delegate.progress_values();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last().copied(), Some(1.0));

        let result = delegate.result().unwrap();
        assert_eq!(result.image.dimensions(), Dimensions::new(8, 8));
        assert_eq!(result.image.image_type(), Some(&ImageType::PNG));

        let id = ImageId::from_url(URL);
        assert!(h.pipeline.memory_cache().peek(&id).await.unwrap().is_some());
        assert!(h.pipeline.disk_cache().contains(&id).await);

        wait_idle(&h.pipeline).await;
        assert_eq!(*h.observer.operations.lock(), (1, 1));
        assert_eq!(h.observer.started.lock().len(), 1);
        let summaries = h.observer.finished.lock().clone();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].dimensions, Some(Dimensions::new(8, 8)));
    }

    #[tokio::test]
    async fn test_concurrent_fetches_coalesce() {
        let (downloader, gate) = MockDownloader::gated();
        let h = harness(downloader).await;
        h.downloader.respond(URL, &test_images::png(8, 8), 2);
        let first = Arc::new(RecordingDelegate::new());
        let second = Arc::new(RecordingDelegate::new());

        let a = h.pipeline.fetch(ImageRequest::new(URL), &first).unwrap();
        let b = h.pipeline.fetch(ImageRequest::new(URL), &second).unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(h.pipeline.inflight_count(), 1);

        gate.add_permits(16);
        first.wait_terminal().await;
        second.wait_terminal().await;

        assert_eq!(h.downloader.calls(URL), 1);
        assert!(Arc::ptr_eq(
            &first.result().unwrap(),
            &second.result().unwrap()
        ));
    }

    #[tokio::test]
    async fn test_different_options_are_not_coalesced() {
        let (downloader, gate) = MockDownloader::gated();
        let h = harness(downloader).await;
        h.downloader.respond(URL, &test_images::png(4, 4), 1);
        let first = Arc::new(RecordingDelegate::new());
        let second = Arc::new(RecordingDelegate::new());

        h.pipeline.fetch(ImageRequest::new(URL), &first).unwrap();
        h.pipeline
            .fetch(
                ImageRequest::new(URL).with_options(FetchOptions::DO_NOT_RESET_EXPIRY),
                &second,
            )
            .unwrap();
        assert_eq!(h.pipeline.inflight_count(), 2);

        gate.add_permits(16);
        first.wait_terminal().await;
        second.wait_terminal().await;
    }

    #[tokio::test]
    async fn test_cancelling_only_observer_cancels_operation() {
        let (downloader, gate) = MockDownloader::gated();
        let h = harness(downloader).await;
        h.downloader.respond(URL, &test_images::png(8, 8), 2);
        let delegate = Arc::new(RecordingDelegate::new());

        let handle = h.pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
        wait_for_download(&h.downloader, URL).await;
        h.pipeline.cancel(&handle);
        assert!(matches!(
            handle.state(),
            None | Some(OperationState::Cancelled)
        ));
        assert_eq!(h.pipeline.inflight_count(), 0);

        gate.add_permits(16);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(terminal_count(&delegate), 0);
        let id = ImageId::from_url(URL);
        assert!(h.pipeline.memory_cache().peek(&id).await.unwrap().is_none());
        assert!(!h.pipeline.disk_cache().contains(&id).await);
        assert_eq!(*h.observer.operations.lock(), (1, 1));
        assert_eq!(h.observer.finished.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelling_one_observer_keeps_others() {
        let (downloader, gate) = MockDownloader::gated();
        let h = harness(downloader).await;
        h.downloader.respond(URL, &test_images::png(8, 8), 2);
        let leaving = Arc::new(RecordingDelegate::new());
        let staying = Arc::new(RecordingDelegate::new());

        let handle = h.pipeline.fetch(ImageRequest::new(URL), &leaving).unwrap();
        h.pipeline.fetch(ImageRequest::new(URL), &staying).unwrap();
        h.pipeline.cancel(&handle);
        assert_eq!(h.pipeline.inflight_count(), 1);

        gate.add_permits(16);
        staying.wait_terminal().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(finished_source(&staying), Some(LoadSource::Network));
        assert_eq!(terminal_count(&leaving), 0);
    }

    #[tokio::test]
    async fn test_dropped_delegate_detaches() {
        let (downloader, gate) = MockDownloader::gated();
        let h = harness(downloader).await;
        h.downloader.respond(URL, &test_images::png(8, 8), 2);
        let delegate = Arc::new(RecordingDelegate::new());

        h.pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
        wait_for_download(&h.downloader, URL).await;
        drop(delegate);

        gate.add_permits(16);
        wait_idle(&h.pipeline).await;
        let id = ImageId::from_url(URL);
        assert!(h.pipeline.memory_cache().peek(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_observer_attached_once() {
        let (downloader, gate) = MockDownloader::gated();
        let h = harness(downloader).await;
        h.downloader.respond(URL, &test_images::png(4, 4), 1);
        let delegate = Arc::new(RecordingDelegate::new());

        h.pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
        h.pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();

        gate.add_permits(16);
        delegate.wait_terminal().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let events = delegate.events();
        let starts = events.iter().filter(|e| **e == DelegateEvent::Started).count();
        assert_eq!(starts, 1);
        assert_eq!(terminal_count(&delegate), 1);
    }

    #[tokio::test]
    async fn test_memory_hit_skips_network() {
        let h = harness(MockDownloader::new()).await;
        let request = ImageRequest::new(URL);
        let image = ImageContainer::new(image::DynamicImage::new_rgba8(6, 6));
        h.pipeline.store(&request, image).await.unwrap();
        let delegate = Arc::new(RecordingDelegate::new());

        h.pipeline.fetch(request, &delegate).unwrap();
        delegate.wait_terminal().await;

        assert_eq!(finished_source(&delegate), Some(LoadSource::MemoryCache));
        assert_eq!(h.downloader.total_calls(), 0);
        assert_eq!(delegate.progress_values().last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn test_disk_hit_promotes_to_memory() {
        let h = harness(MockDownloader::new()).await;
        let request = ImageRequest::new(URL);
        let image = ImageContainer::new(image::DynamicImage::new_rgba8(6, 6));
        h.pipeline.store(&request, image).await.unwrap();
        h.pipeline.clear_memory_cache().await;
        let delegate = Arc::new(RecordingDelegate::new());

        h.pipeline.fetch(request.clone(), &delegate).unwrap();
        delegate.wait_terminal().await;

        assert_eq!(finished_source(&delegate), Some(LoadSource::DiskCache));
        assert_eq!(
            delegate.result().unwrap().image.dimensions(),
            Dimensions::new(6, 6)
        );
        assert!(h.pipeline.memory_cache().peek(&request.id).await.unwrap().is_some());
        assert_eq!(h.downloader.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_disk_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(MockDownloader::new());
        downloader.respond(URL, &test_images::png(5, 5), 1);

        {
            let pipeline = pipeline_in(dir.path(), downloader.clone()).await;
            let delegate = Arc::new(RecordingDelegate::new());
            pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
            delegate.wait_terminal().await;
        }

        let pipeline = pipeline_in(dir.path(), downloader.clone()).await;
        let delegate = Arc::new(RecordingDelegate::new());
        pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
        delegate.wait_terminal().await;

        assert_eq!(finished_source(&delegate), Some(LoadSource::DiskCache));
        assert_eq!(downloader.calls(URL), 1);
    }

    #[tokio::test]
    async fn test_placeholder_resolved_by_additional_cache() {
        let h = harness(MockDownloader::new()).await;
        h.pipeline
            .config()
            .add_additional_cache(Arc::new(PlaceholderSchemeCache));
        let request =
            ImageRequest::new("placeholder://4x4/ff0000").with_options(FetchOptions::PLACEHOLDER);
        let delegate = Arc::new(RecordingDelegate::new());

        h.pipeline.fetch(request.clone(), &delegate).unwrap();
        delegate.wait_terminal().await;

        assert!(
            delegate
                .events()
                .contains(&DelegateEvent::WillAttempt(LoadSource::AdditionalCache))
        );
        assert_eq!(finished_source(&delegate), Some(LoadSource::AdditionalCache));
        let result = delegate.result().unwrap();
        assert!(result.placeholder);
        assert_eq!(h.downloader.total_calls(), 0);
        assert!(!h.pipeline.disk_cache().contains(&request.id).await);
        assert!(h.pipeline.memory_cache().peek(&request.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_progressive_partials_for_opted_in_observer() {
        let (downloader, gate) = MockDownloader::gated();
        let h = harness(downloader).await;
        h.downloader.respond(URL, &encode_stripe(4, 3, [9, 9, 9, 255]), 3);
        let eager = Arc::new(RecordingDelegate::with_answers(PreviewDecision::Continue, true));
        let plain = Arc::new(RecordingDelegate::new());

        h.pipeline.fetch(ImageRequest::new(URL), &eager).unwrap();
        h.pipeline.fetch(ImageRequest::new(URL), &plain).unwrap();
        gate.add_permits(16);
        eager.wait_terminal().await;
        plain.wait_terminal().await;

        let events = eager.events();
        let query = events
            .iter()
            .position(|e| *e == DelegateEvent::ProgressiveQuery)
            .unwrap();
        let partial = events
            .iter()
            .position(|e| matches!(e, DelegateEvent::Progressive(_)))
            .unwrap();
        let finished = events.iter().position(DelegateEvent::is_terminal).unwrap();
        assert!(query < partial && partial < finished);
        if let DelegateEvent::Progressive(progress) = events[partial] {
            assert!(progress > 0.0 && progress < 1.0);
        }

        assert!(plain.events().contains(&DelegateEvent::ProgressiveQuery));
        assert!(
            !plain
                .events()
                .iter()
                .any(|e| matches!(e, DelegateEvent::Progressive(_)))
        );
        assert_eq!(
            eager.result().unwrap().image.image_type(),
            Some(&stripe_type())
        );
    }

    #[tokio::test]
    async fn test_animated_first_frame_delivered_once() {
        let h = harness(MockDownloader::new()).await;
        h.downloader
            .respond(URL, &test_images::animated_gif(4, 4, 3), 4);
        let delegate = Arc::new(RecordingDelegate::new());

        h.pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
        delegate.wait_terminal().await;

        let frames = delegate
            .events()
            .iter()
            .filter(|e| matches!(e, DelegateEvent::FirstFrame(_)))
            .count();
        assert_eq!(frames, 1);
        let result = delegate.result().unwrap();
        assert!(result.image.is_animated());
        assert_eq!(result.image.image_type(), Some(&ImageType::GIF));
    }

    #[tokio::test]
    async fn test_preview_stop_finishes_with_cached_image() {
        let h = harness(MockDownloader::new()).await;
        let small = ImageContainer::new(image::DynamicImage::new_rgba8(4, 4));
        h.pipeline.store(&ImageRequest::new(URL), small).await.unwrap();
        let delegate = Arc::new(RecordingDelegate::with_answers(PreviewDecision::Stop, false));

        h.pipeline
            .fetch(ImageRequest::new(URL).with_target(64, 64), &delegate)
            .unwrap();
        delegate.wait_terminal().await;

        let events = delegate.events();
        assert!(events.contains(&DelegateEvent::Preview(LoadSource::MemoryCache)));
        assert_eq!(events.last(), Some(&DelegateEvent::Finished(LoadSource::MemoryCache)));
        assert_eq!(
            delegate.result().unwrap().image.dimensions(),
            Dimensions::new(4, 4)
        );
        wait_idle(&h.pipeline).await;
        assert_eq!(h.downloader.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_preview_continue_fetches_better_image() {
        let h = harness(MockDownloader::new()).await;
        let small = ImageContainer::new(image::DynamicImage::new_rgba8(4, 4));
        h.pipeline.store(&ImageRequest::new(URL), small).await.unwrap();
        h.downloader.respond(URL, &test_images::png(64, 64), 2);
        let delegate = Arc::new(RecordingDelegate::new());

        h.pipeline
            .fetch(ImageRequest::new(URL).with_target(64, 64), &delegate)
            .unwrap();
        delegate.wait_terminal().await;

        assert!(
            delegate
                .events()
                .contains(&DelegateEvent::Preview(LoadSource::MemoryCache))
        );
        assert_eq!(finished_source(&delegate), Some(LoadSource::Network));
        assert_eq!(
            delegate.result().unwrap().image.dimensions(),
            Dimensions::new(64, 64)
        );
    }

    #[tokio::test]
    async fn test_results_scaled_per_observer() {
        let (downloader, gate) = MockDownloader::gated();
        let h = harness(downloader).await;
        h.downloader.respond(URL, &test_images::png(16, 8), 1);
        let thumb = Arc::new(RecordingDelegate::new());
        let full = Arc::new(RecordingDelegate::new());

        h.pipeline
            .fetch(ImageRequest::new(URL).with_target(4, 4), &thumb)
            .unwrap();
        h.pipeline.fetch(ImageRequest::new(URL), &full).unwrap();
        gate.add_permits(16);
        thumb.wait_terminal().await;
        full.wait_terminal().await;

        assert_eq!(
            thumb.result().unwrap().image.dimensions(),
            Dimensions::new(4, 2)
        );
        assert_eq!(
            full.result().unwrap().image.dimensions(),
            Dimensions::new(16, 8)
        );
    }

    #[tokio::test]
    async fn test_network_failure_is_reported() {
        let h = harness(MockDownloader::new()).await;
        let delegate = Arc::new(RecordingDelegate::new());

        h.pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
        delegate.wait_terminal().await;

        assert_eq!(
            delegate.events().last(),
            Some(&DelegateEvent::Failed(FetchError::network("HTTP 404 Not Found")))
        );
        wait_idle(&h.pipeline).await;
        assert_eq!(*h.observer.operations.lock(), (1, 1));
    }

    #[tokio::test]
    async fn test_undecodable_payload_fails() {
        let h = harness(MockDownloader::new()).await;
        h.downloader.respond(URL, b"definitely not an image", 1);
        let delegate = Arc::new(RecordingDelegate::new());

        h.pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
        delegate.wait_terminal().await;

        assert!(matches!(
            delegate.events().last(),
            Some(DelegateEvent::Failed(FetchError::DecodeFailure(_)))
        ));
        let id = ImageId::from_url(URL);
        assert!(h.pipeline.memory_cache().peek(&id).await.unwrap().is_none());
        assert!(!h.pipeline.disk_cache().contains(&id).await);
    }

    #[tokio::test]
    async fn test_content_type_selects_codec() {
        let h = harness(MockDownloader::new()).await;
        h.downloader
            .respond_typed(URL, &test_images::png(3, 3), "image/png");
        let delegate = Arc::new(RecordingDelegate::new());

        h.pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
        delegate.wait_terminal().await;

        assert_eq!(finished_source(&delegate), Some(LoadSource::Network));
        // No announced length: only the completion progress is reported.
        assert_eq!(delegate.progress_values(), vec![1.0]);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let h = harness(MockDownloader::new()).await;
        let delegate = Arc::new(RecordingDelegate::new());

        let result = h.pipeline.fetch(ImageRequest::new(""), &delegate);
        assert!(matches!(result, Err(FetchError::InvalidRequest(_))));
        assert_eq!(h.pipeline.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_pressure() {
        let h = harness(MockDownloader::new()).await;
        let request = ImageRequest::new(URL);
        let image = ImageContainer::new(image::DynamicImage::new_rgba8(6, 6));
        h.pipeline.store(&request, image).await.unwrap();

        h.pipeline.config().set_clear_memory_on_background(false);
        h.pipeline
            .handle_memory_pressure(MemoryPressure::Background)
            .await;
        assert_eq!(h.pipeline.memory_cache().len(), 1);

        h.pipeline
            .handle_memory_pressure(MemoryPressure::Critical)
            .await;
        assert_eq!(h.pipeline.memory_cache().len(), 0);
        assert!(h.pipeline.disk_cache().contains(&request.id).await);
    }

    #[tokio::test]
    async fn test_clear_image_removes_both_tiers() {
        let h = harness(MockDownloader::new()).await;
        let request = ImageRequest::new(URL);
        let image = ImageContainer::new(image::DynamicImage::new_rgba8(6, 6));
        h.pipeline.store(&request, image).await.unwrap();

        h.pipeline.clear_image(&request.id).await;

        let stats = h.pipeline.stats();
        assert_eq!(stats.memory.entries, 0);
        assert_eq!(stats.disk.entries, 0);
        assert_eq!(stats.inflight, 0);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_progressive_partial_replayed() {
        let (downloader, gate) = MockDownloader::gated();
        let h = harness(downloader).await;
        h.downloader.respond(URL, &encode_stripe(4, 4, [9, 9, 9, 255]), 4);
        let early = Arc::new(RecordingDelegate::with_answers(PreviewDecision::Continue, true));
        h.pipeline.fetch(ImageRequest::new(URL), &early).unwrap();

        // Header plus the first row: one partial at half the transfer.
        gate.add_permits(2);
        wait_for_event(&early, |e| matches!(e, DelegateEvent::Progressive(_))).await;
        let late = Arc::new(RecordingDelegate::with_answers(PreviewDecision::Continue, true));
        h.pipeline.fetch(ImageRequest::new(URL), &late).unwrap();
        wait_for_event(&late, |e| matches!(e, DelegateEvent::Progressive(_))).await;

        let replayed = late.events();
        assert_eq!(
            &replayed[..4],
            &[
                DelegateEvent::Started,
                DelegateEvent::Progress(0.5),
                DelegateEvent::ProgressiveQuery,
                DelegateEvent::Progressive(0.5),
            ]
        );

        gate.add_permits(16);
        early.wait_terminal().await;
        late.wait_terminal().await;

        assert_eq!(finished_source(&late), Some(LoadSource::Network));
        assert_eq!(terminal_count(&late), 1);
        assert!(is_monotonic(&late.progress_values()));
        assert!(is_monotonic(&progressive_values(&late)));
        assert_eq!(progressive_values(&late).first(), progressive_values(&early).first());
    }

    #[tokio::test]
    async fn test_late_joiner_gets_first_frame_replayed_once() {
        let (downloader, gate) = MockDownloader::gated();
        let h = harness(downloader).await;
        h.downloader
            .respond(URL, &test_images::animated_gif(4, 4, 3), 8);
        let early = Arc::new(RecordingDelegate::new());
        h.pipeline.fetch(ImageRequest::new(URL), &early).unwrap();

        release_until(&gate, &early, |e| matches!(e, DelegateEvent::FirstFrame(_))).await;
        let late = Arc::new(RecordingDelegate::new());
        h.pipeline.fetch(ImageRequest::new(URL), &late).unwrap();
        wait_for_event(&late, |e| matches!(e, DelegateEvent::FirstFrame(_))).await;

        let replayed = late.events();
        assert_eq!(replayed[0], DelegateEvent::Started);
        assert!(matches!(replayed[1], DelegateEvent::Progress(p) if p > 0.0));
        assert!(matches!(replayed[2], DelegateEvent::FirstFrame(_)));

        gate.add_permits(16);
        early.wait_terminal().await;
        late.wait_terminal().await;

        for delegate in [&early, &late] {
            let frames = delegate
                .events()
                .iter()
                .filter(|e| matches!(e, DelegateEvent::FirstFrame(_)))
                .count();
            assert_eq!(frames, 1);
            assert!(is_monotonic(&delegate.progress_values()));
            assert_eq!(delegate.result().unwrap().image.frame_count(), 3);
        }
    }

    #[tokio::test]
    async fn test_late_joiner_gets_pending_preview() {
        let (downloader, network) = MockDownloader::gated();
        let h = harness(downloader).await;
        let small = ImageContainer::new(image::DynamicImage::new_rgba8(4, 4));
        h.pipeline.store(&ImageRequest::new(URL), small).await.unwrap();
        h.downloader.respond(URL, &test_images::png(64, 64), 2);
        let answers = Arc::new(Semaphore::new(0));
        let early = Arc::new(RecordingDelegate::new().with_preview_gate(answers.clone()));
        let request = ImageRequest::new(URL).with_target(64, 64);

        h.pipeline.fetch(request.clone(), &early).unwrap();
        wait_for_event(&early, |e| matches!(e, DelegateEvent::Preview(_))).await;
        let late = Arc::new(RecordingDelegate::with_answers(PreviewDecision::Stop, false));
        h.pipeline.fetch(request, &late).unwrap();

        answers.add_permits(1);
        late.wait_terminal().await;

        let events = late.events();
        assert_eq!(events[0], DelegateEvent::Started);
        let preview = events
            .iter()
            .position(|e| *e == DelegateEvent::Preview(LoadSource::MemoryCache))
            .unwrap();
        let finished = events.iter().position(DelegateEvent::is_terminal).unwrap();
        assert!(preview < finished);
        assert_eq!(events[finished], DelegateEvent::Finished(LoadSource::MemoryCache));
        assert!(is_monotonic(&late.progress_values()));

        // The disk tier offers a second preview to the remaining observer.
        answers.add_permits(16);
        network.add_permits(16);
        early.wait_terminal().await;
        assert_eq!(finished_source(&early), Some(LoadSource::Network));
        assert_eq!(terminal_count(&late), 1);
    }

    #[tokio::test]
    async fn test_png_loads_progressively() {
        let h = harness(MockDownloader::new()).await;
        h.downloader.respond(URL, &test_images::noisy_png(64, 64), 16);
        let delegate = Arc::new(RecordingDelegate::with_answers(PreviewDecision::Continue, true));

        h.pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
        delegate.wait_terminal().await;

        let partials = progressive_values(&delegate);
        assert!(delegate.events().contains(&DelegateEvent::ProgressiveQuery));
        assert!(!partials.is_empty());
        assert!(partials.iter().all(|p| *p > 0.0 && *p < 1.0));
        assert!(is_monotonic(&partials));
        let result = delegate.result().unwrap();
        assert_eq!(result.image.image_type(), Some(&ImageType::PNG));
        assert_eq!(result.image.dimensions(), Dimensions::new(64, 64));
    }

    #[tokio::test]
    async fn test_unsized_progressive_download_reports_decoded_progress() {
        let h = harness(MockDownloader::new()).await;
        h.downloader
            .respond_unsized(URL, &test_images::noisy_png(128, 128), 6);
        let delegate = Arc::new(RecordingDelegate::with_answers(PreviewDecision::Continue, true));

        h.pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
        delegate.wait_terminal().await;

        let partials = progressive_values(&delegate);
        assert!(!partials.is_empty());
        assert!(partials.iter().all(|p| *p > 0.0));
        let progress = delegate.progress_values();
        assert!(progress.len() > 1, "{progress:?}");
        assert!(progress.iter().all(|p| *p > 0.0));
        assert!(is_monotonic(&progress));
        assert_eq!(progress.last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn test_animation_frames_survive_memory_and_disk() {
        let h = harness(MockDownloader::new()).await;
        h.downloader
            .respond(URL, &test_images::animated_gif(4, 4, 3), 2);
        let network = Arc::new(RecordingDelegate::new());
        h.pipeline.fetch(ImageRequest::new(URL), &network).unwrap();
        network.wait_terminal().await;
        wait_idle(&h.pipeline).await;

        let from_memory = Arc::new(RecordingDelegate::new());
        h.pipeline.fetch(ImageRequest::new(URL), &from_memory).unwrap();
        from_memory.wait_terminal().await;
        assert_eq!(finished_source(&from_memory), Some(LoadSource::MemoryCache));
        let image = from_memory.result().unwrap().image.clone();
        assert_eq!(image.frames().map(<[_]>::len), Some(3));
        assert_eq!(image.duration(), Duration::from_millis(300));

        h.pipeline.clear_memory_cache().await;
        let from_disk = Arc::new(RecordingDelegate::new());
        h.pipeline.fetch(ImageRequest::new(URL), &from_disk).unwrap();
        from_disk.wait_terminal().await;
        assert_eq!(finished_source(&from_disk), Some(LoadSource::DiskCache));
        let image = from_disk.result().unwrap().image.clone();
        assert_eq!(image.frames().map(<[_]>::len), Some(3));
        assert_eq!(h.downloader.calls(URL), 1);
    }

    #[tokio::test]
    async fn test_stored_animation_reencoded_for_disk() {
        let h = harness(MockDownloader::new()).await;
        let codecs = CodecCatalogue::with_defaults();
        let codec = codecs.codec(&ImageType::GIF).unwrap();
        let animation =
            crate::domain::ports::decode_complete(codec.as_ref(), &test_images::animated_gif(4, 4, 3))
                .unwrap();
        let request = ImageRequest::new(URL);
        h.pipeline.store(&request, animation).await.unwrap();
        h.pipeline.clear_memory_cache().await;

        let delegate = Arc::new(RecordingDelegate::new());
        h.pipeline.fetch(request, &delegate).unwrap();
        delegate.wait_terminal().await;

        assert_eq!(finished_source(&delegate), Some(LoadSource::DiskCache));
        let image = delegate.result().unwrap().image.clone();
        assert_eq!(image.frame_count(), 3);
        assert_eq!(image.image_type(), Some(&ImageType::GIF));
    }

    #[tokio::test]
    async fn test_offline_request_with_cold_caches_is_unavailable() {
        let h = harness(MockDownloader::new()).await;
        h.downloader.respond(URL, &test_images::png(4, 4), 1);
        let delegate = Arc::new(RecordingDelegate::new());
        let request =
            ImageRequest::new(URL).with_sources(LoadingSources::all() - LoadingSources::NETWORK);

        h.pipeline.fetch(request, &delegate).unwrap();
        delegate.wait_terminal().await;

        assert_eq!(
            delegate.events().last(),
            Some(&DelegateEvent::Failed(FetchError::Unavailable))
        );
        assert!(
            !delegate
                .events()
                .contains(&DelegateEvent::WillAttempt(LoadSource::Network))
        );
        assert_eq!(h.downloader.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_disallowed_disk_tier_is_skipped() {
        let h = harness(MockDownloader::new()).await;
        let request = ImageRequest::new(URL);
        let image = ImageContainer::new(image::DynamicImage::new_rgba8(6, 6));
        h.pipeline.store(&request, image).await.unwrap();
        h.pipeline.clear_memory_cache().await;
        h.downloader.respond(URL, &test_images::png(6, 6), 1);
        let delegate = Arc::new(RecordingDelegate::new());

        h.pipeline
            .fetch(
                request.with_sources(LoadingSources::MEMORY_CACHE | LoadingSources::NETWORK),
                &delegate,
            )
            .unwrap();
        delegate.wait_terminal().await;

        assert!(
            !delegate
                .events()
                .contains(&DelegateEvent::WillAttempt(LoadSource::DiskCache))
        );
        assert_eq!(finished_source(&delegate), Some(LoadSource::Network));
        assert_eq!(h.downloader.calls(URL), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_refetched() {
        let h = harness(MockDownloader::new()).await;
        let request = ImageRequest::new(URL).with_time_to_live(TimeDelta::milliseconds(1));
        let image = ImageContainer::new(image::DynamicImage::new_rgba8(6, 6));
        h.pipeline.store(&request, image).await.unwrap();
        h.downloader.respond(URL, &test_images::png(6, 6), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let delegate = Arc::new(RecordingDelegate::new());
        h.pipeline.fetch(ImageRequest::new(URL), &delegate).unwrap();
        delegate.wait_terminal().await;

        assert_eq!(finished_source(&delegate), Some(LoadSource::Network));
        assert_eq!(h.downloader.calls(URL), 1);
    }

    #[tokio::test]
    async fn test_animation_without_encoder_stored_as_gif() {
        let h = harness(MockDownloader::new()).await;
        let frames = (0..3u8)
            .map(|i| {
                let pixel = image::Rgba([i * 80, 0, 0, 255]);
                AnimationFrame::new(
                    image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(4, 4, pixel)),
                    Duration::from_millis(50),
                )
            })
            .collect();
        let animation = ImageContainer::animated(frames)
            .unwrap()
            .with_type(ImageType::WEBP);
        let request = ImageRequest::new(URL);
        h.pipeline.store(&request, animation).await.unwrap();
        h.pipeline.clear_memory_cache().await;

        let delegate = Arc::new(RecordingDelegate::new());
        h.pipeline.fetch(request, &delegate).unwrap();
        delegate.wait_terminal().await;

        assert_eq!(finished_source(&delegate), Some(LoadSource::DiskCache));
        let image = delegate.result().unwrap().image.clone();
        assert_eq!(image.image_type(), Some(&ImageType::GIF));
        assert_eq!(image.frame_count(), 3);
    }
}
