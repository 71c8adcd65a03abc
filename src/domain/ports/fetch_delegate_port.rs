//! Observer port for fetch operations.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::entities::{Dimensions, ImageId, ImageRequest, ImageType, LoadSource, LoadedImage};
use crate::domain::errors::FetchError;

/// What an observer wants after seeing a preview.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PreviewDecision {
    /// Keep loading the final image.
    #[default]
    Continue,
    /// Accept the preview as this observer's final result.
    Stop,
}

/// Details offered when asking whether to deliver progressive updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressiveQuery {
    /// The image identifier.
    pub id: ImageId,
    /// The URL being loaded.
    pub url: String,
    /// The detected image type.
    pub image_type: ImageType,
    /// The full image dimensions.
    pub dimensions: Dimensions,
}

/// Receives the ordered callback sequence of a fetch operation.
///
/// Every method is optional. Callbacks run one at a time on the pipeline's
/// callback executor, so a slow implementation delays every observer.
/// The two queries suspend the operation's corresponding step until answered.
#[async_trait]
pub trait FetchDelegate: Send + Sync {
    /// The operation started.
    async fn did_start(&self, _request: &ImageRequest) {}

    /// A source is about to be consulted.
    async fn will_attempt_source(&self, _request: &ImageRequest, _source: LoadSource) {}

    /// A lower-fidelity image is available.
    async fn did_load_preview(
        &self,
        _request: &ImageRequest,
        _preview: Arc<LoadedImage>,
    ) -> PreviewDecision {
        PreviewDecision::Continue
    }

    /// Asked once, when the first partial image becomes available.
    async fn should_load_progressively(
        &self,
        _request: &ImageRequest,
        _query: &ProgressiveQuery,
    ) -> bool {
        false
    }

    /// A progressive partial image was decoded.
    async fn did_update_progressive(
        &self,
        _request: &ImageRequest,
        _partial: Arc<LoadedImage>,
        _progress: f32,
    ) {
    }

    /// The first frame of an animated image was decoded.
    async fn did_load_first_animated_frame(
        &self,
        _request: &ImageRequest,
        _frame: Arc<LoadedImage>,
        _progress: f32,
    ) {
    }

    /// Transfer progress advanced.
    async fn did_update_progress(&self, _request: &ImageRequest, _progress: f32) {}

    /// Terminal success.
    async fn did_load_final(&self, _request: &ImageRequest, _result: Arc<LoadedImage>) {}

    /// Terminal failure.
    async fn did_fail(&self, _request: &ImageRequest, _error: FetchError) {}
}
