//! Port for externally supplied caches consulted before the network.

use async_trait::async_trait;

use crate::domain::entities::ImageContainer;

/// An external image source the pipeline does not own.
///
/// Consulted after the disk cache and before the network, in registration
/// order; the first hook returning an image wins.
#[async_trait]
pub trait AdditionalCache: Send + Sync {
    /// Attempts to resolve an image for `url`.
    async fn resolve(&self, url: &str) -> Option<ImageContainer>;
}
