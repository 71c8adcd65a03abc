//! Fetch error types.

use thiserror::Error;

/// Result type for fetch operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Errors surfaced by the pipeline.
///
/// Cancellation is not an error: a detached observer simply receives nothing further.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request failed validation and was never started.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transport-level failure, including timeouts.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// Malformed or unsupported bytes for the claimed type.
    #[error("decode failure: {0}")]
    DecodeFailure(String),

    /// The codec for this image type cannot encode, or encoding failed.
    #[error("encoding unsupported for image type {0}")]
    EncodingUnsupported(String),

    /// Cache I/O error from a maintenance call. Lookups treat cache errors as
    /// misses, so this is never delivered to observers.
    #[error("cache failure: {0}")]
    CacheFailure(String),

    /// Every stage the request allowed missed.
    #[error("image could not be loaded from any of the allowed sources")]
    Unavailable,
}

impl FetchError {
    /// Builds a `NetworkFailure`.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkFailure(message.into())
    }

    /// Builds a `DecodeFailure`.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::DecodeFailure(message.into())
    }
}
