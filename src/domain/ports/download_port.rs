//! Port definition for the network collaborator.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::errors::FetchResult;

/// Starts image downloads. Timeouts are the implementation's concern and
/// surface as `FetchError::NetworkFailure`.
#[async_trait]
pub trait ImageDownloader: Send + Sync {
    /// Opens a byte stream for `url`.
    async fn start(&self, url: &str) -> FetchResult<Box<dyn DownloadStream>>;
}

/// An in-progress download. Dropping the stream aborts the transfer.
#[async_trait]
pub trait DownloadStream: Send {
    /// Total payload length, when announced by the server.
    fn expected_len(&self) -> Option<u64>;

    /// Announced content type, if any.
    fn content_type(&self) -> Option<&str>;

    /// Returns the next chunk, or `None` once the payload is complete.
    async fn next_chunk(&mut self) -> FetchResult<Option<Bytes>>;
}
