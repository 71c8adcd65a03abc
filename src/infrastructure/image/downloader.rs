//! HTTP downloader streaming response bodies chunk by chunk.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::domain::errors::{FetchError, FetchResult};
use crate::domain::ports::{DownloadStream, ImageDownloader};

/// Configuration for the HTTP downloader.
#[derive(Debug, Clone)]
pub struct HttpDownloaderConfig {
    /// Whole-request timeout in seconds.
    pub timeout_secs: u64,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// User agent header.
    pub user_agent: String,
}

impl Default for HttpDownloaderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: format!("{}/{}", crate::NAME, crate::VERSION),
        }
    }
}

/// Downloads images over HTTP(S) with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    /// Creates a downloader.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(config: &HttpDownloaderConfig) -> FetchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageDownloader for HttpDownloader {
    async fn start(&self, url: &str) -> FetchResult<Box<dyn DownloadStream>> {
        debug!(url = %url, "Starting download");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::network(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FetchError::network(format!(
                "HTTP {}: {}",
                response.status(),
                response.status().canonical_reason().unwrap_or("Unknown")
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        Ok(Box::new(HttpStream {
            expected_len: response.content_length(),
            content_type,
            response,
        }))
    }
}

struct HttpStream {
    response: reqwest::Response,
    expected_len: Option<u64>,
    content_type: Option<String>,
}

#[async_trait]
impl DownloadStream for HttpStream {
    fn expected_len(&self) -> Option<u64> {
        self.expected_len
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    async fn next_chunk(&mut self) -> FetchResult<Option<Bytes>> {
        let chunk = self
            .response
            .chunk()
            .await
            .map_err(|e| FetchError::network(format!("Failed to read body: {e}")))?;
        if let Some(chunk) = &chunk {
            trace!(len = chunk.len(), "Received chunk");
        }
        Ok(chunk)
    }
}
