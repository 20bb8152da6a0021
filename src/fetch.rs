//! HTTP asset fetching behind a backend trait.
//!
//! The scheduler talks to an [`AssetFetcher`] so tests can substitute a fake
//! backend; production uses [`HttpFetcher`] (reqwest with rustls).

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// User agent for HTTP requests.
pub const USER_AGENT: &str = concat!("fieldcache/", env!("CARGO_PKG_VERSION"));

/// Fetch failures, as seen by the scheduler's retry logic.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Request failed or returned a non-success status. Retryable.
    #[error("network error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Network {
        status: Option<u16>,
        message: String,
    },
    /// The attempt exceeded the fetch timeout. Retryable.
    #[error("fetch timed out after {seconds}s")]
    TimedOut { seconds: u64 },
    /// The attempt was cancelled cooperatively (pause, cancel, shutdown).
    #[error("fetch aborted")]
    Aborted,
}

/// Progress callback: (downloaded bytes, server-reported total when known).
/// Invoked once per received chunk, in non-decreasing byte order.
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Backend that fetches the full body of a URL.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Fetch `url` to completion, reporting progress per chunk and observing
    /// `cancel` at chunk boundaries.
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
        on_progress: &ProgressFn,
    ) -> Result<Vec<u8>, FetchError>;
}

/// Streaming HTTP GET fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Create a fetcher with a per-attempt timeout covering the whole
    /// transfer (connect through last body chunk).
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .brotli(true)
            .build()
            .expect("Failed to create HTTP client");
        Self { client, timeout }
    }

    async fn fetch_inner(
        &self,
        url: &str,
        cancel: &CancellationToken,
        on_progress: &ProgressFn,
    ) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            FetchError::Network {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Network {
                status: Some(status.as_u16()),
                message: format!("HTTP {}", status),
            });
        }

        let total = response.content_length();
        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Aborted),
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        body.extend_from_slice(&bytes);
                        on_progress(body.len() as u64, total);
                    }
                    Some(Err(e)) => {
                        return Err(FetchError::Network {
                            status: None,
                            message: e.to_string(),
                        });
                    }
                    None => break,
                },
            }
        }

        Ok(body)
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
        on_progress: &ProgressFn,
    ) -> Result<Vec<u8>, FetchError> {
        match tokio::time::timeout(self.timeout, self.fetch_inner(url, cancel, on_progress)).await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::TimedOut {
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}
