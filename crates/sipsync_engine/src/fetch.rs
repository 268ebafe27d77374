//! Retry-with-backoff JSON fetcher.

use crate::config::{RetryConfig, NOOP_SCHEME};
use crate::error::{SyncError, SyncResult};
use crate::transport::HttpTransport;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fetches JSON documents, retrying transient failures.
///
/// HTTP and network errors are retried with exponential backoff until the
/// attempt budget is spent; the last error is then returned. Parse errors
/// are returned immediately. URLs using [`NOOP_SCHEME`] resolve to an empty
/// array without touching the transport.
#[derive(Clone)]
pub struct RetryingFetcher {
    transport: Arc<dyn HttpTransport>,
    retry: RetryConfig,
}

impl std::fmt::Debug for RetryingFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingFetcher")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RetryingFetcher {
    /// Creates a fetcher over `transport`.
    pub fn new(transport: Arc<dyn HttpTransport>, retry: RetryConfig) -> Self {
        Self { transport, retry }
    }

    /// Returns the default retry configuration.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Fetches `url` with the default retry configuration.
    pub async fn fetch_json(&self, url: &str) -> SyncResult<Value> {
        self.fetch_json_with(url, &self.retry).await
    }

    /// Fetches `url` with an explicit retry configuration.
    pub async fn fetch_json_with(&self, url: &str, retry: &RetryConfig) -> SyncResult<Value> {
        if is_noop(url) {
            debug!(url, "placeholder endpoint, returning empty result");
            return Ok(Value::Array(Vec::new()));
        }

        let mut last_error = None;
        for attempt in 0..retry.max_attempts.max(1) {
            if let Some(error) = &last_error {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    url,
                    attempt = attempt + 1,
                    max_attempts = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying fetch"
                );
                tokio::time::sleep(delay).await;
            }

            match self.fetch_once(url).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::network("no fetch attempts made")))
    }

    async fn fetch_once(&self, url: &str) -> SyncResult<Value> {
        let response = self.transport.get(url).await?;
        if !response.ok() {
            return Err(SyncError::Http {
                status: response.status,
                status_text: response.status_text,
            });
        }
        response.json()
    }
}

/// Returns true for placeholder URLs that must not reach the network.
pub fn is_noop(url: &str) -> bool {
    url.trim().starts_with(NOOP_SCHEME)
}
