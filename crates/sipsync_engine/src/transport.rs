//! HTTP transport abstraction.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};

/// A response from the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Reason phrase.
    pub status_text: String,
    /// Raw response body.
    pub body: String,
}

impl HttpResponse {
    /// Creates a `200 OK` response with `body`.
    pub fn ok_with(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            body: body.into(),
        }
    }

    /// Creates an empty response with `status`.
    pub fn status(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            body: String::new(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> SyncResult<T> {
        serde_json::from_str(&self.body).map_err(|e| SyncError::Parse(e.to_string()))
    }
}

/// The HTTP capability consumed by the fetcher.
///
/// Implementations return `Err(SyncError::Network)` when no response was
/// received and `Ok` for every response, whatever its status.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Performs a GET request.
    async fn get(&self, url: &str) -> SyncResult<HttpResponse>;
}

enum Scripted {
    Response(HttpResponse),
    Failure(SyncError),
}

/// A scripted transport for testing.
///
/// Each URL has a queue of one-shot replies, consumed in order, and an
/// optional fallback response served once the queue is empty. Unknown URLs
/// answer `404 Not Found`.
#[derive(Default)]
pub struct MockTransport {
    scripted: Mutex<HashMap<String, VecDeque<Scripted>>>,
    fallback: Mutex<HashMap<String, HttpResponse>>,
    calls: Mutex<Vec<String>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `response` for `url` whenever nothing is scripted.
    pub fn set_response(&self, url: &str, response: HttpResponse) {
        self.fallback.lock().insert(url.to_string(), response);
    }

    /// Serves `body` as `200 OK` for `url` whenever nothing is scripted.
    pub fn set_json(&self, url: &str, body: &serde_json::Value) {
        self.set_response(url, HttpResponse::ok_with(body.to_string()));
    }

    /// Queues a one-shot response for `url`.
    pub fn push_response(&self, url: &str, response: HttpResponse) {
        self.push(url, Scripted::Response(response));
    }

    /// Queues a one-shot failure for `url`.
    pub fn push_failure(&self, url: &str, error: SyncError) {
        self.push(url, Scripted::Failure(error));
    }

    fn push(&self, url: &str, reply: Scripted) {
        self.scripted
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Returns how many requests were made to `url`.
    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|u| *u == url).count()
    }

    /// Returns every requested URL in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn get(&self, url: &str) -> SyncResult<HttpResponse> {
        self.calls.lock().push(url.to_string());

        let scripted = self
            .scripted
            .lock()
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::Failure(error)) => Err(error),
            None => Ok(self
                .fallback
                .lock()
                .get(url)
                .cloned()
                .unwrap_or_else(|| HttpResponse::status(404, "Not Found"))),
        }
    }
}
