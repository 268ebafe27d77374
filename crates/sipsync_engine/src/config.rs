//! Configuration for the sync engine.

use crate::collection::Collection;
use sipsync_core::CoreConfig;
use std::collections::BTreeMap;
use std::time::Duration;

/// URL scheme that short-circuits to an empty result without a request.
///
/// Point a collection's endpoint at `noop://` to disable it without
/// turning every refresh into an error.
pub const NOOP_SCHEME: &str = "noop://";

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL that relative endpoints are resolved against.
    pub base_url: String,
    /// Endpoint per collection, absolute or relative to `base_url`.
    pub endpoints: BTreeMap<Collection, String>,
    /// Retry configuration for fetches.
    pub retry: RetryConfig,
    /// Delay after the primary refresh before each background collection runs.
    pub background_delays: BTreeMap<Collection, Duration>,
    /// Cache database configuration.
    pub core: CoreConfig,
}

impl SyncConfig {
    /// Creates a configuration with default endpoints under `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            endpoints: Collection::ALL
                .into_iter()
                .map(|c| (c, c.default_endpoint().to_string()))
                .collect(),
            retry: RetryConfig::default(),
            background_delays: BTreeMap::from([
                (Collection::History, Duration::from_secs(2)),
                (Collection::Rewards, Duration::from_secs(4)),
            ]),
            core: CoreConfig::default(),
        }
    }

    /// Sets the endpoint of `collection`.
    pub fn with_endpoint(mut self, collection: Collection, endpoint: impl Into<String>) -> Self {
        self.endpoints.insert(collection, endpoint.into());
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets how long `collection` waits after the primary refresh.
    pub fn with_background_delay(mut self, collection: Collection, delay: Duration) -> Self {
        self.background_delays.insert(collection, delay);
        self
    }

    /// Sets the cache database configuration.
    pub fn with_core(mut self, core: CoreConfig) -> Self {
        self.core = core;
        self
    }

    /// Returns the background delay of `collection`.
    pub fn background_delay(&self, collection: Collection) -> Duration {
        self.background_delays
            .get(&collection)
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Resolves `endpoint` against the base URL.
    ///
    /// Absolute URLs (including `noop://`) are returned as-is. Returns `None`
    /// for an empty endpoint, or a relative one without a base URL.
    pub fn resolve(&self, endpoint: &str) -> Option<String> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return None;
        }
        if endpoint.contains("://") {
            return Some(endpoint.to_string());
        }
        let base = self.base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return None;
        }
        Some(format!("{base}/{}", endpoint.trim_start_matches('/')))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 1.5,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    ///
    /// The first attempt runs immediately; attempt `n` waits
    /// `initial_delay * backoff_multiplier^(n-1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        Duration::from_secs_f64(base_delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
