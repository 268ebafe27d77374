//! Cache database configuration.

use std::time::Duration;

/// Timeouts used by the [`LockManager`](crate::LockManager).
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a holder may keep the lock before it is forcibly released.
    pub hold_timeout: Duration,

    /// Default time a request may wait in the queue.
    pub acquisition_timeout: Duration,

    /// Default time `prepare_for_shutdown` waits for the holder to finish.
    pub shutdown_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            hold_timeout: Duration::from_secs(15),
            acquisition_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl LockConfig {
    /// Creates a configuration with default timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hold timeout.
    #[must_use]
    pub const fn hold_timeout(mut self, timeout: Duration) -> Self {
        self.hold_timeout = timeout;
        self
    }

    /// Sets the default acquisition timeout.
    #[must_use]
    pub const fn acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = timeout;
        self
    }

    /// Sets the default shutdown timeout.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Configuration for opening a cache database.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Lock manager timeouts.
    pub lock: LockConfig,

    /// Rows per insert statement during a replace-all.
    pub batch_size: usize,

    /// How long concurrent initializers wait for the first one to finish.
    pub ready_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            batch_size: 50,
            ready_timeout: Duration::from_secs(30),
        }
    }
}

impl CoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock configuration.
    #[must_use]
    pub fn lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the insert batch size. Values below one are clamped to one.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the readiness wait timeout.
    #[must_use]
    pub const fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}
