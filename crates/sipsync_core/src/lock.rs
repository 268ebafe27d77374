//! FIFO lock manager for destructive table operations.
//!
//! The lock manager owns a single holder slot and a queue of pending
//! requests. Requests are granted strictly in arrival order.
//!
//! ## Timeouts
//!
//! Two independent timers bound every request:
//! - the **acquisition timeout** bounds how long a request may sit in the
//!   queue. When it elapses the request is removed and the caller gets
//!   [`CoreError::LockTimeout`]. Other queued requests keep their order.
//! - the **hold timeout** bounds how long a holder may keep the slot. When it
//!   elapses the slot is forcibly released and handed to the next request.
//!
//! Both timers are cancelled on their normal completion path.
//!
//! ## Usage
//!
//! ```ignore
//! let locks = LockManager::new(LockConfig::default());
//! locks
//!     .with_lock("catalog_items", || async {
//!         // destructive multi-statement work
//!         Ok::<_, CoreError>(())
//!     })
//!     .await?;
//! ```

use crate::config::LockConfig;
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Far enough ahead to mean "never" without overflowing `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Returns `now + timeout`, saturating at [`FAR_FUTURE`].
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout.min(FAR_FUTURE))
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// A request waiting for the lock.
#[derive(Debug)]
struct LockRequest {
    ticket: u64,
    operation: String,
    enqueued_at: Instant,
    acquisition_deadline: Instant,
    grant: oneshot::Sender<()>,
}

/// The current owner of the lock. At most one exists at a time.
#[derive(Debug)]
struct LockHolder {
    ticket: u64,
    operation: String,
    acquired_at: Instant,
    hold_deadline: Instant,
    hold_timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<LockHolder>,
    queue: VecDeque<LockRequest>,
    shutting_down: bool,
    next_ticket: u64,
}

impl LockState {
    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn remove_request(&mut self, ticket: u64) -> Option<LockRequest> {
        let position = self.queue.iter().position(|r| r.ticket == ticket)?;
        self.queue.remove(position)
    }
}

/// Snapshot of the current holder.
#[derive(Debug, Clone)]
pub struct HolderInfo {
    /// Operation holding the lock.
    pub operation: String,
    /// How long the lock has been held.
    pub held_for: Duration,
    /// Time left before the hold timeout forces a release.
    pub remaining: Duration,
}

struct Inner {
    config: LockConfig,
    state: Mutex<LockState>,
    released: Notify,
}

impl Inner {
    /// Installs `operation` as the holder and arms its hold timer.
    fn install_holder(self: &Arc<Self>, state: &mut LockState, ticket: u64, operation: String) {
        let now = Instant::now();
        let hold_timeout = self.config.hold_timeout;
        let hold_timer = spawn_hold_timer(Arc::downgrade(self), ticket, hold_timeout);
        state.holder = Some(LockHolder {
            ticket,
            operation,
            acquired_at: now,
            hold_deadline: deadline_after(now, hold_timeout),
            hold_timer,
        });
    }

    /// Hands the free slot to the oldest request whose caller is still waiting.
    fn grant_next(self: &Arc<Self>, state: &mut LockState) {
        while let Some(request) = state.queue.pop_front() {
            let LockRequest {
                ticket,
                operation,
                enqueued_at,
                acquisition_deadline,
                grant,
            } = request;

            self.install_holder(state, ticket, operation.clone());
            if grant.send(()).is_ok() {
                info!(operation = %operation, "lock acquired");
                debug!(
                    waited_ms = enqueued_at.elapsed().as_millis() as u64,
                    deadline_left_ms = acquisition_deadline
                        .saturating_duration_since(Instant::now())
                        .as_millis() as u64,
                    "queued lock request granted"
                );
                return;
            }

            // Caller went away between enqueue and grant.
            if let Some(mut holder) = state.holder.take() {
                if let Some(timer) = holder.hold_timer.take() {
                    timer.abort();
                }
            }
            debug!(operation = %operation, "lock request abandoned before grant");
        }
    }

    /// Releases the holder if it still owns `ticket`.
    fn release_ticket(self: &Arc<Self>, ticket: u64) -> bool {
        let mut state = self.state.lock();
        let Some(holder) = state.holder.take_if(|h| h.ticket == ticket) else {
            return false;
        };
        self.finish(&mut state, holder, true);
        drop(state);
        self.released.notify_waiters();
        true
    }

    /// Called by the hold timer.
    fn force_release(self: &Arc<Self>, ticket: u64) {
        let mut state = self.state.lock();
        let Some(holder) = state.holder.take_if(|h| h.ticket == ticket) else {
            return;
        };
        warn!(
            operation = %holder.operation,
            held_ms = holder.acquired_at.elapsed().as_millis() as u64,
            "lock forcibly released after hold timeout"
        );
        self.finish(&mut state, holder, false);
        drop(state);
        self.released.notify_waiters();
    }

    fn finish(self: &Arc<Self>, state: &mut LockState, mut holder: LockHolder, abort_timer: bool) {
        if let Some(timer) = holder.hold_timer.take() {
            if abort_timer {
                timer.abort();
            }
        }
        info!(
            operation = %holder.operation,
            held_ms = holder.acquired_at.elapsed().as_millis() as u64,
            "lock released"
        );
        self.grant_next(state);
    }
}

fn spawn_hold_timer(inner: Weak<Inner>, ticket: u64, hold_timeout: Duration) -> Option<JoinHandle<()>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!("no tokio runtime, hold timer disabled");
        return None;
    };
    let timer = async move {
        tokio::time::sleep(hold_timeout).await;
        if let Some(inner) = inner.upgrade() {
            inner.force_release(ticket);
        }
    };
    Some(runtime.spawn(timer.in_current_span()))
}

/// A named, single-holder, FIFO-queued async mutex.
///
/// Cloning is cheap; clones share the same holder slot and queue.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("current_operation", &self.current_operation())
            .field("queue_length", &self.queue_length())
            .finish()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

impl LockManager {
    /// Creates a lock manager with the given timeouts.
    pub fn new(config: LockConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(LockState::default()),
                released: Notify::new(),
            }),
        }
    }

    /// Returns the configured timeouts.
    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    /// Acquires the lock for `operation`.
    ///
    /// If the slot is free it is taken immediately. Otherwise the request is
    /// queued behind earlier ones and waits up to `acquisition_timeout`
    /// (the configured default when `None`).
    ///
    /// # Errors
    ///
    /// - [`CoreError::ShuttingDown`] once [`prepare_for_shutdown`](Self::prepare_for_shutdown) was called
    /// - [`CoreError::LockTimeout`] if the request was not granted in time
    /// - [`CoreError::LockCancelled`] if the manager was reset while queued
    pub async fn acquire(
        &self,
        operation: &str,
        acquisition_timeout: Option<Duration>,
    ) -> CoreResult<LockGuard> {
        let timeout = acquisition_timeout.unwrap_or(self.inner.config.acquisition_timeout);

        let (ticket, granted) = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                warn!(operation, "lock request rejected during shutdown");
                return Err(CoreError::ShuttingDown {
                    operation: operation.to_string(),
                });
            }

            let ticket = state.issue_ticket();
            if state.holder.is_none() {
                self.inner
                    .install_holder(&mut state, ticket, operation.to_string());
                info!(operation, "lock acquired");
                return Ok(LockGuard::new(Arc::clone(&self.inner), ticket, operation));
            }

            let (grant, granted) = oneshot::channel();
            let now = Instant::now();
            state.queue.push_back(LockRequest {
                ticket,
                operation: operation.to_string(),
                enqueued_at: now,
                acquisition_deadline: deadline_after(now, timeout),
                grant,
            });
            info!(
                operation,
                holder = state.holder.as_ref().map(|h| h.operation.as_str()).unwrap_or(""),
                position = state.queue.len(),
                "waiting for lock"
            );
            (ticket, granted)
        };

        let mut pending = PendingAcquire {
            inner: Arc::clone(&self.inner),
            ticket,
            armed: true,
        };
        let outcome = tokio::time::timeout(timeout, granted).await;
        pending.armed = false;

        match outcome {
            Ok(Ok(())) => Ok(LockGuard::new(Arc::clone(&self.inner), ticket, operation)),
            Ok(Err(_)) => Err(CoreError::LockCancelled {
                operation: operation.to_string(),
            }),
            Err(_) => {
                let mut state = self.inner.state.lock();
                if state.remove_request(ticket).is_some() {
                    warn!(
                        operation,
                        timeout_ms = timeout.as_millis() as u64,
                        remaining_queue = state.queue.len(),
                        "lock acquisition timed out"
                    );
                    return Err(CoreError::LockTimeout {
                        operation: operation.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                // Granted in the same instant the deadline passed.
                if state.holder.as_ref().is_some_and(|h| h.ticket == ticket) {
                    return Ok(LockGuard::new(Arc::clone(&self.inner), ticket, operation));
                }
                Err(CoreError::LockCancelled {
                    operation: operation.to_string(),
                })
            }
        }
    }

    /// Runs `f` while holding the lock for `operation`.
    ///
    /// The lock is released on every exit path, including when the returned
    /// future is dropped before completion.
    pub async fn with_lock<F, Fut, T, E>(&self, operation: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoreError>,
    {
        let guard = self.acquire(operation, None).await?;
        let result = f().await;
        if !guard.is_held() {
            warn!(operation, "critical section outlived its hold timeout");
        }
        guard.release();
        result
    }

    /// Releases the lock if `operation` currently holds it.
    ///
    /// Releasing a name that does not hold the lock is a no-op.
    pub fn release(&self, operation: &str) {
        let mut state = self.inner.state.lock();
        let Some(holder) = state.holder.take_if(|h| h.operation == operation) else {
            debug!(operation, "release ignored, operation does not hold the lock");
            return;
        };
        self.inner.finish(&mut state, holder, true);
        drop(state);
        self.inner.released.notify_waiters();
    }

    /// Returns true if the slot is taken.
    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().holder.is_some()
    }

    /// Returns the number of queued requests.
    pub fn queue_length(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Returns the operation holding the lock, if any.
    pub fn current_operation(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .holder
            .as_ref()
            .map(|h| h.operation.clone())
    }

    /// Returns details about the current holder, if any.
    pub fn holder_info(&self) -> Option<HolderInfo> {
        let state = self.inner.state.lock();
        state.holder.as_ref().map(|h| HolderInfo {
            operation: h.operation.clone(),
            held_for: h.acquired_at.elapsed(),
            remaining: h.hold_deadline.saturating_duration_since(Instant::now()),
        })
    }

    /// Returns true once shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Stops accepting new requests and waits for the slot to become free.
    ///
    /// Requests that were already queued are still served. Returns `true`
    /// once no holder remains, `false` if one is still present at the
    /// deadline.
    pub async fn prepare_for_shutdown(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(self.inner.config.shutdown_timeout);
        let deadline = deadline_after(Instant::now(), timeout);

        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            if !state.queue.is_empty() {
                warn!(
                    queued = state.queue.len(),
                    "shutting down with queued lock requests"
                );
            }
            info!(
                holder = state.holder.as_ref().map(|h| h.operation.as_str()).unwrap_or(""),
                timeout_ms = timeout.as_millis() as u64,
                "lock manager preparing for shutdown"
            );
        }

        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if !self.is_locked() {
                return true;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                let free = !self.is_locked();
                if !free {
                    warn!(
                        holder = self.current_operation().unwrap_or_default(),
                        "lock still held at shutdown deadline"
                    );
                }
                return free;
            }
        }
    }

    /// Drops the holder and every queued request and leaves shutdown mode.
    ///
    /// Queued callers fail with [`CoreError::LockCancelled`].
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        if let Some(mut holder) = state.holder.take() {
            if let Some(timer) = holder.hold_timer.take() {
                timer.abort();
            }
            warn!(operation = %holder.operation, "lock holder dropped by reset");
        }
        let dropped = state.queue.len();
        state.queue.clear();
        state.shutting_down = false;
        drop(state);
        if dropped > 0 {
            warn!(dropped, "queued lock requests dropped by reset");
        }
        self.inner.released.notify_waiters();
    }
}

/// Removes a queued request whose caller stopped waiting.
struct PendingAcquire {
    inner: Arc<Inner>,
    ticket: u64,
    armed: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = self.inner.state.lock().remove_request(self.ticket).is_some();
        if removed {
            debug!(ticket = self.ticket, "lock request abandoned while queued");
        } else {
            // Granted but never observed by the caller.
            self.inner.release_ticket(self.ticket);
        }
    }
}

/// Proof of holding the lock. Releases it on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    inner: Arc<Inner>,
    ticket: u64,
    operation: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("operation", &self.operation)
            .field("ticket", &self.ticket)
            .finish()
    }
}

impl LockGuard {
    fn new(inner: Arc<Inner>, ticket: u64, operation: &str) -> Self {
        Self {
            inner,
            ticket,
            operation: operation.to_string(),
            released: false,
        }
    }

    /// Returns the operation name this guard was acquired for.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Returns false once the hold timeout forcibly released the lock.
    pub fn is_held(&self) -> bool {
        !self.released
            && self
                .inner
                .state
                .lock()
                .holder
                .as_ref()
                .is_some_and(|h| h.ticket == self.ticket)
    }

    /// Releases the lock now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.inner.release_ticket(self.ticket) {
            debug!(operation = %self.operation, "lock was already released");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
