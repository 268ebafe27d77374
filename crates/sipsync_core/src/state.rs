//! Database initialization state machine.
//!
//! ```text
//! UNINITIALIZED ──► INITIALIZING ──► READY
//!       │   ▲            │
//!       ▼   │ (retry)    ▼
//!       ERROR ◄──────────┘
//! ```
//!
//! Any state may go back to `UNINITIALIZED` through [`StateMachine::reset`].
//! Callers that need the database wait on [`StateMachine::wait_until_ready`],
//! which parks them on a waiter list notified by the `READY` and `ERROR`
//! transitions.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Lifecycle state of the local database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitState {
    /// Nothing has been set up yet.
    Uninitialized,
    /// Setup (open + migrations) is in progress.
    Initializing,
    /// Setup completed; the database can be used.
    Ready,
    /// Setup failed; may be retried.
    Error,
}

impl InitState {
    /// Returns the canonical upper-case name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            InitState::Uninitialized => "UNINITIALIZED",
            InitState::Initializing => "INITIALIZING",
            InitState::Ready => "READY",
            InitState::Error => "ERROR",
        }
    }

    /// Returns true if the edge `self -> to` is allowed.
    ///
    /// Reset to `Uninitialized` is handled separately and always allowed.
    pub fn can_transition_to(&self, to: InitState) -> bool {
        matches!(
            (self, to),
            (InitState::Uninitialized | InitState::Error, InitState::Initializing)
                | (InitState::Initializing, InitState::Ready)
                | (InitState::Uninitialized | InitState::Initializing, InitState::Error)
        )
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Waiter = oneshot::Sender<Result<(), String>>;

#[derive(Debug)]
struct Inner {
    state: InitState,
    error_message: Option<String>,
    waiters: Vec<(u64, Waiter)>,
    next_waiter: u64,
}

/// Tracks database readiness.
///
/// There is one state machine per database; every component that touches
/// the engine checks it before use.
#[derive(Debug)]
pub struct StateMachine {
    inner: Mutex<Inner>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Creates a state machine in `UNINITIALIZED`.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: InitState::Uninitialized,
                error_message: None,
                waiters: Vec::new(),
                next_waiter: 0,
            }),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> InitState {
        self.inner.lock().state
    }

    /// Returns true if the database is ready.
    pub fn is_ready(&self) -> bool {
        self.state() == InitState::Ready
    }

    /// Returns the message recorded by the last transition to `ERROR`.
    pub fn error_message(&self) -> Option<String> {
        self.inner.lock().error_message.clone()
    }

    /// Returns the number of callers parked in [`wait_until_ready`](Self::wait_until_ready).
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Fails with [`CoreError::NotReady`] unless the state is `READY`.
    pub fn ensure_ready(&self) -> CoreResult<()> {
        match self.state() {
            InitState::Ready => Ok(()),
            state => Err(CoreError::NotReady {
                state: state.to_string(),
            }),
        }
    }

    /// `UNINITIALIZED | ERROR -> INITIALIZING`. Clears any stored error.
    pub fn start_initializing(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        Self::check(&inner, InitState::Initializing)?;
        inner.state = InitState::Initializing;
        inner.error_message = None;
        debug!("database state -> INITIALIZING");
        Ok(())
    }

    /// `INITIALIZING -> READY`. Wakes every waiter.
    pub fn mark_ready(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        Self::check(&inner, InitState::Ready)?;
        inner.state = InitState::Ready;
        let waiters = std::mem::take(&mut inner.waiters);
        drop(inner);

        debug!(waiters = waiters.len(), "database state -> READY");
        for (_, waiter) in waiters {
            let _ = waiter.send(Ok(()));
        }
        Ok(())
    }

    /// `UNINITIALIZED | INITIALIZING -> ERROR`. Wakes every waiter with `message`.
    pub fn mark_error(&self, message: impl Into<String>) -> CoreResult<()> {
        let message = message.into();
        let mut inner = self.inner.lock();
        Self::check(&inner, InitState::Error)?;
        inner.state = InitState::Error;
        inner.error_message = Some(message.clone());
        let waiters = std::mem::take(&mut inner.waiters);
        drop(inner);

        warn!(error = %message, waiters = waiters.len(), "database state -> ERROR");
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(message.clone()));
        }
        Ok(())
    }

    /// Any state `-> UNINITIALIZED`.
    ///
    /// Parked waiters keep waiting for the next `READY` or `ERROR`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        debug!(from = %inner.state, "database state reset -> UNINITIALIZED");
        inner.state = InitState::Uninitialized;
        inner.error_message = None;
    }

    /// Waits until the state becomes `READY`.
    ///
    /// Returns immediately when already `READY`, fails immediately with the
    /// stored message when `ERROR`. Otherwise parks until the next `READY`
    /// or `ERROR` transition, or until `timeout` elapses.
    pub async fn wait_until_ready(&self, timeout: Duration) -> CoreResult<()> {
        let (id, notified) = {
            let mut inner = self.inner.lock();
            match inner.state {
                InitState::Ready => return Ok(()),
                InitState::Error => {
                    return Err(CoreError::InitializationFailed {
                        message: inner.error_message.clone().unwrap_or_default(),
                    })
                }
                InitState::Uninitialized | InitState::Initializing => {}
            }
            let (tx, rx) = oneshot::channel();
            inner.next_waiter += 1;
            let id = inner.next_waiter;
            inner.waiters.push((id, tx));
            (id, rx)
        };

        match tokio::time::timeout(timeout, notified).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(message))) => Err(CoreError::InitializationFailed { message }),
            Ok(Err(_)) => Err(CoreError::invalid_operation(
                "state machine dropped while waiting",
            )),
            Err(_) => {
                self.inner.lock().waiters.retain(|(waiter, _)| *waiter != id);
                Err(CoreError::ReadyTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn check(inner: &Inner, to: InitState) -> CoreResult<()> {
        if inner.state.can_transition_to(to) {
            return Ok(());
        }
        warn!(from = %inner.state, to = %to, "rejected state transition");
        Err(CoreError::InvalidTransition {
            from: inner.state.to_string(),
            to: to.to_string(),
        })
    }
}
