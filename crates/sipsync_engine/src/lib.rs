//! # sipsync engine
//!
//! Keeps the sipsync cache in step with the remote catalog service.
//!
//! This crate provides:
//! - An HTTP transport abstraction and a scripted mock
//! - A JSON fetcher with exponential backoff
//! - Explicit response envelopes for collection endpoints
//! - The sync orchestrator: foreground primary refresh, staggered
//!   background refreshes, guest-mode gating and offline queue replay
//!
//! ## Failure policy
//!
//! - HTTP and network errors are retried locally, then surfaced
//! - Parse and shape errors are never retried
//! - A failed primary refresh fails startup but leaves cached data usable
//! - A failed background refresh is logged and affects nothing else

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod config;
mod error;
mod fetch;
mod orchestrator;
mod shape;
mod transport;

pub use collection::Collection;
pub use config::{RetryConfig, SyncConfig, NOOP_SCHEME};
pub use error::{SyncError, SyncResult};
pub use fetch::{is_noop, RetryingFetcher};
pub use orchestrator::{InitReport, OperationSink, RefreshReport, ReplayReport, SyncOrchestrator};
pub use shape::{decode_records, CollectionEnvelope, Decoded, NestedItems};
pub use transport::{HttpResponse, HttpTransport, MockTransport};
