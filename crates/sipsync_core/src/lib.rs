//! # sipsync core
//!
//! On-device cache layer for sipsync.
//!
//! This crate provides:
//! - A FIFO lock manager serializing destructive table operations
//! - An event-driven initialization state machine
//! - Forward-only, lock-protected schema migrations
//! - The transactional replace-all protocol behind every collection refresh
//! - A persistent queue of mutations made while offline
//!
//! The embedded SQL engine is consumed through the [`SqlEngine`] trait;
//! [`SqliteEngine`] is the bundled implementation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod database;
mod engine;
mod error;
mod lock;
mod migration;
mod preferences;
mod queue;
mod record;
mod repository;
mod schema;
mod state;

pub use config::{CoreConfig, LockConfig};
pub use database::CacheDatabase;
pub use engine::{count_rows, table_exists, Row, SqlEngine, SqlExecutor, SqlValue, SqliteEngine};
pub use error::{CoreError, CoreResult};
pub use lock::{HolderInfo, LockGuard, LockManager};
pub use migration::{
    add_column_if_missing, AppliedMigration, Migration, MigrationInfo, MigrationRunResult,
    SchemaMigrator, SchemaVersion, SqlMigration, MIGRATION_LOCK,
};
pub use preferences::{MemoryPreferences, Preference, PreferenceStore, SqlPreferences, ENDPOINT_PREFIX, GUEST_MODE};
pub use queue::{
    OperationQueue, OperationStatus, QueueCounts, QueuedOperation, DEFAULT_MAX_RETRIES, QUEUE_LOCK,
};
pub use record::{validate_key, validate_required, CachedRecord, CatalogItem, Reward, TastedItem};
pub use repository::{
    insert_batch, replace_all, InvalidRecord, ReplaceOutcome, ReplaceSummary, Repository,
    MAX_SQL_VARIABLES,
};
pub use schema::builtin_migrations;
pub use state::{InitState, StateMachine};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
