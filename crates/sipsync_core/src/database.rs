//! Cache database facade.

use crate::config::CoreConfig;
use crate::engine::{SqlEngine, SqliteEngine};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockManager;
use crate::migration::{MigrationRunResult, SchemaMigrator};
use crate::preferences::SqlPreferences;
use crate::queue::OperationQueue;
use crate::record::CachedRecord;
use crate::repository::Repository;
use crate::schema::builtin_migrations;
use crate::state::StateMachine;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// The on-device cache.
///
/// `CacheDatabase` owns the engine, the lock manager and the initialization
/// state machine, and hands out repositories for the cached collections.
///
/// # Initialization
///
/// Nothing but preferences may be used before [`initialize`](Self::initialize)
/// succeeds. The first caller runs the schema migrations; callers arriving
/// while that is in flight wait for its outcome instead of running setup
/// again.
///
/// ```rust,ignore
/// let db = CacheDatabase::open("cache.db", CoreConfig::default())?;
/// db.initialize().await?;
/// let catalog = db.repository::<CatalogItem>()?;
/// println!("{} cached items", catalog.count()?);
/// ```
pub struct CacheDatabase {
    engine: Arc<dyn SqlEngine>,
    locks: LockManager,
    state: StateMachine,
    migrator: SchemaMigrator,
    preferences: SqlPreferences,
    queue: OperationQueue,
    config: CoreConfig,
    location: String,
}

impl std::fmt::Debug for CacheDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDatabase")
            .field("location", &self.location)
            .field("state", &self.state.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CacheDatabase {
    /// Opens (or creates) a cache database file.
    pub fn open(path: impl AsRef<Path>, config: CoreConfig) -> CoreResult<Self> {
        let engine = SqliteEngine::open(path)?;
        let location = engine.location().to_string();
        let mut db = Self::with_engine(Arc::new(engine), config)?;
        db.location = location;
        Ok(db)
    }

    /// Opens a private in-memory cache.
    pub fn open_in_memory(config: CoreConfig) -> CoreResult<Self> {
        Self::with_engine(Arc::new(SqliteEngine::open_in_memory()?), config)
    }

    /// Wraps an existing engine, using the built-in schema.
    pub fn with_engine(engine: Arc<dyn SqlEngine>, config: CoreConfig) -> CoreResult<Self> {
        let locks = LockManager::new(config.lock.clone());
        Ok(Self {
            preferences: SqlPreferences::open(Arc::clone(&engine))?,
            queue: OperationQueue::new(Arc::clone(&engine), locks.clone()),
            engine,
            locks,
            state: StateMachine::new(),
            migrator: builtin_migrations()?,
            config,
            location: ":memory:".to_string(),
        })
    }

    /// Replaces the schema migrations run by [`initialize`](Self::initialize).
    #[must_use]
    pub fn with_migrator(mut self, migrator: SchemaMigrator) -> Self {
        self.migrator = migrator;
        self
    }

    /// Brings the database to `READY`.
    ///
    /// Returns the migration result when this call performed the setup, and
    /// `None` when the database was already ready or another caller's setup
    /// finished first. Calling it again after a failure retries the setup.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Migration`] if a migration failed (state becomes `ERROR`)
    /// - [`CoreError::InitializationFailed`] if the concurrent setup being
    ///   waited on failed
    /// - [`CoreError::ReadyTimeout`] if that setup took longer than
    ///   `ready_timeout`
    pub async fn initialize(&self) -> CoreResult<Option<MigrationRunResult>> {
        if self.state.is_ready() {
            return Ok(None);
        }

        match self.state.start_initializing() {
            Ok(()) => {}
            Err(CoreError::InvalidTransition { from, .. }) => {
                debug!(state = %from, "initialization already in progress, waiting");
                self.state.wait_until_ready(self.config.ready_timeout).await?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        }

        let mut guard = InitGuard {
            state: &self.state,
            armed: true,
        };
        let outcome = self.migrator.run_pending(&self.engine, &self.locks).await;
        guard.armed = false;

        match outcome {
            Ok(result) => {
                self.state.mark_ready()?;
                info!(
                    location = %self.location,
                    schema_version = result.final_version,
                    "cache database ready"
                );
                Ok(Some(result))
            }
            Err(err) => {
                self.state.mark_error(err.to_string())?;
                Err(err)
            }
        }
    }

    /// Returns the repository for `R`.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotReady`] before initialization succeeded.
    pub fn repository<R: CachedRecord>(&self) -> CoreResult<Repository<R>> {
        self.state.ensure_ready()?;
        Ok(Repository::new(
            Arc::clone(&self.engine),
            self.locks.clone(),
            self.config.batch_size,
        ))
    }

    /// Returns the preference store.
    pub fn preferences(&self) -> &SqlPreferences {
        &self.preferences
    }

    /// Returns the offline operation queue.
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Returns the lock manager.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Returns the initialization state machine.
    pub fn state(&self) -> &StateMachine {
        &self.state
    }

    /// Returns the schema migrator.
    pub fn migrator(&self) -> &SchemaMigrator {
        &self.migrator
    }

    /// Returns the underlying engine.
    pub fn engine(&self) -> &Arc<dyn SqlEngine> {
        &self.engine
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Returns the database file path, or `:memory:`.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Returns lock and state to their initial values.
    ///
    /// Cached data is left untouched; the next
    /// [`initialize`](Self::initialize) re-runs the (idempotent) setup.
    pub fn reset(&self) {
        self.locks.reset();
        self.state.reset();
        info!(location = %self.location, "cache database state reset");
    }
}

/// Moves the state machine to `ERROR` if setup is abandoned midway.
struct InitGuard<'a> {
    state: &'a StateMachine,
    armed: bool,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.state.mark_error("initialization was cancelled");
        }
    }
}
