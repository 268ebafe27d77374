//! Sync orchestration.
//!
//! The orchestrator sequences "fetch remote collection, decode, replace local
//! table" for every tracked [`Collection`]:
//!
//! - **Foreground**: [`SyncOrchestrator::initialize`] brings the cache to
//!   `READY` and refreshes the primary collection before returning.
//! - **Background**: the other collections are scheduled with staggered
//!   delays afterwards. Each runs in its own task, so one failing never
//!   blocks or fails another; failures are logged.
//! - **Guest mode**: when the `guest_mode` preference is set, personal
//!   collections are not scheduled at all.

use crate::collection::Collection;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::fetch::RetryingFetcher;
use crate::shape::decode_records;
use crate::transport::HttpTransport;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use sipsync_core::{
    CacheDatabase, CachedRecord, CatalogItem, MigrationRunResult, OperationStatus,
    PreferenceStore, QueuedOperation, ReplaceSummary, Reward, TastedItem, ENDPOINT_PREFIX,
    GUEST_MODE,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Operations replayed per call of [`SyncOrchestrator::replay_offline_queue`].
const REPLAY_BATCH: usize = 100;

/// Receives queued offline operations during a replay.
#[async_trait]
pub trait OperationSink: Send + Sync {
    /// Sends one operation to the remote service.
    async fn send(&self, operation: &QueuedOperation) -> SyncResult<()>;
}

/// Outcome of refreshing one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    /// The refreshed collection.
    pub collection: Collection,
    /// Rows written to the local table.
    pub records_affected: usize,
    /// Valid/invalid record counts.
    pub summary: ReplaceSummary,
    /// Response elements that could not be decoded.
    pub undecodable: usize,
}

/// Outcome of [`SyncOrchestrator::initialize`].
#[derive(Debug, Clone)]
pub struct InitReport {
    /// Migrations applied by this call, if it performed the setup.
    pub migrations: Option<MigrationRunResult>,
    /// The foreground refresh of the primary collection.
    pub primary: RefreshReport,
    /// Collections scheduled for background refresh.
    pub scheduled: Vec<Collection>,
    /// Whether guest mode suppressed the personal collections.
    pub guest_mode: bool,
}

/// Outcome of an offline queue replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Operations sent and removed from the queue.
    pub replayed: usize,
    /// Operations whose send failed.
    pub failed: usize,
    /// Failed operations that exhausted their retries.
    pub parked: usize,
    /// True if a connectivity failure ended the replay early.
    pub stopped_early: bool,
}

struct BackgroundTask {
    collection: Collection,
    handle: JoinHandle<SyncResult<RefreshReport>>,
    cancelled: bool,
}

impl BackgroundTask {
    fn is_pending(&self) -> bool {
        !self.cancelled && !self.handle.is_finished()
    }
}

struct Shared {
    db: Arc<CacheDatabase>,
    fetcher: RetryingFetcher,
    config: SyncConfig,
    background: Mutex<Vec<BackgroundTask>>,
}

/// Keeps the cache in step with the remote service.
#[derive(Clone)]
pub struct SyncOrchestrator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("db", &self.shared.db)
            .field("background", &self.background_pending())
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    /// Creates an orchestrator over an existing cache.
    pub fn new(db: Arc<CacheDatabase>, transport: Arc<dyn HttpTransport>, config: SyncConfig) -> Self {
        let fetcher = RetryingFetcher::new(transport, config.retry.clone());
        Self {
            shared: Arc::new(Shared {
                db,
                fetcher,
                config,
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Opens the cache file at `path` and creates an orchestrator over it.
    pub fn open(
        path: impl AsRef<Path>,
        transport: Arc<dyn HttpTransport>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        let db = CacheDatabase::open(path, config.core.clone())?;
        Ok(Self::new(Arc::new(db), transport, config))
    }

    /// Creates an orchestrator over a fresh in-memory cache.
    pub fn open_in_memory(transport: Arc<dyn HttpTransport>, config: SyncConfig) -> SyncResult<Self> {
        let db = CacheDatabase::open_in_memory(config.core.clone())?;
        Ok(Self::new(Arc::new(db), transport, config))
    }

    /// Returns the cache database.
    pub fn database(&self) -> &Arc<CacheDatabase> {
        &self.shared.db
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Returns the fetcher.
    pub fn fetcher(&self) -> &RetryingFetcher {
        &self.shared.fetcher
    }

    /// Initializes the cache and performs the startup refresh.
    ///
    /// Runs migrations if needed, refreshes the primary collection, then
    /// schedules the background collections unless guest mode is on. Safe to
    /// call more than once: collections still pending from an earlier call
    /// are not scheduled twice.
    ///
    /// # Errors
    ///
    /// Initialization errors, or the primary refresh failure. In the latter
    /// case the cache stays `READY` and keeps serving previously cached data.
    pub async fn initialize(&self) -> SyncResult<InitReport> {
        let migrations = self.shared.db.initialize().await?;

        let primary = match self.shared.refresh(Collection::Catalog).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "primary refresh failed, serving cached data");
                return Err(e);
            }
        };

        let guest_mode = self.guest_mode()?;
        let scheduled = if guest_mode {
            info!("guest mode enabled, skipping background sync");
            Vec::new()
        } else {
            self.schedule_background()
        };

        Ok(InitReport {
            migrations,
            primary,
            scheduled,
            guest_mode,
        })
    }

    /// Refreshes `collection` now and returns the rows written.
    pub async fn refresh_collection(&self, collection: Collection) -> SyncResult<usize> {
        Ok(self.shared.refresh(collection).await?.records_affected)
    }

    /// Refreshes `collection` now and returns the full report.
    pub async fn refresh(&self, collection: Collection) -> SyncResult<RefreshReport> {
        self.shared.refresh(collection).await
    }

    /// Returns whether guest mode is enabled.
    pub fn guest_mode(&self) -> SyncResult<bool> {
        Ok(self.shared.db.preferences().get_bool(GUEST_MODE)?)
    }

    /// Returns the number of background refreshes still running or waiting.
    pub fn background_pending(&self) -> usize {
        self.shared
            .background
            .lock()
            .iter()
            .filter(|task| task.is_pending())
            .count()
    }

    fn schedule_background(&self) -> Vec<Collection> {
        let mut background = self.shared.background.lock();
        background.retain(BackgroundTask::is_pending);

        let mut scheduled = Vec::new();
        for collection in Collection::ALL.into_iter().filter(Collection::is_personal) {
            if background.iter().any(|task| task.collection == collection) {
                debug!(collection = %collection, "background refresh already pending");
                continue;
            }

            let delay = self.shared.config.background_delay(collection);
            let shared = Arc::clone(&self.shared);
            let handle = tokio::spawn(
                async move {
                    tokio::time::sleep(delay).await;
                    let result = shared.refresh(collection).await;
                    if let Err(e) = &result {
                        error!(collection = %collection, error = %e, "background refresh failed");
                    }
                    result
                }
                .in_current_span(),
            );
            debug!(collection = %collection, delay_ms = delay.as_millis() as u64, "scheduled background refresh");
            background.push(BackgroundTask {
                collection,
                handle,
                cancelled: false,
            });
            scheduled.push(collection);
        }
        scheduled
    }

    /// Waits for every scheduled background refresh and returns the outcomes.
    ///
    /// Refreshes cancelled by a shutdown or reset report
    /// [`SyncError::Cancelled`].
    pub async fn wait_for_background(&self) -> Vec<(Collection, SyncResult<RefreshReport>)> {
        let tasks = std::mem::take(&mut *self.shared.background.lock());
        let mut outcomes = Vec::with_capacity(tasks.len());
        for BackgroundTask {
            collection, handle, ..
        } in tasks
        {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(SyncError::Cancelled),
                Err(e) => Err(SyncError::network(format!("background task failed: {e}"))),
            };
            outcomes.push((collection, result));
        }
        outcomes
    }

    fn cancel_background(&self) -> usize {
        let mut background = self.shared.background.lock();
        let mut cancelled = 0;
        for task in background.iter_mut().filter(|task| task.is_pending()) {
            task.handle.abort();
            task.cancelled = true;
            debug!(collection = %task.collection, "cancelled background refresh");
            cancelled += 1;
        }
        cancelled
    }

    /// Cancels pending background work and drains the lock manager.
    ///
    /// Returns `true` once no lock holder remains, `false` if one is still
    /// present when `timeout` (the configured shutdown timeout when `None`)
    /// elapses.
    pub async fn prepare_for_shutdown(&self, timeout: Option<Duration>) -> bool {
        let cancelled = self.cancel_background();
        if cancelled > 0 {
            info!(cancelled, "cancelled background refreshes for shutdown");
        }
        self.shared.db.locks().prepare_for_shutdown(timeout).await
    }

    /// Cancels background work and returns the cache to `UNINITIALIZED`.
    pub fn reset_state(&self) {
        self.cancel_background();
        self.shared.db.reset();
    }

    /// Replays pending offline operations through `sink`, oldest first.
    ///
    /// Successful operations are removed. A failure is recorded against its
    /// operation; a connectivity failure also stops the replay, since the
    /// remaining operations would fail the same way.
    pub async fn replay_offline_queue(&self, sink: &dyn OperationSink) -> SyncResult<ReplayReport> {
        self.shared.db.state().ensure_ready()?;
        let queue = self.shared.db.queue();
        let mut report = ReplayReport::default();

        for operation in queue.pending(REPLAY_BATCH)? {
            match sink.send(&operation).await {
                Ok(()) => {
                    queue.mark_success(operation.id).await?;
                    report.replayed += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    let status = queue.mark_failed(operation.id, &e.to_string()).await?;
                    if status == OperationStatus::Failed {
                        report.parked += 1;
                    }
                    if e.is_connectivity() {
                        warn!(id = %operation.id, error = %e, "offline replay stopped, still offline");
                        report.stopped_early = true;
                        break;
                    }
                }
            }
        }

        info!(
            replayed = report.replayed,
            failed = report.failed,
            parked = report.parked,
            stopped_early = report.stopped_early,
            "offline queue replay finished"
        );
        Ok(report)
    }
}

impl Shared {
    async fn refresh(&self, collection: Collection) -> SyncResult<RefreshReport> {
        match collection {
            Collection::Catalog => self.refresh_as::<CatalogItem>(collection).await,
            Collection::History => self.refresh_as::<TastedItem>(collection).await,
            Collection::Rewards => self.refresh_as::<Reward>(collection).await,
        }
    }

    async fn refresh_as<R>(&self, collection: Collection) -> SyncResult<RefreshReport>
    where
        R: CachedRecord + DeserializeOwned,
    {
        let repository = self.db.repository::<R>()?;
        let url = self.endpoint_url(collection)?;
        let value = self.fetcher.fetch_json(&url).await?;
        let decoded = decode_records::<R>(value)?;
        let outcome = repository.replace_all(decoded.records).await?;

        info!(
            collection = %collection,
            records_affected = outcome.records_affected,
            invalid = outcome.summary.invalid,
            undecodable = decoded.undecodable,
            "collection refreshed"
        );
        Ok(RefreshReport {
            collection,
            records_affected: outcome.records_affected,
            summary: outcome.summary,
            undecodable: decoded.undecodable,
        })
    }

    /// Resolves the endpoint of `collection`, preferring a stored override.
    fn endpoint_url(&self, collection: Collection) -> SyncResult<String> {
        let key = format!("{ENDPOINT_PREFIX}{}", collection.name());
        let endpoint = match self.db.preferences().get(&key)? {
            Some(overridden) => overridden,
            None => self
                .config
                .endpoints
                .get(&collection)
                .cloned()
                .unwrap_or_default(),
        };
        self.config
            .resolve(&endpoint)
            .ok_or_else(|| SyncError::MissingEndpoint(collection.name().to_string()))
    }
}
