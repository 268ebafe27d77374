//! Offline operation queue.
//!
//! Mutating remote calls that fail for lack of connectivity are parked in
//! the `offline_queue` table and replayed later, oldest first. A replayed
//! operation is deleted on success. Failures bump its retry count and the
//! operation is parked as `failed` once the retry budget is spent.

use crate::engine::{Row, SqlEngine, SqlValue};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockManager;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lock name held by queue mutations.
pub const QUEUE_LOCK: &str = "offline_queue";

/// Default number of failed replays before an operation is parked.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Replay status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Waiting to be replayed.
    Pending,
    /// Replayed successfully.
    Success,
    /// Retry budget exhausted.
    Failed,
}

impl OperationStatus {
    /// Returns the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::invalid_row(
                "offline_queue",
                format!("unknown status '{other}'"),
            )),
        }
    }
}

/// A mutation waiting to be sent to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Operation identifier.
    pub id: Uuid,
    /// Operation kind, e.g. `rate_item`.
    pub op_type: String,
    /// Request body.
    pub payload: serde_json::Value,
    /// When the operation was queued.
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay attempts so far.
    pub retry_count: u32,
    /// Replay status.
    pub status: OperationStatus,
    /// Error from the last failed replay.
    pub last_error: Option<String>,
}

impl QueuedOperation {
    fn from_row(row: &Row) -> CoreResult<Self> {
        let text = |column: &str| {
            row.text(column).ok_or_else(|| {
                CoreError::invalid_row("offline_queue", format!("missing {column}"))
            })
        };
        let id = Uuid::parse_str(&text("id")?)
            .map_err(|e| CoreError::invalid_row("offline_queue", e.to_string()))?;
        let enqueued_at = DateTime::parse_from_rfc3339(&text("enqueued_at")?)
            .map_err(|e| CoreError::invalid_row("offline_queue", e.to_string()))?
            .with_timezone(&Utc);
        Ok(Self {
            id,
            op_type: text("op_type")?,
            payload: serde_json::from_str(&text("payload")?)?,
            enqueued_at,
            retry_count: row.integer("retry_count").unwrap_or(0).max(0) as u32,
            status: text("status")?.parse()?,
            last_error: row.text("last_error"),
        })
    }
}

/// Number of queued operations per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Operations waiting for replay.
    pub pending: u64,
    /// Operations that exhausted their retries.
    pub failed: u64,
}

const SELECT_COLUMNS: &str =
    "SELECT id, op_type, payload, enqueued_at, retry_count, status, last_error FROM offline_queue";

/// Persistent queue of offline mutations.
#[derive(Clone)]
pub struct OperationQueue {
    engine: Arc<dyn SqlEngine>,
    locks: LockManager,
    max_retries: u32,
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl OperationQueue {
    /// Creates a queue over `engine` with the default retry budget.
    pub fn new(engine: Arc<dyn SqlEngine>, locks: LockManager) -> Self {
        Self {
            engine,
            locks,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Sets how many failed replays park an operation as `failed`.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Returns the retry budget.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Queues a new operation.
    pub async fn enqueue(
        &self,
        op_type: &str,
        payload: serde_json::Value,
    ) -> CoreResult<QueuedOperation> {
        let op = QueuedOperation {
            id: Uuid::new_v4(),
            op_type: op_type.to_string(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            status: OperationStatus::Pending,
            last_error: None,
        };
        let encoded = serde_json::to_string(&op.payload)?;

        self.locks
            .with_lock(QUEUE_LOCK, || async {
                self.engine.execute(
                    "INSERT INTO offline_queue (id, op_type, payload, enqueued_at, retry_count, status)
                     VALUES (?1, ?2, ?3, ?4, 0, 'pending')",
                    &[
                        op.id.to_string().into(),
                        op.op_type.as_str().into(),
                        encoded.into(),
                        op.enqueued_at
                            .to_rfc3339_opts(SecondsFormat::Micros, true)
                            .into(),
                    ],
                )
            })
            .await?;

        info!(id = %op.id, op_type, "queued offline operation");
        Ok(op)
    }

    /// Returns up to `limit` pending operations, oldest first.
    pub fn pending(&self, limit: usize) -> CoreResult<Vec<QueuedOperation>> {
        self.select(
            &format!("{SELECT_COLUMNS} WHERE status = 'pending' ORDER BY enqueued_at, rowid LIMIT ?1"),
            &[SqlValue::Integer(limit as i64)],
        )
    }

    /// Returns up to `limit` operations of any status, oldest first.
    pub fn list(&self, limit: usize) -> CoreResult<Vec<QueuedOperation>> {
        self.select(
            &format!("{SELECT_COLUMNS} ORDER BY enqueued_at, rowid LIMIT ?1"),
            &[SqlValue::Integer(limit as i64)],
        )
    }

    /// Returns the operation with `id`.
    pub fn get(&self, id: Uuid) -> CoreResult<Option<QueuedOperation>> {
        Ok(self
            .select(&format!("{SELECT_COLUMNS} WHERE id = ?1"), &[id.to_string().into()])?
            .into_iter()
            .next())
    }

    fn select(&self, sql: &str, params: &[SqlValue]) -> CoreResult<Vec<QueuedOperation>> {
        self.engine
            .query_all(sql, params)?
            .iter()
            .map(QueuedOperation::from_row)
            .collect()
    }

    /// Records a failed replay and returns the operation's new status.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if the operation is not queued.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> CoreResult<OperationStatus> {
        let status = self
            .locks
            .with_lock(QUEUE_LOCK, || async {
                let op = self
                    .get(id)?
                    .ok_or_else(|| CoreError::NotFound(format!("queued operation {id}")))?;
                let retry_count = op.retry_count + 1;
                let status = if retry_count >= self.max_retries {
                    OperationStatus::Failed
                } else {
                    OperationStatus::Pending
                };
                self.engine.execute(
                    "UPDATE offline_queue SET retry_count = ?2, status = ?3, last_error = ?4 WHERE id = ?1",
                    &[
                        id.to_string().into(),
                        retry_count.into(),
                        status.as_str().into(),
                        error.into(),
                    ],
                )?;
                Ok::<_, CoreError>(status)
            })
            .await?;

        if status == OperationStatus::Failed {
            warn!(%id, error, "offline operation exhausted its retries");
        } else {
            debug!(%id, error, "offline operation replay failed");
        }
        Ok(status)
    }

    /// Removes a successfully replayed operation.
    pub async fn mark_success(&self, id: Uuid) -> CoreResult<()> {
        self.locks
            .with_lock(QUEUE_LOCK, || async {
                self.engine
                    .execute("DELETE FROM offline_queue WHERE id = ?1", &[id.to_string().into()])
            })
            .await?;
        debug!(%id, "offline operation replayed");
        Ok(())
    }

    /// Returns the number of operations per status.
    pub fn counts(&self) -> CoreResult<QueueCounts> {
        let rows = self.engine.query_all(
            "SELECT status, COUNT(*) AS n FROM offline_queue GROUP BY status",
            &[],
        )?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let n = row.integer("n").unwrap_or(0).max(0) as u64;
            match row.text("status").as_deref() {
                Some("pending") => counts.pending = n,
                Some("failed") => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Deletes every queued operation and returns how many were removed.
    pub async fn clear(&self) -> CoreResult<usize> {
        let removed = self
            .locks
            .with_lock(QUEUE_LOCK, || async {
                self.engine.execute("DELETE FROM offline_queue", &[])
            })
            .await?;
        info!(removed, "cleared offline queue");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SqliteEngine;
    use crate::schema::builtin_migrations;
    use serde_json::json;

    async fn queue() -> OperationQueue {
        let engine: Arc<dyn SqlEngine> = Arc::new(SqliteEngine::open_in_memory().unwrap());
        let locks = LockManager::default();
        builtin_migrations()
            .unwrap()
            .run_pending(&engine, &locks)
            .await
            .unwrap();
        OperationQueue::new(engine, locks)
    }

    #[tokio::test]
    async fn enqueue_and_read_back() {
        let queue = queue().await;
        let op = queue
            .enqueue("rate_item", json!({"itemId": "42", "rating": 4}))
            .await
            .unwrap();

        let stored = queue.get(op.id).unwrap().unwrap();
        assert_eq!(stored.op_type, "rate_item");
        assert_eq!(stored.payload["rating"], 4);
        assert_eq!(stored.status, OperationStatus::Pending);
        assert_eq!(queue.counts().unwrap(), QueueCounts { pending: 1, failed: 0 });
    }

    #[tokio::test]
    async fn pending_is_oldest_first() {
        let queue = queue().await;
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(queue.enqueue("op", json!({ "n": i })).await.unwrap().id);
        }
        let pending: Vec<Uuid> = queue.pending(3).unwrap().iter().map(|op| op.id).collect();
        assert_eq!(pending, ids[..3]);
    }

    #[tokio::test]
    async fn failures_park_after_budget() {
        let queue = queue().await.with_max_retries(2);
        let op = queue.enqueue("op", json!(null)).await.unwrap();

        assert_eq!(
            queue.mark_failed(op.id, "offline").await.unwrap(),
            OperationStatus::Pending
        );
        assert_eq!(
            queue.mark_failed(op.id, "still offline").await.unwrap(),
            OperationStatus::Failed
        );

        let stored = queue.get(op.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.last_error.as_deref(), Some("still offline"));
        assert!(queue.pending(10).unwrap().is_empty());
        assert_eq!(queue.counts().unwrap(), QueueCounts { pending: 0, failed: 1 });
    }

    #[tokio::test]
    async fn success_deletes() {
        let queue = queue().await;
        let op = queue.enqueue("op", json!({})).await.unwrap();
        queue.mark_success(op.id).await.unwrap();
        assert!(queue.get(op.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let queue = queue().await;
        let err = queue.mark_failed(Uuid::new_v4(), "x").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let queue = queue().await;
        queue.enqueue("a", json!(1)).await.unwrap();
        queue.enqueue("b", json!(2)).await.unwrap();
        assert_eq!(queue.clear().await.unwrap(), 2);
        assert_eq!(queue.counts().unwrap(), QueueCounts::default());
    }

    #[test]
    fn status_parsing() {
        assert_eq!("failed".parse::<OperationStatus>().unwrap(), OperationStatus::Failed);
        assert!("bogus".parse::<OperationStatus>().is_err());
    }
}
