//! Transactional replace-all protocol and typed repositories.
//!
//! A cached collection is refreshed by replacing the whole table:
//!
//! 1. hold the lock for the table's logical name
//! 2. validate every incoming record, setting invalid ones aside
//! 3. in one transaction, delete every row and insert the valid records in
//!    fixed-size batches
//!
//! Invalid records are reported, never fatal. An empty input is a valid
//! refresh that leaves the table empty. Any failure inside the transaction
//! rolls back the delete too, so readers never observe a half-replaced table.

use crate::engine::{count_rows, SqlEngine, SqlExecutor, SqlValue};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockManager;
use crate::record::CachedRecord;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{info, warn};

/// SQLite's default bound-parameter limit per statement.
pub const MAX_SQL_VARIABLES: usize = 32_766;

/// A record dropped during validation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRecord<T> {
    /// The rejected record.
    pub record: T,
    /// Why it was rejected.
    pub reason: String,
}

/// Valid/invalid counts of a replace-all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    /// Records that passed validation.
    pub valid: usize,
    /// Records that were dropped.
    pub invalid: usize,
}

/// Result of a replace-all.
///
/// Records sharing a key are all counted as valid and inserted in order, so
/// the last one wins. With duplicate keys `records_affected` and
/// `summary.valid` exceed the row count left in the table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaceOutcome<T> {
    /// Rows inserted.
    pub records_affected: usize,
    /// Records that were persisted.
    pub valid_records: Vec<T>,
    /// Records that were dropped, with reasons.
    pub invalid_records: Vec<InvalidRecord<T>>,
    /// Counts of the two lists above.
    pub summary: ReplaceSummary,
}

/// Replaces every row of `table` with the valid subset of `records`.
///
/// `validate` decides which records may be persisted. `insert` writes one
/// batch through the transaction executor and returns the rows written.
/// The lock named after `table` is held for the whole operation and
/// released on every exit path.
///
/// # Errors
///
/// Lock errors from [`LockManager::acquire`], or any error raised while
/// deleting or inserting. In the latter case nothing was changed.
pub async fn replace_all<T, V, I>(
    engine: &dyn SqlEngine,
    locks: &LockManager,
    table: &str,
    records: Vec<T>,
    validate: V,
    insert: I,
    batch_size: usize,
) -> CoreResult<ReplaceOutcome<T>>
where
    T: Send,
    V: Fn(&T) -> Result<(), String> + Send + Sync,
    I: Fn(&dyn SqlExecutor, &[T]) -> CoreResult<usize> + Send + Sync,
{
    locks
        .with_lock(table, || async {
            replace_locked(engine, table, records, &validate, &insert, batch_size.max(1))
        })
        .await
}

fn replace_locked<T>(
    engine: &dyn SqlEngine,
    table: &str,
    records: Vec<T>,
    validate: &dyn Fn(&T) -> Result<(), String>,
    insert: &dyn Fn(&dyn SqlExecutor, &[T]) -> CoreResult<usize>,
    batch_size: usize,
) -> CoreResult<ReplaceOutcome<T>> {
    let mut valid_records = Vec::with_capacity(records.len());
    let mut invalid_records = Vec::new();
    for record in records {
        match validate(&record) {
            Ok(()) => valid_records.push(record),
            Err(reason) => {
                warn!(table, reason = %reason, "dropping invalid record");
                invalid_records.push(InvalidRecord { record, reason });
            }
        }
    }

    let mut records_affected = 0;
    engine.run_in_transaction(&mut |tx| {
        records_affected = 0;
        tx.execute(&format!("DELETE FROM {table}"), &[])?;
        for batch in valid_records.chunks(batch_size) {
            records_affected += insert(tx, batch)?;
        }
        Ok(())
    })?;

    let summary = ReplaceSummary {
        valid: valid_records.len(),
        invalid: invalid_records.len(),
    };
    info!(
        table,
        records_affected,
        valid = summary.valid,
        invalid = summary.invalid,
        "replaced cached table"
    );
    Ok(ReplaceOutcome {
        records_affected,
        valid_records,
        invalid_records,
        summary,
    })
}

/// Inserts `batch` into `R::TABLE` with multi-row statements.
///
/// One statement is used unless the batch would bind more than
/// [`MAX_SQL_VARIABLES`] parameters, in which case it is split.
/// Rows with a key already present are overwritten, so duplicate keys in a
/// remote payload keep the last occurrence.
pub fn insert_batch<R: CachedRecord>(executor: &dyn SqlExecutor, batch: &[R]) -> CoreResult<usize> {
    let rows_per_statement = (MAX_SQL_VARIABLES / R::COLUMNS.len().max(1)).max(1);
    let mut written = 0;
    for chunk in batch.chunks(rows_per_statement) {
        written += insert_statement(executor, chunk)?;
    }
    Ok(written)
}

fn insert_statement<R: CachedRecord>(executor: &dyn SqlExecutor, batch: &[R]) -> CoreResult<usize> {
    if batch.is_empty() {
        return Ok(0);
    }
    let width = R::COLUMNS.len();
    let groups: Vec<String> = (0..batch.len())
        .map(|row| {
            let slots: Vec<String> = (1..=width).map(|c| format!("?{}", row * width + c)).collect();
            format!("({})", slots.join(", "))
        })
        .collect();
    let sql = format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES {}",
        R::TABLE,
        R::COLUMNS.join(", "),
        groups.join(", ")
    );
    let params: Vec<SqlValue> = batch.iter().flat_map(CachedRecord::values).collect();
    executor.execute(&sql, &params)
}

/// Typed access to one cached collection.
pub struct Repository<R> {
    engine: Arc<dyn SqlEngine>,
    locks: LockManager,
    batch_size: usize,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for Repository<R> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            locks: self.locks.clone(),
            batch_size: self.batch_size,
            _record: PhantomData,
        }
    }
}

impl<R: CachedRecord> std::fmt::Debug for Repository<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("table", &R::TABLE)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl<R: CachedRecord> Repository<R> {
    /// Creates a repository over `engine`.
    pub fn new(engine: Arc<dyn SqlEngine>, locks: LockManager, batch_size: usize) -> Self {
        Self {
            engine,
            locks,
            batch_size: batch_size.max(1),
            _record: PhantomData,
        }
    }

    /// Returns the table name.
    pub fn table(&self) -> &'static str {
        R::TABLE
    }

    /// Replaces the collection with `records`.
    pub async fn replace_all(&self, records: Vec<R>) -> CoreResult<ReplaceOutcome<R>> {
        replace_all(
            self.engine.as_ref(),
            &self.locks,
            R::TABLE,
            records,
            |r: &R| r.validate(),
            |tx: &dyn SqlExecutor, batch: &[R]| insert_batch(tx, batch),
            self.batch_size,
        )
        .await
    }

    /// Returns every cached record in insertion order.
    pub fn all(&self) -> CoreResult<Vec<R>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY rowid",
            R::COLUMNS.join(", "),
            R::TABLE
        );
        self.engine
            .query_all(&sql, &[])?
            .iter()
            .map(R::from_row)
            .collect()
    }

    /// Returns the record with key `id`.
    pub fn get(&self, id: &str) -> CoreResult<Option<R>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            R::COLUMNS.join(", "),
            R::TABLE,
            R::COLUMNS[0]
        );
        self.engine
            .query_one(&sql, &[id.into()])?
            .as_ref()
            .map(R::from_row)
            .transpose()
    }

    /// Returns the record with key `id`, or [`CoreError::NotFound`].
    pub fn require(&self, id: &str) -> CoreResult<R> {
        self.get(id)?
            .ok_or_else(|| CoreError::NotFound(format!("{} '{id}'", R::TABLE)))
    }

    /// Returns the number of cached records.
    pub fn count(&self) -> CoreResult<u64> {
        count_rows(self.engine.as_ref(), R::TABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SqliteEngine;
    use crate::record::CatalogItem;
    use crate::schema::builtin_migrations;

    async fn setup() -> (Arc<dyn SqlEngine>, LockManager) {
        let engine: Arc<dyn SqlEngine> = Arc::new(SqliteEngine::open_in_memory().unwrap());
        let locks = LockManager::default();
        builtin_migrations()
            .unwrap()
            .run_pending(&engine, &locks)
            .await
            .unwrap();
        (engine, locks)
    }

    fn item(id: &str, name: &str) -> CatalogItem {
        CatalogItem {
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn snapshot(repo: &Repository<CatalogItem>) -> Vec<CatalogItem> {
        repo.all().unwrap()
    }

    #[tokio::test]
    async fn empty_input_clears_table() {
        let (engine, locks) = setup().await;
        let repo = Repository::<CatalogItem>::new(engine, locks, 10);
        repo.replace_all(vec![item("1", "Stout")]).await.unwrap();

        let outcome = repo.replace_all(Vec::new()).await.unwrap();
        assert_eq!(outcome.records_affected, 0);
        assert_eq!(outcome.summary, ReplaceSummary::default());
        assert_eq!(repo.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_records_are_skipped() {
        let (engine, locks) = setup().await;
        let repo = Repository::<CatalogItem>::new(engine, locks.clone(), 2);

        let mut records: Vec<CatalogItem> = (0..5).map(|i| item(&format!("ok{i}"), "Ale")).collect();
        records.push(CatalogItem::default());
        records.push(item("  ", "Blank key"));
        records.push(item("no-name", ""));

        let outcome = repo.replace_all(records).await.unwrap();
        assert_eq!(outcome.summary, ReplaceSummary { valid: 5, invalid: 3 });
        assert_eq!(outcome.records_affected, 5);
        assert_eq!(outcome.invalid_records[2].reason, "name is empty");
        assert_eq!(repo.count().unwrap(), 5);
        assert!(!locks.is_locked());
    }

    #[tokio::test]
    async fn failure_on_item_k_rolls_back_everything() {
        let (engine, locks) = setup().await;
        let repo = Repository::<CatalogItem>::new(Arc::clone(&engine), locks.clone(), 3);
        repo.replace_all(vec![item("old1", "Pils"), item("old2", "Bock")])
            .await
            .unwrap();
        let before = snapshot(&repo);

        let records: Vec<CatalogItem> = (0..10).map(|i| item(&i.to_string(), "New")).collect();
        let err = replace_all(
            engine.as_ref(),
            &locks,
            CatalogItem::TABLE,
            records,
            |r: &CatalogItem| r.validate(),
            |tx: &dyn SqlExecutor, batch: &[CatalogItem]| {
                if batch.iter().any(|r| r.id.as_deref() == Some("7")) {
                    return Err(CoreError::invalid_operation("insert failed on item 7"));
                }
                insert_batch(tx, batch)
            },
            3,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("item 7"));
        assert_eq!(snapshot(&repo), before);
        assert_eq!(repo.count().unwrap(), 2);
        assert!(!locks.is_locked());
    }

    #[tokio::test]
    async fn duplicate_keys_keep_last() {
        let (engine, locks) = setup().await;
        let repo = Repository::<CatalogItem>::new(engine, locks, 50);
        let outcome = repo
            .replace_all(vec![item("1", "First"), item("1", "Second")])
            .await
            .unwrap();
        assert_eq!(outcome.summary.valid, 2);
        assert_eq!(outcome.records_affected, 2);
        assert_eq!(repo.count().unwrap(), 1);
        assert_eq!(repo.require("1").unwrap().name.as_deref(), Some("Second"));
        assert!(matches!(repo.require("2"), Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn batch_size_above_parameter_limit_still_replaces() {
        let (engine, locks) = setup().await;
        let batch_size = MAX_SQL_VARIABLES / CatalogItem::COLUMNS.len() + 1000;
        let repo = Repository::<CatalogItem>::new(engine, locks, batch_size);

        let records: Vec<CatalogItem> = (0..batch_size).map(|i| item(&i.to_string(), "Lager")).collect();
        let outcome = repo.replace_all(records).await.unwrap();

        assert_eq!(outcome.records_affected, batch_size);
        assert_eq!(repo.count().unwrap(), batch_size as u64);
    }

    #[tokio::test]
    async fn reads_back_in_insertion_order() {
        let (engine, locks) = setup().await;
        let repo = Repository::<CatalogItem>::new(engine, locks, 4);
        let records: Vec<CatalogItem> = ["c", "a", "b"].iter().map(|id| item(id, "X")).collect();
        repo.replace_all(records.clone()).await.unwrap();
        assert_eq!(repo.all().unwrap(), records);
        assert_eq!(repo.get("a").unwrap().unwrap().id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn waits_for_lock_holder() {
        let (engine, locks) = setup().await;
        let repo = Repository::<CatalogItem>::new(engine, locks.clone(), 10);
        let guard = locks.acquire("migration", None).await.unwrap();

        let task = tokio::spawn({
            let repo = repo.clone();
            async move { repo.replace_all(vec![item("1", "Stout")]).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(locks.queue_length(), 1);
        assert_eq!(repo.count().unwrap(), 0);

        guard.release();
        task.await.unwrap().unwrap();
        assert_eq!(repo.count().unwrap(), 1);
    }
}
