//! Built-in cache schema.

use crate::error::CoreResult;
use crate::migration::{SchemaMigrator, SqlMigration};

/// Returns a migrator loaded with the cache schema.
pub fn builtin_migrations() -> CoreResult<SchemaMigrator> {
    let mut migrator = SchemaMigrator::new();

    migrator.register(Box::new(
        SqlMigration::new(
            1,
            "initial_tables",
            vec![
                "CREATE TABLE IF NOT EXISTS preferences (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    description TEXT,
                    updated_at TEXT NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS catalog_items (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    brewery TEXT,
                    style TEXT,
                    abv REAL,
                    description TEXT,
                    updated_at TEXT
                )",
                "CREATE TABLE IF NOT EXISTS tasted_items (
                    id TEXT PRIMARY KEY,
                    catalog_item_id TEXT NOT NULL,
                    name TEXT,
                    tasted_at TEXT,
                    rating REAL,
                    notes TEXT
                )",
                "CREATE TABLE IF NOT EXISTS rewards (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    earned_at TEXT,
                    progress REAL
                )",
            ],
        )
        .with_description("Preferences and cached collection tables"),
    ))?;

    migrator.register(Box::new(
        SqlMigration::new(
            2,
            "offline_queue",
            vec![
                "CREATE TABLE IF NOT EXISTS offline_queue (
                    id TEXT PRIMARY KEY,
                    op_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    enqueued_at TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'pending',
                    last_error TEXT
                )",
                "CREATE INDEX IF NOT EXISTS idx_offline_queue_status
                    ON offline_queue (status, enqueued_at)",
            ],
        )
        .with_description("Queue of mutations made while offline"),
    ))?;

    migrator.register(Box::new(
        SqlMigration::new(
            3,
            "catalog_images",
            vec!["CREATE INDEX IF NOT EXISTS idx_tasted_items_tasted_at ON tasted_items (tasted_at)"],
        )
        .with_column("catalog_items", "image_url", "TEXT")
        .with_description("Catalog label images and history ordering index"),
    ))?;

    Ok(migrator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{table_exists, SqlEngine, SqliteEngine};
    use crate::lock::LockManager;
    use std::sync::Arc;

    #[tokio::test]
    async fn creates_every_table() {
        let engine: Arc<dyn SqlEngine> = Arc::new(SqliteEngine::open_in_memory().unwrap());
        let migrator = builtin_migrations().unwrap();
        let result = migrator
            .run_pending(&engine, &LockManager::default())
            .await
            .unwrap();

        assert_eq!(result.applied, vec![1, 2, 3]);
        assert_eq!(result.final_version, migrator.latest_version());
        for table in ["preferences", "catalog_items", "tasted_items", "rewards", "offline_queue"] {
            assert!(table_exists(engine.as_ref(), table).unwrap(), "{table}");
        }
    }
}
