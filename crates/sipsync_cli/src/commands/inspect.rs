//! Inspect command implementation.

use serde::Serialize;
use sipsync_core::{
    count_rows, table_exists, CacheDatabase, CachedRecord, CatalogItem, Reward, SqlEngine,
    TastedItem,
};
use std::path::Path;

/// Cache inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database location.
    pub path: String,
    /// Database file size in bytes.
    pub file_size: u64,
    /// Highest applied schema version.
    pub schema_version: u32,
    /// Latest version known to this build.
    pub latest_version: u32,
    /// Row counts of the cached tables.
    pub tables: Vec<TableStats>,
    /// Offline queue counts, if the queue table exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueStats>,
}

/// Row count of one table.
#[derive(Debug, Serialize)]
pub struct TableStats {
    /// Table name.
    pub name: String,
    /// Number of rows, or `None` if the table does not exist yet.
    pub rows: Option<u64>,
}

/// Offline queue counts.
#[derive(Debug, Serialize)]
pub struct QueueStats {
    /// Operations awaiting replay.
    pub pending: u64,
    /// Operations that exhausted their retries.
    pub failed: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::open(path)?;
    let mut result = collect(&db)?;
    result.file_size = std::fs::metadata(path)?.len();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Gathers statistics from an open cache.
pub fn collect(db: &CacheDatabase) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let engine: &dyn SqlEngine = db.engine().as_ref();

    let mut tables = Vec::new();
    for name in [CatalogItem::TABLE, TastedItem::TABLE, Reward::TABLE, "preferences"] {
        let rows = if table_exists(engine, name)? {
            Some(count_rows(engine, name)?)
        } else {
            None
        };
        tables.push(TableStats {
            name: name.to_string(),
            rows,
        });
    }

    let queue = if table_exists(engine, "offline_queue")? {
        let counts = db.queue().counts()?;
        Some(QueueStats {
            pending: counts.pending,
            failed: counts.failed,
        })
    } else {
        None
    };

    Ok(InspectResult {
        path: db.location().to_string(),
        file_size: 0,
        schema_version: db.migrator().current_version(engine)?,
        latest_version: db.migrator().latest_version(),
        tables,
        queue,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("sipsync Cache Inspection");
    println!("========================");
    println!();
    println!("Path: {}", result.path);
    println!("Size: {}", format_size(result.file_size));
    println!();
    println!("Schema:");
    println!("  Current version: {}", result.schema_version);
    println!("  Latest version:  {}", result.latest_version);
    println!();
    println!("Tables:");
    for table in &result.tables {
        match table.rows {
            Some(rows) => println!("  {:<14} {} rows", table.name, rows),
            None => println!("  {:<14} (missing)", table.name),
        }
    }

    if let Some(queue) = &result.queue {
        println!();
        println!("Offline queue:");
        println!("  Pending: {}", queue.pending);
        println!("  Failed:  {}", queue.failed);
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipsync_core::CoreConfig;

    #[test]
    fn reports_missing_cache_tables_before_migration() {
        let db = CacheDatabase::open_in_memory(CoreConfig::default()).unwrap();
        let result = collect(&db).unwrap();

        assert_eq!(result.schema_version, 0);
        assert_eq!(result.latest_version, 3);
        for table in &result.tables {
            if table.name == "preferences" {
                assert_eq!(table.rows, Some(0));
            } else {
                assert!(table.rows.is_none());
            }
        }
        assert!(result.queue.is_none());
    }

    #[tokio::test]
    async fn reports_counts_after_migration() {
        let db = CacheDatabase::open_in_memory(CoreConfig::default()).unwrap();
        db.initialize().await.unwrap();
        db.queue()
            .enqueue("rate", serde_json::json!({"id": 1}))
            .await
            .unwrap();

        let result = collect(&db).unwrap();
        assert_eq!(result.schema_version, 3);
        assert!(result.tables.iter().all(|t| t.rows == Some(0)));
        let queue = result.queue.unwrap();
        assert_eq!(queue.pending, 1);
        assert_eq!(queue.failed, 0);

        let json = serde_json::to_value(collect(&db).unwrap()).unwrap();
        assert_eq!(json["tables"][0]["name"], "catalog_items");
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
