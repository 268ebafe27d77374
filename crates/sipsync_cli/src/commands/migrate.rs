//! Migration commands.

use sipsync_core::{CacheDatabase, MigrationInfo, SqlEngine};
use std::path::Path;
use tracing::info;

/// A registered migration and whether it has been applied.
#[derive(Debug)]
pub struct MigrationStatus {
    /// The registered migration.
    pub migration: MigrationInfo,
    /// When it was applied, if it was.
    pub applied_at: Option<String>,
}

/// Show current migration status.
pub fn status(db_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Checking migration status for {:?}", db_path);

    let db = super::open(db_path)?;
    let statuses = collect_status(&db)?;
    let current = db.migrator().current_version(db.engine().as_ref())?;

    println!("Migration Status");
    println!("================");
    println!("  Current version: {}", current);
    println!("  Latest version:  {}", db.migrator().latest_version());
    println!();

    for entry in &statuses {
        let status = match &entry.applied_at {
            Some(at) => format!("✓ applied {}", at),
            None => "○ pending".to_string(),
        };
        println!(
            "  v{}: {} [{}]",
            entry.migration.version, entry.migration.name, status
        );
        if let Some(desc) = &entry.migration.description {
            println!("      {}", desc);
        }
    }

    Ok(())
}

/// Run pending migrations.
pub async fn run(db_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Running migrations for {:?}", db_path);

    let db = super::open(db_path)?;
    let pending = db.migrator().pending(db.engine().as_ref())?;
    if pending.is_empty() {
        println!("✓ No pending migrations to run.");
        return Ok(());
    }

    println!("Running {} migration(s)...", pending.len());
    let result = db.initialize().await?.unwrap_or_default();

    println!(
        "\n✓ Successfully applied {} migration(s)",
        result.applied.len()
    );
    println!("  Final version: {}", result.final_version);

    Ok(())
}

/// Pairs every registered migration with its applied record.
pub fn collect_status(
    db: &CacheDatabase,
) -> Result<Vec<MigrationStatus>, Box<dyn std::error::Error>> {
    let engine: &dyn SqlEngine = db.engine().as_ref();
    let applied = db.migrator().applied(engine)?;

    Ok(db
        .migrator()
        .list()
        .into_iter()
        .map(|migration| {
            let applied_at = applied
                .iter()
                .find(|a| a.version == migration.version)
                .map(|a| a.applied_at.clone());
            MigrationStatus {
                migration,
                applied_at,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipsync_core::CoreConfig;

    #[tokio::test]
    async fn status_tracks_applied_migrations() {
        let db = CacheDatabase::open_in_memory(CoreConfig::default()).unwrap();

        let before = collect_status(&db).unwrap();
        assert_eq!(before.len(), 3);
        assert!(before.iter().all(|s| s.applied_at.is_none()));

        db.initialize().await.unwrap();

        let after = collect_status(&db).unwrap();
        assert!(after.iter().all(|s| s.applied_at.is_some()));
        assert_eq!(after[1].migration.name, "offline_queue");
    }

    #[tokio::test]
    async fn run_migrates_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        // Create the file without migrating it.
        drop(CacheDatabase::open(&path, CoreConfig::default()).unwrap());

        run(&path).await.unwrap();

        let db = super::super::open(&path).unwrap();
        assert_eq!(db.migrator().current_version(db.engine().as_ref()).unwrap(), 3);
    }
}
