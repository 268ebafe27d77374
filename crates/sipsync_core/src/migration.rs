//! Schema versioning and migrations.
//!
//! ## Design
//!
//! Migrations are:
//! - **Forward-only**: there is no down step
//! - **Transactional**: each migration and its bookkeeping row commit together
//! - **Lock-protected**: each migration holds the `schema_migration` lock
//! - **Idempotent**: `up` must tolerate a partially migrated schema, so
//!   statements use `IF NOT EXISTS` and [`add_column_if_missing`]
//!
//! Applied versions are recorded append-only in `schema_version`; the
//! current version is the highest recorded one.

use crate::engine::{SqlEngine, SqlExecutor, SqlValue};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockManager;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Version number for migrations.
pub type SchemaVersion = u32;

/// Lock name held while a migration runs.
pub const MIGRATION_LOCK: &str = "schema_migration";

const CREATE_VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
)";

/// Information about a registered migration.
#[derive(Debug, Clone)]
pub struct MigrationInfo {
    /// Version number (unique, increasing).
    pub version: SchemaVersion,
    /// Human-readable name.
    pub name: String,
    /// Description of what this migration does.
    pub description: Option<String>,
}

/// A row of the `schema_version` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    /// Version number.
    pub version: SchemaVersion,
    /// Migration name.
    pub name: String,
    /// When the migration was applied (RFC 3339).
    pub applied_at: String,
}

/// Result of running all pending migrations.
#[derive(Debug, Clone, Default)]
pub struct MigrationRunResult {
    /// Versions applied by this run, in order.
    pub applied: Vec<SchemaVersion>,
    /// Versions that turned out to be applied already when their turn came.
    pub skipped: Vec<SchemaVersion>,
    /// Schema version after the run.
    pub final_version: SchemaVersion,
}

/// Trait for defining migrations.
pub trait Migration: Send + Sync {
    /// Returns the version number for this migration.
    ///
    /// Versions must be unique and start from 1.
    fn version(&self) -> SchemaVersion;

    /// Returns the name of this migration.
    fn name(&self) -> &str;

    /// Returns an optional description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Applies the migration. Must be safe to re-run.
    fn up(&self, executor: &dyn SqlExecutor) -> CoreResult<()>;
}

/// A migration made of a fixed list of statements.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    version: SchemaVersion,
    name: &'static str,
    description: Option<&'static str>,
    statements: Vec<&'static str>,
    columns: Vec<(&'static str, &'static str, &'static str)>,
}

impl SqlMigration {
    /// Creates a migration running `statements` in order.
    pub fn new(version: SchemaVersion, name: &'static str, statements: Vec<&'static str>) -> Self {
        Self {
            version,
            name,
            description: None,
            statements,
            columns: Vec::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: &'static str) -> Self {
        self.description = Some(description);
        self
    }

    /// Adds `table.column` with `definition` unless it already exists.
    ///
    /// Columns are added before the statements run.
    #[must_use]
    pub fn with_column(
        mut self,
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    ) -> Self {
        self.columns.push((table, column, definition));
        self
    }
}

impl Migration for SqlMigration {
    fn version(&self) -> SchemaVersion {
        self.version
    }

    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> Option<&str> {
        self.description
    }

    fn up(&self, executor: &dyn SqlExecutor) -> CoreResult<()> {
        for (table, column, definition) in &self.columns {
            add_column_if_missing(executor, table, column, definition)?;
        }
        for statement in &self.statements {
            executor.execute(statement, &[])?;
        }
        Ok(())
    }
}

/// Adds a column unless the table already has it. Returns true if added.
pub fn add_column_if_missing<E: SqlExecutor + ?Sized>(
    executor: &E,
    table: &str,
    column: &str,
    definition: &str,
) -> CoreResult<bool> {
    let existing = executor.query_all(&format!("PRAGMA table_info({table})"), &[])?;
    if existing.iter().any(|r| r.text("name").as_deref() == Some(column)) {
        debug!(table, column, "column already present");
        return Ok(false);
    }
    executor.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
        &[],
    )?;
    Ok(true)
}

/// Applies registered migrations to an engine.
#[derive(Default)]
pub struct SchemaMigrator {
    migrations: BTreeMap<SchemaVersion, Box<dyn Migration>>,
}

impl std::fmt::Debug for SchemaMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaMigrator")
            .field("versions", &self.migrations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SchemaMigrator {
    /// Creates a migrator with no migrations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a migration.
    ///
    /// Returns an error if the version is zero or already registered.
    pub fn register(&mut self, migration: Box<dyn Migration>) -> CoreResult<()> {
        let version = migration.version();
        if version == 0 {
            return Err(CoreError::migration(0, "migration versions start at 1"));
        }
        if self.migrations.contains_key(&version) {
            return Err(CoreError::migration(
                version,
                format!("migration version {version} already registered"),
            ));
        }
        self.migrations.insert(version, migration);
        Ok(())
    }

    /// Returns the registered migrations in version order.
    #[must_use]
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.migrations.values().map(|m| info(m.as_ref())).collect()
    }

    /// Returns the highest registered version.
    #[must_use]
    pub fn latest_version(&self) -> SchemaVersion {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    /// Returns the highest applied version, 0 for a fresh database.
    pub fn current_version<E: SqlExecutor + ?Sized>(&self, executor: &E) -> CoreResult<SchemaVersion> {
        executor.execute(CREATE_VERSION_TABLE, &[])?;
        let row = executor.query_one("SELECT MAX(version) AS v FROM schema_version", &[])?;
        Ok(row
            .and_then(|r| r.integer("v"))
            .map(|v| v as SchemaVersion)
            .unwrap_or(0))
    }

    /// Returns every recorded migration, oldest first.
    pub fn applied<E: SqlExecutor + ?Sized>(&self, executor: &E) -> CoreResult<Vec<AppliedMigration>> {
        executor.execute(CREATE_VERSION_TABLE, &[])?;
        let rows = executor.query_all(
            "SELECT version, name, applied_at FROM schema_version ORDER BY version",
            &[],
        )?;
        rows.into_iter()
            .map(|r| -> CoreResult<AppliedMigration> {
                Ok(AppliedMigration {
                    version: r
                        .integer("version")
                        .ok_or_else(|| CoreError::invalid_row("schema_version", "missing version"))?
                        as SchemaVersion,
                    name: r.text("name").unwrap_or_default(),
                    applied_at: r.text("applied_at").unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Returns registered migrations not yet applied.
    pub fn pending<E: SqlExecutor + ?Sized>(&self, executor: &E) -> CoreResult<Vec<MigrationInfo>> {
        let current = self.current_version(executor)?;
        Ok(self
            .migrations
            .range(current + 1..)
            .map(|(_, m)| info(m.as_ref()))
            .collect())
    }

    /// Applies every pending migration in version order.
    ///
    /// Each migration holds [`MIGRATION_LOCK`] and runs with its bookkeeping
    /// insert in one transaction. The first failure stops the run and is
    /// returned as [`CoreError::Migration`].
    pub async fn run_pending(
        &self,
        engine: &Arc<dyn SqlEngine>,
        locks: &LockManager,
    ) -> CoreResult<MigrationRunResult> {
        let mut result = MigrationRunResult::default();
        let start = self.current_version(engine.as_ref())?;

        for (&version, migration) in self.migrations.range(start + 1..) {
            let applied = locks
                .with_lock(MIGRATION_LOCK, || async {
                    apply_one(engine.as_ref(), migration.as_ref())
                })
                .await?;
            if applied {
                result.applied.push(version);
            } else {
                result.skipped.push(version);
            }
        }

        result.final_version = self.current_version(engine.as_ref())?;
        if !result.applied.is_empty() {
            info!(
                from = start,
                to = result.final_version,
                applied = result.applied.len(),
                "schema migrated"
            );
        }
        Ok(result)
    }
}

fn info(migration: &dyn Migration) -> MigrationInfo {
    MigrationInfo {
        version: migration.version(),
        name: migration.name().to_string(),
        description: migration.description().map(String::from),
    }
}

/// Runs one migration unless another caller applied it first.
fn apply_one(engine: &dyn SqlEngine, migration: &dyn Migration) -> CoreResult<bool> {
    let version = migration.version();
    let mut applied = false;

    engine
        .run_in_transaction(&mut |tx| {
            let exists = tx.query_one(
                "SELECT 1 FROM schema_version WHERE version = ?1",
                &[SqlValue::from(version)],
            )?;
            if exists.is_some() {
                return Ok(());
            }
            migration.up(tx)?;
            tx.execute(
                "INSERT INTO schema_version (version, name, applied_at) VALUES (?1, ?2, ?3)",
                &[
                    SqlValue::from(version),
                    migration.name().into(),
                    chrono::Utc::now().to_rfc3339().into(),
                ],
            )?;
            applied = true;
            Ok(())
        })
        .map_err(|e| match e {
            CoreError::Migration { .. } => e,
            other => CoreError::migration(version, other.to_string()),
        })?;

    if applied {
        info!(version, name = migration.name(), "applied migration");
    } else {
        debug!(version, "migration already applied");
    }
    Ok(applied)
}
