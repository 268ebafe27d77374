//! Key/value preference store.
//!
//! Preferences hold runtime feature toggles (guest mode, endpoint overrides)
//! and small bits of bookkeeping. Values are plain strings.

use crate::engine::{SqlEngine, SqlExecutor, SqlValue};
use crate::error::CoreResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Preference key that switches the app into guest/limited mode.
pub const GUEST_MODE: &str = "guest_mode";

/// Prefix for per-collection endpoint overrides (`endpoint.<collection>`).
pub const ENDPOINT_PREFIX: &str = "endpoint.";

/// DDL for the `preferences` table.
pub(crate) const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS preferences (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    description TEXT,
    updated_at TEXT NOT NULL
)";

/// A stored preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preference {
    /// Preference key.
    pub key: String,
    /// Stored value.
    pub value: String,
    /// Optional human-readable description.
    pub description: Option<String>,
}

/// Read/write access to preferences.
pub trait PreferenceStore: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> CoreResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str, description: Option<&str>) -> CoreResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> CoreResult<()>;

    /// Returns every preference ordered by key.
    fn all(&self) -> CoreResult<Vec<Preference>>;

    /// Interprets `key` as a boolean toggle.
    ///
    /// `true`, `1` and `yes` (any case) are true; anything else, including
    /// a missing key, is false.
    fn get_bool(&self, key: &str) -> CoreResult<bool> {
        Ok(self
            .get(key)?
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false))
    }
}

/// Preferences stored in the `preferences` table.
#[derive(Clone)]
pub struct SqlPreferences {
    engine: Arc<dyn SqlEngine>,
}

impl std::fmt::Debug for SqlPreferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlPreferences").finish_non_exhaustive()
    }
}

impl SqlPreferences {
    /// Creates a store backed by `engine`.
    ///
    /// The `preferences` table must already exist.
    pub fn new(engine: Arc<dyn SqlEngine>) -> Self {
        Self { engine }
    }

    /// Creates a store backed by `engine`, creating the `preferences` table
    /// if it is missing so the store works before any migration has run.
    pub fn open(engine: Arc<dyn SqlEngine>) -> CoreResult<Self> {
        engine.execute(CREATE_TABLE, &[])?;
        Ok(Self::new(engine))
    }
}

impl PreferenceStore for SqlPreferences {
    fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let row = self
            .engine
            .query_one("SELECT value FROM preferences WHERE key = ?1", &[key.into()])?;
        Ok(row.and_then(|r| r.text("value")))
    }

    fn set(&self, key: &str, value: &str, description: Option<&str>) -> CoreResult<()> {
        self.engine.execute(
            "INSERT INTO preferences (key, value, description, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                description = COALESCE(excluded.description, preferences.description),
                updated_at = excluded.updated_at",
            &[
                key.into(),
                value.into(),
                SqlValue::from(description),
                chrono::Utc::now().to_rfc3339().into(),
            ],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> CoreResult<()> {
        self.engine
            .execute("DELETE FROM preferences WHERE key = ?1", &[key.into()])?;
        Ok(())
    }

    fn all(&self) -> CoreResult<Vec<Preference>> {
        let rows = self.engine.query_all(
            "SELECT key, value, description FROM preferences ORDER BY key",
            &[],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                Some(Preference {
                    key: r.text("key")?,
                    value: r.text("value").unwrap_or_default(),
                    description: r.text("description"),
                })
            })
            .collect())
    }
}

/// In-memory preferences, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    entries: RwLock<BTreeMap<String, (String, Option<String>)>>,
}

impl MemoryPreferences {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self.entries.read().get(key).map(|(v, _)| v.clone()))
    }

    fn set(&self, key: &str, value: &str, description: Option<&str>) -> CoreResult<()> {
        let mut entries = self.entries.write();
        let previous = entries.get(key).and_then(|(_, d)| d.clone());
        entries.insert(
            key.to_string(),
            (value.to_string(), description.map(String::from).or(previous)),
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> CoreResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn all(&self) -> CoreResult<Vec<Preference>> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(key, (value, description))| Preference {
                key: key.clone(),
                value: value.clone(),
                description: description.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SqliteEngine;

    fn sql_store() -> SqlPreferences {
        SqlPreferences::open(Arc::new(SqliteEngine::open_in_memory().unwrap())).unwrap()
    }

    fn exercise(store: &dyn PreferenceStore) {
        assert_eq!(store.get("missing").unwrap(), None);

        store.set("theme", "dark", Some("UI theme")).unwrap();
        store.set("theme", "light", None).unwrap();
        assert_eq!(store.get("theme").unwrap().as_deref(), Some("light"));

        let all = store.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].description.as_deref(), Some("UI theme"));

        store.remove("theme").unwrap();
        store.remove("theme").unwrap();
        assert_eq!(store.get("theme").unwrap(), None);
    }

    #[test]
    fn sql_store_basics() {
        exercise(&sql_store());
    }

    #[test]
    fn memory_store_basics() {
        exercise(&MemoryPreferences::new());
    }

    #[test]
    fn bool_parsing() {
        let store = MemoryPreferences::new();
        assert!(!store.get_bool(GUEST_MODE).unwrap());
        for truthy in ["true", "TRUE", "1", " yes "] {
            store.set(GUEST_MODE, truthy, None).unwrap();
            assert!(store.get_bool(GUEST_MODE).unwrap(), "{truthy}");
        }
        store.set(GUEST_MODE, "off", None).unwrap();
        assert!(!store.get_bool(GUEST_MODE).unwrap());
    }
}
