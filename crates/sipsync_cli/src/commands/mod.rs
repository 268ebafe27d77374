//! CLI command implementations.

pub mod inspect;
pub mod migrate;
pub mod prefs;
pub mod queue;

use sipsync_core::{CacheDatabase, CoreConfig};
use std::path::Path;

/// Opens the cache file at `path` without touching its schema.
pub fn open(path: &Path) -> Result<CacheDatabase, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No database found at {:?}", path).into());
    }
    Ok(CacheDatabase::open(path, CoreConfig::default())?)
}

/// Opens the cache file at `path`, creating it and migrating it if needed.
pub async fn open_ready(path: &Path) -> Result<CacheDatabase, Box<dyn std::error::Error>> {
    let db = CacheDatabase::open(path, CoreConfig::default())?;
    db.initialize().await?;
    Ok(db)
}
