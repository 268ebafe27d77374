//! Preference commands.

use sipsync_core::PreferenceStore;
use std::path::Path;

/// Print one preference.
pub async fn get(db_path: &Path, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::open_ready(db_path).await?;
    match db.preferences().get(key)? {
        Some(value) => println!("{}", value),
        None => return Err(format!("Preference {:?} is not set", key).into()),
    }
    Ok(())
}

/// Store a preference.
pub async fn set(
    db_path: &Path,
    key: &str,
    value: &str,
    description: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::open_ready(db_path).await?;
    db.preferences().set(key, value, description)?;
    println!("✓ {} = {}", key, value);
    Ok(())
}

/// Print every preference.
pub async fn list(db_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::open_ready(db_path).await?;
    let prefs = db.preferences().all()?;

    if prefs.is_empty() {
        println!("No preferences stored.");
        return Ok(());
    }

    for pref in prefs {
        match pref.description {
            Some(desc) => println!("{} = {}    # {}", pref.key, pref.value, desc),
            None => println!("{} = {}", pref.key, pref.value),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        set(&path, "guest_mode", "true", Some("skip personal data"))
            .await
            .unwrap();
        get(&path, "guest_mode").await.unwrap();
        list(&path).await.unwrap();

        let db = super::super::open_ready(&path).await.unwrap();
        assert!(db.preferences().get_bool("guest_mode").unwrap());
    }

    #[tokio::test]
    async fn missing_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        assert!(get(&path, "endpoint.catalog").await.is_err());
    }
}
