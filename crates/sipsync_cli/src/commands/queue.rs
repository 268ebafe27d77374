//! Offline queue commands.

use std::path::Path;

/// List queued operations, oldest first.
pub async fn list(db_path: &Path, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::open_ready(db_path).await?;
    let queue = db.queue();
    let counts = queue.counts()?;
    let operations = queue.list(limit)?;

    println!(
        "Offline queue: {} pending, {} failed",
        counts.pending, counts.failed
    );
    if operations.is_empty() {
        return Ok(());
    }

    println!();
    for op in &operations {
        println!(
            "  {} {:<12} {:<8} retries={} queued={}",
            op.id,
            op.op_type,
            op.status,
            op.retry_count,
            op.enqueued_at.to_rfc3339()
        );
        if let Some(err) = &op.last_error {
            println!("      last error: {}", err);
        }
    }
    Ok(())
}

/// Remove every queued operation.
pub async fn clear(db_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::open_ready(db_path).await?;
    let removed = db.queue().clear().await?;
    println!("✓ Removed {} queued operation(s)", removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clear_empties_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let db = super::super::open_ready(&path).await.unwrap();
            db.queue()
                .enqueue("wishlist", serde_json::json!({"beer": 7}))
                .await
                .unwrap();
        }

        list(&path, 10).await.unwrap();
        clear(&path).await.unwrap();

        let db = super::super::open_ready(&path).await.unwrap();
        assert_eq!(db.queue().counts().unwrap().pending, 0);
    }
}
