//! Integration tests for the cache database.

use sipsync_core::{
    CacheDatabase, CachedRecord, CatalogItem, CoreConfig, CoreError, CoreResult, InitState,
    LockConfig, Migration, PreferenceStore, Reward, SchemaMigrator, SchemaVersion, SqlExecutor,
    TastedItem, GUEST_MODE,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Creates a table and counts how often it ran.
struct Counting {
    runs: Arc<AtomicUsize>,
}

impl Migration for Counting {
    fn version(&self) -> SchemaVersion {
        1
    }

    fn name(&self) -> &str {
        "counting"
    }

    fn up(&self, executor: &dyn SqlExecutor) -> CoreResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        executor.execute("CREATE TABLE IF NOT EXISTS counted (id TEXT)", &[])?;
        Ok(())
    }
}

fn catalog(ids: &[&str]) -> Vec<CatalogItem> {
    ids.iter()
        .map(|id| CatalogItem {
            id: Some(id.to_string()),
            name: Some(format!("Beer {id}")),
            style: Some("IPA".into()),
            abv: Some(6.5),
            ..Default::default()
        })
        .collect()
}

#[tokio::test]
async fn concurrent_initializers_share_one_setup() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut migrator = SchemaMigrator::new();
    migrator
        .register(Box::new(Counting {
            runs: Arc::clone(&runs),
        }))
        .unwrap();
    let db = Arc::new(
        CacheDatabase::open_in_memory(CoreConfig::default())
            .unwrap()
            .with_migrator(migrator),
    );

    // Keep the first initializer parked on the migration lock so the
    // others arrive while it is in flight.
    let blocker = db.locks().acquire("blocker", None).await.unwrap();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            tokio::spawn(async move { db.initialize().await })
        })
        .collect();

    while db.state().waiter_count() < 3 {
        tokio::task::yield_now().await;
    }
    assert_eq!(db.state().state(), InitState::Initializing);

    blocker.release();

    let mut performed_setup = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().is_some() {
            performed_setup += 1;
        }
    }
    assert_eq!(performed_setup, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(db.state().state(), InitState::Ready);
}

#[tokio::test]
async fn refresh_cycle_replaces_collections() {
    let db = CacheDatabase::open_in_memory(CoreConfig::default().batch_size(2)).unwrap();
    db.initialize().await.unwrap();

    let repo = db.repository::<CatalogItem>().unwrap();
    repo.replace_all(catalog(&["1", "2", "3"])).await.unwrap();
    let outcome = repo.replace_all(catalog(&["4", "5"])).await.unwrap();

    assert_eq!(outcome.records_affected, 2);
    let ids: Vec<String> = repo.all().unwrap().into_iter().filter_map(|i| i.id).collect();
    assert_eq!(ids, ["4", "5"]);
    assert_eq!(repo.get("4").unwrap().unwrap().abv, Some(6.5));

    let history = db.repository::<TastedItem>().unwrap();
    let outcome = history
        .replace_all(vec![
            TastedItem {
                id: Some("t1".into()),
                catalog_item_id: Some("4".into()),
                rating: Some(4.0),
                ..Default::default()
            },
            TastedItem {
                id: Some("t2".into()),
                ..Default::default()
            },
        ])
        .await
        .unwrap();
    assert_eq!(outcome.summary.valid, 1);
    assert_eq!(outcome.summary.invalid, 1);

    let rewards = db.repository::<Reward>().unwrap();
    assert_eq!(rewards.replace_all(Vec::new()).await.unwrap().records_affected, 0);
    assert_eq!(rewards.table(), Reward::TABLE);
}

#[tokio::test]
async fn file_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
        let db = CacheDatabase::open(&path, CoreConfig::default()).unwrap();
        db.initialize().await.unwrap();
        db.repository::<CatalogItem>()
            .unwrap()
            .replace_all(catalog(&["a", "b"]))
            .await
            .unwrap();
        db.preferences().set(GUEST_MODE, "true", Some("Limited mode")).unwrap();
    }

    let db = CacheDatabase::open(&path, CoreConfig::default()).unwrap();
    let result = db.initialize().await.unwrap().unwrap();
    assert!(result.applied.is_empty());
    assert_eq!(db.repository::<CatalogItem>().unwrap().count().unwrap(), 2);
    assert!(db.preferences().get_bool(GUEST_MODE).unwrap());
    assert!(db.location().ends_with("cache.db"));
}

#[tokio::test(start_paused = true)]
async fn refresh_times_out_behind_stuck_holder() {
    let config = CoreConfig::default().lock(
        LockConfig::new()
            .hold_timeout(Duration::from_secs(60))
            .acquisition_timeout(Duration::from_secs(2)),
    );
    let db = CacheDatabase::open_in_memory(config).unwrap();
    db.initialize().await.unwrap();
    let repo = db.repository::<CatalogItem>().unwrap();
    repo.replace_all(catalog(&["keep"])).await.unwrap();

    let _stuck = db.locks().acquire("stuck", None).await.unwrap();
    let err = repo.replace_all(catalog(&["new"])).await.unwrap_err();

    assert!(matches!(err, CoreError::LockTimeout { timeout_ms: 2000, .. }));
    assert_eq!(db.locks().queue_length(), 0);
    assert_eq!(repo.all().unwrap()[0].id.as_deref(), Some("keep"));
}
