//! Integration tests for the sync orchestrator.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use sipsync_core::{
    CatalogItem, InitState, PreferenceStore, QueuedOperation, Reward, TastedItem, GUEST_MODE,
};
use sipsync_engine::{
    Collection, HttpResponse, HttpTransport, MockTransport, OperationSink, SyncConfig, SyncError,
    SyncOrchestrator, SyncResult,
};
use std::sync::Arc;

const BASE: &str = "https://api.example.com";

fn url(path: &str) -> String {
    format!("{BASE}{path}")
}

fn transport_with_data() -> Arc<MockTransport> {
    let transport = Arc::new(MockTransport::new());
    transport.set_json(
        &url("/catalog"),
        &json!({"data": [
            {"id": 1, "name": "Pilsner", "abv": 4.8},
            {"id": 2, "name": "Porter"},
            {"id": "", "name": "Broken"}
        ]}),
    );
    transport.set_json(
        &url("/me/history"),
        &json!([{"id": "t1", "catalogItemId": 1, "rating": 4.5}]),
    );
    transport.set_json(
        &url("/me/rewards"),
        &json!({"data": {"items": [{"id": 9, "name": "First sip", "progress": 1.0}]}}),
    );
    transport
}

fn orchestrator(transport: &Arc<MockTransport>) -> SyncOrchestrator {
    SyncOrchestrator::open_in_memory(
        Arc::clone(transport) as Arc<dyn HttpTransport>,
        SyncConfig::new(BASE),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn startup_refreshes_primary_then_background() {
    let transport = transport_with_data();
    let sync = orchestrator(&transport);

    let report = sync.initialize().await.unwrap();
    assert_eq!(report.migrations.unwrap().final_version, 3);
    assert_eq!(report.primary.records_affected, 2);
    assert_eq!(report.primary.summary.invalid, 1);
    assert_eq!(report.scheduled, vec![Collection::History, Collection::Rewards]);
    assert!(!report.guest_mode);

    // Background work has not started yet.
    assert_eq!(transport.call_count(&url("/me/history")), 0);

    let outcomes = sync.wait_for_background().await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, result)| result.is_ok()));

    let db = sync.database();
    assert_eq!(db.repository::<CatalogItem>().unwrap().count().unwrap(), 2);
    assert_eq!(db.repository::<TastedItem>().unwrap().count().unwrap(), 1);
    let rewards = db.repository::<Reward>().unwrap().all().unwrap();
    assert_eq!(rewards[0].name.as_deref(), Some("First sip"));
}

#[tokio::test(start_paused = true)]
async fn background_failure_does_not_affect_others() {
    let transport = transport_with_data();
    transport.set_response(
        &url("/me/history"),
        HttpResponse::status(500, "Internal Server Error"),
    );
    let sync = orchestrator(&transport);

    sync.initialize().await.unwrap();
    let outcomes = sync.wait_for_background().await;

    let history = outcomes
        .iter()
        .find(|(c, _)| *c == Collection::History)
        .map(|(_, r)| r)
        .unwrap();
    assert!(matches!(history, Err(SyncError::Http { status: 500, .. })));
    assert_eq!(transport.call_count(&url("/me/history")), 3);

    let rewards = outcomes
        .iter()
        .find(|(c, _)| *c == Collection::Rewards)
        .map(|(_, r)| r)
        .unwrap();
    assert_eq!(rewards.as_ref().unwrap().records_affected, 1);
}

#[tokio::test(start_paused = true)]
async fn primary_refresh_retries_transient_failure() {
    let transport = transport_with_data();
    transport.push_failure(&url("/catalog"), SyncError::network("connection reset"));
    let sync = orchestrator(&transport);

    let report = sync.initialize().await.unwrap();
    assert_eq!(report.primary.records_affected, 2);
    assert_eq!(transport.call_count(&url("/catalog")), 2);
}

#[tokio::test(start_paused = true)]
async fn guest_mode_skips_personal_collections() {
    let transport = transport_with_data();
    let sync = orchestrator(&transport);
    sync.database().initialize().await.unwrap();
    sync.database()
        .preferences()
        .set(GUEST_MODE, "true", None)
        .unwrap();

    let report = sync.initialize().await.unwrap();
    assert!(report.guest_mode);
    assert!(report.scheduled.is_empty());
    assert!(sync.wait_for_background().await.is_empty());
    assert_eq!(transport.call_count(&url("/me/history")), 0);
    assert_eq!(transport.call_count(&url("/me/rewards")), 0);
}

#[tokio::test(start_paused = true)]
async fn primary_failure_keeps_cached_data() {
    let transport = transport_with_data();
    let sync = orchestrator(&transport);
    sync.initialize().await.unwrap();
    sync.wait_for_background().await;

    transport.set_response(&url("/catalog"), HttpResponse::status(503, "Service Unavailable"));
    let err = sync.initialize().await.unwrap_err();

    assert!(matches!(err, SyncError::Http { status: 503, .. }));
    let db = sync.database();
    assert_eq!(db.state().state(), InitState::Ready);
    assert_eq!(db.repository::<CatalogItem>().unwrap().count().unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_background_work() {
    let transport = transport_with_data();
    let sync = orchestrator(&transport);
    sync.initialize().await.unwrap();
    assert_eq!(sync.background_pending(), 2);

    assert!(sync.prepare_for_shutdown(None).await);
    let outcomes = sync.wait_for_background().await;
    assert!(outcomes
        .iter()
        .all(|(_, r)| matches!(r, Err(SyncError::Cancelled))));
    assert_eq!(transport.call_count(&url("/me/history")), 0);

    let err = sync.refresh_collection(Collection::Catalog).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Database(sipsync_core::CoreError::ShuttingDown { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn reset_state_allows_fresh_initialize() {
    let transport = transport_with_data();
    let sync = orchestrator(&transport);
    sync.initialize().await.unwrap();

    sync.reset_state();
    assert_eq!(sync.database().state().state(), InitState::Uninitialized);

    let report = sync.initialize().await.unwrap();
    assert!(report.migrations.unwrap().applied.is_empty());
    assert_eq!(report.scheduled.len(), 2);
}

/// Accepts operations until told the network is gone.
#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<String>>,
    offline_after: usize,
}

#[async_trait]
impl OperationSink for RecordingSink {
    async fn send(&self, operation: &QueuedOperation) -> SyncResult<()> {
        let mut sent = self.sent.lock();
        if sent.len() >= self.offline_after {
            return Err(SyncError::network("no route to host"));
        }
        sent.push(operation.op_type.clone());
        Ok(())
    }
}

#[tokio::test]
async fn offline_queue_replays_until_connectivity_drops() {
    let transport = transport_with_data();
    let sync = orchestrator(&transport);
    sync.database().initialize().await.unwrap();

    let queue = sync.database().queue();
    for op in ["rate", "wishlist", "checkin"] {
        queue.enqueue(op, json!({ "op": op })).await.unwrap();
    }

    let sink = RecordingSink {
        offline_after: 1,
        ..Default::default()
    };
    let report = sync.replay_offline_queue(&sink).await.unwrap();

    assert_eq!(report.replayed, 1);
    assert_eq!(report.failed, 1);
    assert!(report.stopped_early);
    assert_eq!(*sink.sent.lock(), vec!["rate".to_string()]);

    let pending = queue.pending(10).unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].op_type, "wishlist");
    assert_eq!(pending[0].retry_count, 1);
    assert_eq!(pending[1].retry_count, 0);
}
