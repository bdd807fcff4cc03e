use super::*;
use crate::connectivity::ManualConnectivity;
use crate::store::{EntryField, now_rfc3339};
use serde_json::{Map, json};
use sqlx::sqlite::SqlitePoolOptions;
use std::time::Duration;
use wiremock::matchers::{any, body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEMP_ID: i64 = -1_700_000_000_000;

async fn make_store() -> Arc<LocalStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = LocalStore::from_pool(pool);
    store.init().await.unwrap();
    Arc::new(store)
}

async fn make_engine(
    server: &MockServer,
    online: bool,
) -> (SyncEngine<ManualConnectivity>, Arc<LocalStore>) {
    let store = make_store().await;
    let client = BackloggrClient::with_base_url(&server.uri(), "token-123").unwrap();
    let engine = SyncEngine::new(
        client,
        store.clone(),
        Arc::new(ManualConnectivity::new(online)),
    )
    .with_backoff(Backoff::new(
        Duration::from_secs(2),
        Duration::from_secs(300),
        false,
    ));
    (engine, store)
}

async fn seed_local_entry(store: &LocalStore, id: i64, status: GameStatus) {
    let mut details = Map::new();
    details.insert("name".into(), json!("The Witcher 3"));
    let entry = LibraryEntry::new_local(id, 1942, status, details, &now_rfc3339());
    store.upsert_entry(&entry).await.unwrap();
}

fn created_entry(id: i64) -> Value {
    json!({
        "data": {
            "game": {
                "id": id,
                "user_id": 7,
                "igdb_game_id": 1942,
                "status": "backlogged",
                "hours_played": "0.00",
                "added_at": "2026-10-14T09:00:00.000Z",
                "updated_at": "2026-10-14T09:00:00.000Z",
                "game_details": {"name": "The Witcher 3: Wild Hunt"}
            }
        }
    })
}

fn add_payload(local_id: i64) -> Value {
    json!({"igdb_game_id": 1942, "status": "backlogged", "local_library_id": local_id})
}

#[tokio::test]
async fn offline_pass_makes_no_calls_and_still_reports() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, false).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = engine.with_reports(tx);
    store
        .enqueue_operation(10, OperationKind::Update, &json!({"notes": "x"}))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert!(report.skipped_offline);
    assert_eq!(report.dispatched, 0);
    assert_eq!(rx.try_recv().unwrap(), report);
    assert_eq!(store.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn empty_queue_reports_an_empty_pass() {
    let server = MockServer::start().await;
    let (engine, _store) = make_engine(&server, true).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = engine.with_reports(tx);

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report, SyncReport::default());
    assert_eq!(rx.try_recv().unwrap(), SyncReport::default());
}

#[tokio::test]
async fn add_replaces_temporary_id_with_server_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/library"))
        .and(header("Authorization", "Bearer token-123"))
        .and(body_json(json!({"igdb_game_id": 1942, "status": "backlogged"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(created_entry(4821)))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    seed_local_entry(&store, TEMP_ID, GameStatus::Backlogged).await;
    store
        .enqueue_operation(TEMP_ID, OperationKind::Add, &add_payload(TEMP_ID))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(store.get_entry(TEMP_ID).await.unwrap().is_none());
    let synced = store.get_entry(4821).await.unwrap().unwrap();
    assert_eq!(synced.user_id, Some(7));
    assert_eq!(synced.title(), "The Witcher 3: Wild Hunt");
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn queued_edits_follow_the_new_id_and_survive_the_add() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/library"))
        .respond_with(ResponseTemplate::new(201).set_body_json(created_entry(4821)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/library/4821"))
        .and(body_json(json!({"status": "playing"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    seed_local_entry(&store, TEMP_ID, GameStatus::Backlogged).await;
    store
        .enqueue_operation(TEMP_ID, OperationKind::Add, &add_payload(TEMP_ID))
        .await
        .unwrap();
    store
        .edit_entry(TEMP_ID, &EntryField::Status(GameStatus::Playing))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.succeeded, 2);
    let synced = store.get_entry(4821).await.unwrap().unwrap();
    assert_eq!(synced.status, GameStatus::Playing);
    assert_eq!(synced.user_id, Some(7));
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn add_for_entry_removed_meanwhile_queues_remote_delete() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/library"))
        .respond_with(ResponseTemplate::new(201).set_body_json(created_entry(4821)))
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    store
        .enqueue_operation(TEMP_ID, OperationKind::Add, &add_payload(TEMP_ID))
        .await
        .unwrap();

    engine.sync_pending().await.unwrap();
    assert!(store.get_entry(4821).await.unwrap().is_none());
    let pending = store.list_pending_operations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OperationKind::Delete);
    assert_eq!(pending[0].library_id, 4821);
}

#[tokio::test]
async fn transient_failure_keeps_record_and_schedules_retry() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/library/10"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    let op = store
        .enqueue_operation(10, OperationKind::Update, &json!({"notes": "x"}))
        .await
        .unwrap();
    let before = now_unix();

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report.failed, 1);

    let stored = store.get_operation(op).await.unwrap().unwrap();
    assert!(!stored.dead);
    assert_eq!(stored.attempt, 1);
    let retry_at = stored.retry_at.unwrap();
    assert!(retry_at >= before + 2);
    assert!(retry_at <= now_unix() + 2);
    assert!(stored.last_error.unwrap().contains("503"));
    assert!(store.list_ready_operations(before).await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_after_header_sets_next_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/library/10"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    let op = store
        .enqueue_operation(10, OperationKind::Delete, &json!({}))
        .await
        .unwrap();
    let before = now_unix();

    engine.sync_pending().await.unwrap();
    let retry_at = store.get_operation(op).await.unwrap().unwrap().retry_at.unwrap();
    assert!(retry_at >= before + 30);
    assert!(retry_at <= now_unix() + 30);
}

#[tokio::test]
async fn failure_blocks_later_operations_of_the_same_entry_only() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/library/10"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/library/10"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/library/11"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    store
        .enqueue_operation(10, OperationKind::Update, &json!({"status": "dropped"}))
        .await
        .unwrap();
    store
        .enqueue_operation(11, OperationKind::Delete, &json!({}))
        .await
        .unwrap();
    store
        .enqueue_operation(10, OperationKind::Delete, &json!({}))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.deferred, 1);

    let pending: Vec<(i64, OperationKind)> = store
        .list_pending_operations()
        .await
        .unwrap()
        .into_iter()
        .map(|op| (op.library_id, op.kind))
        .collect();
    assert_eq!(
        pending,
        vec![(10, OperationKind::Update), (10, OperationKind::Delete)]
    );
}

#[tokio::test]
async fn rejected_operation_is_dead_lettered() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/library/10"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad status"))
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    store
        .enqueue_operation(10, OperationKind::Update, &json!({"status": "wishlist"}))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(store.pending_count().await.unwrap(), 0);
    let dead = store.list_dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].last_error.as_deref().unwrap().contains("422"));
}

#[tokio::test]
async fn malformed_add_payload_is_dead_lettered_without_a_call() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    store
        .enqueue_operation(TEMP_ID, OperationKind::Add, &json!({"status": "backlogged"}))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
}

#[tokio::test]
async fn exhausted_retries_move_operation_to_dead_letters() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/library/10"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    let engine = engine
        .with_max_attempts(2)
        .with_backoff(Backoff::new(Duration::ZERO, Duration::ZERO, false));
    let op = store
        .enqueue_operation(10, OperationKind::Update, &json!({"notes": "x"}))
        .await
        .unwrap();

    let first = engine.sync_pending().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(store.get_operation(op).await.unwrap().unwrap().attempt, 1);

    let second = engine.sync_pending().await.unwrap();
    assert_eq!(second.dead_lettered, 1);
    assert!(store.get_operation(op).await.unwrap().unwrap().dead);
}

#[tokio::test]
async fn auth_failure_halts_pass_and_leaves_record_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/library/10"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    let op = store
        .enqueue_operation(10, OperationKind::Update, &json!({"notes": "x"}))
        .await
        .unwrap();
    store
        .enqueue_operation(10, OperationKind::Update, &json!({"notes": "y"}))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert!(report.auth_required);
    assert_eq!(report.deferred, 1);
    let stored = store.get_operation(op).await.unwrap().unwrap();
    assert_eq!(stored.attempt, 0);
    assert!(!stored.dead);
    assert_eq!(store.pending_count().await.unwrap(), 2);
}

#[tokio::test]
async fn delete_of_missing_remote_entry_counts_as_done() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/library/10"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    store
        .enqueue_operation(10, OperationKind::Delete, &json!({}))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(store.pending_count().await.unwrap(), 0);
    assert_eq!(store.dead_letter_count().await.unwrap(), 0);
}

#[tokio::test]
async fn delete_of_never_synced_entry_stays_local() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    seed_local_entry(&store, -9, GameStatus::Playing).await;
    let add = store
        .enqueue_operation(-9, OperationKind::Add, &add_payload(-9))
        .await
        .unwrap();
    store.dead_letter_operation(add, "422 Unprocessable").await.unwrap();
    store
        .enqueue_operation(-9, OperationKind::Delete, &json!({}))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(store.get_entry(-9).await.unwrap().is_none());
    assert_eq!(store.pending_count().await.unwrap(), 0);
    assert_eq!(store.dead_letter_count().await.unwrap(), 0);
}

#[tokio::test]
async fn update_waits_while_its_add_is_scheduled() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    let add = store
        .enqueue_operation(-9, OperationKind::Add, &add_payload(-9))
        .await
        .unwrap();
    store
        .record_operation_failure(add, now_unix() + 600, "503 Service Unavailable")
        .await
        .unwrap();
    store
        .enqueue_operation(-9, OperationKind::Update, &json!({"notes": "x"}))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.dead_lettered, 0);
    let pending = store.list_pending_operations().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[1].attempt, 0);
}

#[tokio::test]
async fn edits_behind_a_rejected_add_are_dead_lettered_with_it() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/library"))
        .respond_with(ResponseTemplate::new(422).set_body_string("unknown game"))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    seed_local_entry(&store, TEMP_ID, GameStatus::Backlogged).await;
    store
        .enqueue_operation(TEMP_ID, OperationKind::Add, &add_payload(TEMP_ID))
        .await
        .unwrap();
    store
        .enqueue_operation(TEMP_ID, OperationKind::Update, &json!({"status": "playing"}))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report.dead_lettered, 2);
    assert_eq!(report.deferred, 0);
    assert_eq!(store.pending_count().await.unwrap(), 0);
    let dead = store.list_dead_letters().await.unwrap();
    assert_eq!(
        dead.iter().map(|op| op.kind).collect::<Vec<_>>(),
        vec![OperationKind::Add, OperationKind::Update]
    );
    assert!(dead[1].last_error.as_deref().unwrap().contains("dead-lettered ADD"));

    // Later passes leave them alone; a retry revives both in order.
    let again = engine.sync_pending().await.unwrap();
    assert_eq!(again.dispatched, 0);
    assert_eq!(store.retry_dead_letters().await.unwrap(), 2);
    assert_eq!(store.pending_count().await.unwrap(), 2);
}

#[tokio::test]
async fn update_for_unknown_temporary_id_is_dead_lettered() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    store
        .enqueue_operation(-42, OperationKind::Update, &json!({"notes": "x"}))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(store.pending_count().await.unwrap(), 0);
    let dead = store.list_dead_letters().await.unwrap();
    assert!(dead[0].last_error.as_deref().unwrap().contains("no ADD queued"));
}

#[tokio::test]
async fn update_queued_on_a_remapped_temporary_id_reaches_the_server_id() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/library/4821"))
        .and(body_json(json!({"notes": "late edit"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    seed_local_entry(&store, TEMP_ID, GameStatus::Backlogged).await;
    store.remap_entry_id(TEMP_ID, 4821).await.unwrap();
    store
        .enqueue_operation(TEMP_ID, OperationKind::Update, &json!({"notes": "late edit"}))
        .await
        .unwrap();

    let report = engine.sync_pending().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn flush_entry_only_touches_that_entry() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/library/10"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/library/11"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (engine, store) = make_engine(&server, true).await;
    store
        .enqueue_operation(10, OperationKind::Update, &json!({"notes": "x"}))
        .await
        .unwrap();
    store
        .enqueue_operation(11, OperationKind::Update, &json!({"notes": "y"}))
        .await
        .unwrap();

    let report = engine.flush_entry(10).await.unwrap();
    assert_eq!(report.succeeded, 1);
    let pending = store.list_pending_operations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].library_id, 11);
}
