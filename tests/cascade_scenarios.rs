use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cascade_sync::fetch::{FetchError, QueryFetcher, TransportError};
use cascade_sync::persistence::MemoryStorage;
use cascade_sync::router::SubscriptionState;
use cascade_sync::{
    CacheBackend, CascadeEngine, CascadePayload, EngineConfig, EntityOperation, ErrorKind,
    InMemoryBackend, QueryInvalidation, SubscriptionOptions, TrackedQuery, UpdatedEntity,
};
use cascade_sync::types::{InvalidationScope, InvalidationStrategy};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn quiet_config() -> EngineConfig {
    EngineConfig {
        persist_on_change: false,
        retry_base_delay_ms: 1,
        ..EngineConfig::default()
    }
}

fn todo(id: &str, title: &str) -> UpdatedEntity {
    UpdatedEntity::new("Todo", id, EntityOperation::Update, json!({ "id": id, "title": title }))
}

async fn settle(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn mutation_response_writes_entity_and_marks_query_stale() {
    init_tracing();
    let backend = Arc::new(InMemoryBackend::new());
    let engine = CascadeEngine::initialize(quiet_config(), backend.clone(), None);
    engine.register_query(TrackedQuery::new("listTodos", "query { todos { id } }")).unwrap();

    let response = json!({
        "data": { "createTodo": { "id": "1" } },
        "extensions": { "cascade": {
            "updated": [{
                "__typename": "Todo",
                "id": "1",
                "operation": "CREATE",
                "entity": { "id": "1", "title": "Buy milk", "completed": false }
            }],
            "deleted": [],
            "invalidations": [{ "queryName": "listTodos", "strategy": "INVALIDATE", "scope": "EXACT" }],
            "metadata": { "timestamp": "t0", "depth": 1, "affectedCount": 1 }
        }}
    });
    engine.apply_response(&response).await.unwrap();

    assert_eq!(
        backend.read("Todo", "1").unwrap(),
        Some(json!({ "id": "1", "title": "Buy milk", "completed": false }))
    );
    assert_eq!(engine.registry().is_stale("listTodos"), Some(true));
}

#[tokio::test]
async fn response_without_cascade_is_missing_payload() {
    let engine = CascadeEngine::initialize(quiet_config(), Arc::new(InMemoryBackend::new()), None);
    let err = engine
        .apply_response(&json!({ "data": { "ok": true } }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingPayload);
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn optimistic_rollback_restores_original() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.write("Todo", "1", &json!({ "id": "1", "title": "Original" })).unwrap();
    let engine = CascadeEngine::initialize(quiet_config(), backend.clone(), None);

    let mut update = engine
        .optimistic()
        .apply_optimistic(CascadePayload::new(vec![todo("1", "Optimistic")], vec![], vec![]))
        .await
        .unwrap();
    assert_eq!(backend.read("Todo", "1").unwrap().unwrap()["title"], "Optimistic");

    update.rollback().unwrap();
    assert_eq!(
        backend.read("Todo", "1").unwrap(),
        Some(json!({ "id": "1", "title": "Original" }))
    );
}

#[tokio::test]
async fn optimistic_rollback_of_new_entity_evicts() {
    let backend = Arc::new(InMemoryBackend::new());
    let engine = CascadeEngine::initialize(quiet_config(), backend.clone(), None);

    let mut update = engine
        .optimistic()
        .apply_optimistic(CascadePayload::new(vec![todo("1", "Optimistic")], vec![], vec![]))
        .await
        .unwrap();
    assert_eq!(update.records()[0].previous_data, None);

    update.rollback().unwrap();
    assert_eq!(backend.read("Todo", "1").unwrap(), None);
}

#[tokio::test]
async fn failed_mutation_leaves_cache_untouched() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.write("Todo", "1", &json!({ "id": "1", "title": "Original" })).unwrap();
    let engine = CascadeEngine::initialize(quiet_config(), backend.clone(), None);

    let err = engine
        .mutate(
            CascadePayload::new(vec![todo("1", "Optimistic")], vec![], vec![]),
            async { Err(cascade_sync::CascadeError::new(ErrorKind::Network, "offline")) },
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(backend.read("Todo", "1").unwrap().unwrap()["title"], "Original");
}

#[tokio::test]
async fn paused_subscription_ignores_burst_then_resumes() {
    init_tracing();
    let backend = Arc::new(InMemoryBackend::new());
    let engine = CascadeEngine::initialize(quiet_config(), backend.clone(), None);

    let (tx, rx) = mpsc::channel::<Result<Value, TransportError>>(32);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handle = engine.subscribe(
        ReceiverStream::new(rx),
        SubscriptionOptions::new().on_cascade(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    handle.pause();
    for i in 0..10 {
        let event = json!({ "data": { "todoChanged": { "__typename": "Todo", "id": i.to_string() } } });
        tx.send(Ok(event)).await.unwrap();
    }
    settle(|| handle.stats().received == 10).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(backend.is_empty());

    handle.resume();
    tx.send(Ok(json!({ "data": { "todoChanged": { "__typename": "Todo", "id": "live" } } })))
        .await
        .unwrap();
    settle(|| calls.load(Ordering::SeqCst) == 1).await;
    assert!(backend.contains("Todo", "live"));

    tx.send(Err(TransportError::terminal("server closed"))).await.unwrap();
    settle(|| handle.state() == SubscriptionState::Unsubscribed).await;
    assert_eq!(engine.router().active_count(), 0);
}

#[tokio::test]
async fn restore_returns_snapshot_not_intermediate_state() {
    init_tracing();
    let backend = Arc::new(InMemoryBackend::new());
    let storage = Arc::new(MemoryStorage::new());
    let engine = CascadeEngine::initialize(quiet_config(), backend.clone(), Some(storage));

    engine
        .apply(&CascadePayload::new(vec![todo("1", "persisted")], vec![], vec![]))
        .await
        .unwrap();
    let persistence = engine.persistence().unwrap();
    persistence.persist().await.unwrap();

    backend.write("Todo", "1", &json!({ "id": "1", "title": "intermediate" })).unwrap();
    backend.write("Todo", "2", &json!({ "id": "2" })).unwrap();

    assert!(engine.restore().await.unwrap());
    assert_eq!(backend.read("Todo", "1").unwrap().unwrap()["title"], "persisted");
    assert!(!backend.contains("Todo", "2"));
    assert_eq!(persistence.history().len(), 1);
}

struct FlakyFetcher {
    calls: AtomicUsize,
    results: Mutex<Vec<Value>>,
}

#[async_trait]
impl QueryFetcher for FlakyFetcher {
    async fn fetch(&self, _definition: &str, variables: &Value) -> Result<Value, FetchError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(FetchError::Stream("connection reset".into()));
        }
        self.results.lock().unwrap().push(variables.clone());
        Ok(json!({ "todos": [{ "id": "1" }] }))
    }
}

#[tokio::test]
async fn refetch_invalidation_retries_and_stores_result() {
    let backend = Arc::new(InMemoryBackend::new());
    let engine = CascadeEngine::initialize(quiet_config(), backend.clone(), None);
    let fetcher = Arc::new(FlakyFetcher {
        calls: AtomicUsize::new(0),
        results: Mutex::new(Vec::new()),
    });
    engine
        .register_query(
            TrackedQuery::new("listTodos", "query { todos { id } }")
                .with_variables(json!({ "first": 10 }))
                .with_fetcher(fetcher.clone()),
        )
        .unwrap();
    engine
        .register_query(TrackedQuery::new("viewer", "query { viewer { id } }"))
        .unwrap();

    let report = engine
        .apply(&CascadePayload::new(
            vec![],
            vec![],
            vec![QueryInvalidation::new(
                "list",
                InvalidationStrategy::Refetch,
                InvalidationScope::Prefix,
            )],
        ))
        .await
        .unwrap();

    assert_eq!(report.invalidations[0].matched, vec!["listTodos"]);
    assert!(report.invalidations[0].failed.is_empty());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(*fetcher.results.lock().unwrap(), vec![json!({ "first": 10 })]);
    assert_eq!(engine.registry().is_stale("listTodos"), Some(false));
    assert_eq!(engine.registry().is_stale("viewer"), Some(false));
    assert!(backend.contains("Query", "listTodos"));
}

#[tokio::test]
async fn rejected_server_cascade_restores_original() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.write("Todo", "1", &json!({ "id": "1", "title": "Original" })).unwrap();
    let engine = CascadeEngine::initialize(quiet_config(), backend.clone(), None);

    let mut server = CascadePayload::new(vec![todo("1", "Server")], vec![], vec![]);
    server.metadata.affected_count = 7;
    let err = tokio_test::assert_err!(
        engine
            .mutate(
                CascadePayload::new(vec![todo("1", "Optimistic")], vec![], vec![]),
                async { Ok(server) },
            )
            .await
    );

    assert_eq!(err.kind(), ErrorKind::InvalidPayload);
    assert_eq!(backend.read("Todo", "1").unwrap().unwrap()["title"], "Original");
}

#[tokio::test]
async fn rolled_back_writes_never_enter_history() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.write("Todo", "1", &json!({ "id": "1", "title": "Original" })).unwrap();
    let engine = CascadeEngine::initialize(
        quiet_config(),
        backend.clone(),
        Some(Arc::new(MemoryStorage::new())),
    );
    let persistence = engine.persistence().unwrap().clone();

    let mut update = engine
        .optimistic()
        .apply_optimistic(CascadePayload::new(vec![todo("1", "Optimistic")], vec![], vec![]))
        .await
        .unwrap();
    update.rollback().unwrap();
    assert!(persistence.history().is_empty());

    let replayed = persistence
        .replay(0, |payload| {
            let engine = engine.clone();
            async move { engine.apply(&payload).await.map(|_| ()) }
        })
        .await
        .unwrap();
    assert_eq!(replayed, 0);
    assert_eq!(backend.read("Todo", "1").unwrap().unwrap()["title"], "Original");

    engine
        .mutate(
            CascadePayload::new(vec![todo("1", "Optimistic")], vec![], vec![]),
            async { Ok(CascadePayload::new(vec![todo("1", "Server")], vec![], vec![])) },
        )
        .await
        .unwrap();
    let history = persistence.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].cascade.updated[0].entity["title"], "Server");
    assert!(history[0].applied);
}
