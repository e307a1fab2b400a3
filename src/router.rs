//! Subscription-driven cascade delivery.
//!
//! Each [`SubscriptionHandle`] wraps one long-lived event source and runs
//! as its own task. The router keeps only weak references to handles so it
//! can pause, resume or end all of them at once without keeping any alive.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::applier::CascadeApplier;
use crate::backend::identify_entity;
use crate::error::{CascadeError, CascadeResult, ErrorKind};
use crate::fetch::{EventSource, TransportError};
use crate::types::{CascadeEventType, CascadePayload, EntityOperation, UpdatedEntity};

pub type SubscriptionId = Uuid;

pub type CascadeCallback = Arc<dyn Fn(&CascadeEvent) -> anyhow::Result<()> + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&CascadeError) + Send + Sync>;
pub type EventFilter = Arc<dyn Fn(&CascadeEvent) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct CascadeEvent {
    pub subscription_id: SubscriptionId,
    pub event_type: CascadeEventType,
    pub payload: CascadePayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
    Active = 0,
    Paused = 1,
    Unsubscribed = 2,
}

impl SubscriptionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscriptionState::Active,
            1 => SubscriptionState::Paused,
            _ => SubscriptionState::Unsubscribed,
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionOptions {
    pub auto_apply: bool,
    filter: Option<EventFilter>,
    on_cascade: Option<CascadeCallback>,
    on_error: Option<ErrorCallback>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            auto_apply: true,
            filter: None,
            on_cascade: None,
            on_error: None,
        }
    }
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_apply(mut self, auto_apply: bool) -> Self {
        self.auto_apply = auto_apply;
        self
    }

    pub fn filter(mut self, filter: impl Fn(&CascadeEvent) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Only deliver events of the given types.
    pub fn event_types(self, types: &[CascadeEventType]) -> Self {
        let types = types.to_vec();
        self.filter(move |event| types.contains(&event.event_type))
    }

    pub fn on_cascade(
        mut self,
        callback: impl Fn(&CascadeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_cascade = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&CascadeError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub received: u64,
    pub delivered: u64,
    pub dropped: u64,
}

struct HandleShared {
    id: SubscriptionId,
    state: AtomicU8,
    cancel: CancellationToken,
    received: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl HandleShared {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: AtomicU8::new(SubscriptionState::Active as u8),
            cancel: CancellationToken::new(),
            received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: SubscriptionState, to: SubscriptionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Moves to the terminal state. Returns false if already there.
    fn terminate(&self) -> bool {
        let previous = self
            .state
            .swap(SubscriptionState::Unsubscribed as u8, Ordering::SeqCst);
        self.cancel.cancel();
        previous != SubscriptionState::Unsubscribed as u8
    }

    fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

type HandleRegistry = Arc<DashMap<SubscriptionId, Weak<HandleShared>>>;

/// Caller-owned subscription. Dropping it unsubscribes.
pub struct SubscriptionHandle {
    shared: Arc<HandleShared>,
    registry: HandleRegistry,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// Paused handles drop incoming events; nothing is queued for later.
    pub fn pause(&self) -> bool {
        self.shared
            .transition(SubscriptionState::Active, SubscriptionState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.shared
            .transition(SubscriptionState::Paused, SubscriptionState::Active)
    }

    pub fn unsubscribe(&self) {
        if self.shared.terminate() {
            debug!(subscription_id = %self.shared.id, "unsubscribed");
        }
        self.registry.remove(&self.shared.id);
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.shared.stats()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Locates a cascade inside a subscription event.
///
/// Looks at `extensions.cascade` first, then a `cascade` object in `data`
/// (directly or one field down), and finally treats the first object in
/// `data` carrying `__typename` and `id` as a single-entity update.
pub fn extract_cascade(event: &Value) -> CascadeResult<Option<CascadePayload>> {
    if let Some(cascade) = event.pointer("/extensions/cascade").filter(|c| !c.is_null()) {
        return CascadePayload::from_wire(cascade).map(Some);
    }

    let data = event.get("data").unwrap_or(event);
    let Some(fields) = data.as_object() else {
        return Ok(None);
    };

    if let Some(cascade) = fields.get("cascade").filter(|c| c.is_object()) {
        return CascadePayload::from_wire(cascade).map(Some);
    }
    for value in fields.values() {
        if let Some(cascade) = value.get("cascade").filter(|c| c.is_object()) {
            return CascadePayload::from_wire(cascade).map(Some);
        }
    }

    let inferred = std::iter::once(data)
        .chain(fields.values())
        .find_map(|candidate| identify_entity(candidate).map(|entity| (entity, candidate)));

    Ok(inferred.map(|(entity, candidate)| {
        CascadePayload::new(
            vec![UpdatedEntity::new(
                entity.typename,
                entity.id,
                EntityOperation::Update,
                candidate.clone(),
            )],
            vec![],
            vec![],
        )
    }))
}

/// Routes server-pushed events from many concurrent sources into the applier.
#[derive(Clone)]
pub struct SubscriptionRouter {
    applier: Arc<CascadeApplier>,
    handles: HandleRegistry,
}

impl SubscriptionRouter {
    pub fn new(applier: Arc<CascadeApplier>) -> Self {
        Self {
            applier,
            handles: Arc::new(DashMap::new()),
        }
    }

    /// Starts consuming `source`. Must be called within a tokio runtime.
    pub fn subscribe<S>(&self, source: S, options: SubscriptionOptions) -> SubscriptionHandle
    where
        S: Stream<Item = Result<Value, TransportError>> + Send + 'static,
    {
        let shared = Arc::new(HandleShared::new());
        self.handles.insert(shared.id, Arc::downgrade(&shared));

        let task = SubscriptionTask {
            shared: shared.clone(),
            applier: self.applier.clone(),
            registry: self.handles.clone(),
            options,
        };
        tokio::spawn(task.run(source.boxed()));

        debug!(subscription_id = %shared.id, "subscription registered");
        SubscriptionHandle {
            shared,
            registry: self.handles.clone(),
        }
    }

    fn live_handles(&self) -> Vec<Arc<HandleShared>> {
        self.handles.retain(|_, weak| weak.strong_count() > 0);
        self.handles
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    pub fn pause_all(&self) -> usize {
        self.live_handles()
            .iter()
            .filter(|h| h.transition(SubscriptionState::Active, SubscriptionState::Paused))
            .count()
    }

    pub fn resume_all(&self) -> usize {
        self.live_handles()
            .iter()
            .filter(|h| h.transition(SubscriptionState::Paused, SubscriptionState::Active))
            .count()
    }

    pub fn unsubscribe_all(&self) -> usize {
        let count = self
            .live_handles()
            .iter()
            .filter(|h| h.terminate())
            .count();
        self.handles.clear();
        debug!(count, "all subscriptions ended");
        count
    }

    /// Handles that have not reached the terminal state.
    pub fn active_count(&self) -> usize {
        self.live_handles()
            .iter()
            .filter(|h| h.state() != SubscriptionState::Unsubscribed)
            .count()
    }
}

struct SubscriptionTask {
    shared: Arc<HandleShared>,
    applier: Arc<CascadeApplier>,
    registry: HandleRegistry,
    options: SubscriptionOptions,
}

impl SubscriptionTask {
    async fn run(self, mut source: EventSource) {
        let id = self.shared.id;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => break,
                next = source.next() => next,
            };

            match next {
                None => {
                    debug!(subscription_id = %id, "event source completed");
                    break;
                }
                Some(Err(e)) if e.terminal => {
                    self.report(CascadeError::from(e));
                    break;
                }
                Some(Err(e)) => self.report(CascadeError::from(e)),
                Some(Ok(event)) => {
                    if self.shared.state() == SubscriptionState::Unsubscribed {
                        break;
                    }
                    self.handle_event(&event).await;
                }
            }
        }

        self.shared.terminate();
        self.registry.remove(&id);
        debug!(subscription_id = %id, "subscription closed");
    }

    async fn handle_event(&self, event: &Value) {
        self.shared.received.fetch_add(1, Ordering::Relaxed);

        // Paused handles ignore events entirely, malformed ones included.
        if self.shared.state() == SubscriptionState::Paused {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let payload = match extract_cascade(event) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                self.report(e);
                return;
            }
        };

        let event = CascadeEvent {
            subscription_id: self.shared.id,
            event_type: payload.event_type(),
            payload,
        };

        if let Some(filter) = &self.options.filter {
            if !filter(&event) {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if self.options.auto_apply {
            if let Err(e) = self.applier.apply(&event.payload).await {
                self.report(e);
            }
        }

        if let Some(callback) = &self.options.on_cascade {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.report(
                    CascadeError::new(ErrorKind::SubscriptionError, format!("cascade callback failed: {e}")),
                ),
                Err(_) => self.report(CascadeError::new(
                    ErrorKind::SubscriptionError,
                    "cascade callback panicked",
                )),
            }
        }

        self.shared.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self, error: CascadeError) {
        match &self.options.on_error {
            Some(callback) => callback(&error),
            None => warn!(subscription_id = %self.shared.id, error = %error, "subscription error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    use super::*;
    use crate::backend::{CacheBackend, InMemoryBackend};
    use crate::invalidation::InvalidationMatcher;
    use crate::recovery::RecoveryExecutor;
    use crate::registry::QueryRegistry;

    type Sender = mpsc::Sender<Result<Value, TransportError>>;

    fn router_over(backend: &InMemoryBackend) -> SubscriptionRouter {
        let backend: Arc<dyn CacheBackend> = Arc::new(backend.clone());
        let matcher = Arc::new(InvalidationMatcher::new(
            QueryRegistry::new(),
            backend.clone(),
            1,
            RecoveryExecutor::default(),
        ));
        SubscriptionRouter::new(Arc::new(CascadeApplier::new(backend, matcher)))
    }

    fn source() -> (Sender, ReceiverStream<Result<Value, TransportError>>) {
        let (tx, rx) = mpsc::channel(64);
        (tx, ReceiverStream::new(rx))
    }

    fn todo_event(id: &str) -> Value {
        json!({
            "data": { "todoChanged": { "id": id } },
            "extensions": { "cascade": {
                "updated": [{
                    "__typename": "Todo",
                    "id": id,
                    "operation": "UPDATE",
                    "entity": { "id": id }
                }],
                "deleted": [],
                "invalidations": [],
                "metadata": { "timestamp": "t", "depth": 1, "affectedCount": 1 }
            }}
        })
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

    fn recording() -> (SubscriptionOptions, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = SubscriptionOptions::new().on_cascade(move |event| {
            sink.lock().unwrap().push(event.payload.updated[0].id.clone());
            Ok(())
        });
        (options, seen)
    }

    #[test]
    fn extraction_prefers_extensions() {
        let event = json!({
            "data": { "cascade": { "updated": [], "deleted": [{ "__typename": "Todo", "id": "x" }] } },
            "extensions": { "cascade": {
                "updated": [{ "__typename": "Todo", "id": "1", "operation": "CREATE", "entity": {} }]
            }}
        });
        let payload = extract_cascade(&event).unwrap().unwrap();
        assert_eq!(payload.updated.len(), 1);
        assert!(payload.deleted.is_empty());
    }

    #[test]
    fn extraction_finds_nested_cascade() {
        let event = json!({
            "data": { "todoChanged": {
                "todo": { "id": "1" },
                "cascade": { "deleted": [{ "__typename": "Todo", "id": "1", "deletedAt": "now" }] }
            }}
        });
        let payload = extract_cascade(&event).unwrap().unwrap();
        assert_eq!(payload.deleted[0].id, "1");
        assert_eq!(payload.metadata.affected_count, 1);
    }

    #[test]
    fn extraction_infers_single_entity() {
        let event = json!({ "data": { "todoChanged": { "__typename": "Todo", "id": "5", "title": "x" } } });
        let payload = extract_cascade(&event).unwrap().unwrap();
        assert_eq!(payload.updated[0].entity_ref().to_string(), "Todo:5");
        assert_eq!(payload.updated[0].operation, EntityOperation::Update);
        assert_eq!(payload.updated[0].entity["title"], "x");
    }

    #[test]
    fn extraction_without_payload_is_none() {
        assert_eq!(extract_cascade(&json!({ "data": { "ping": 1 } })).unwrap(), None);
        assert_eq!(extract_cascade(&json!("heartbeat")).unwrap(), None);
    }

    #[tokio::test]
    async fn events_are_applied_and_delivered() {
        let backend = InMemoryBackend::new();
        let router = router_over(&backend);
        let (tx, rx) = source();
        let (options, seen) = recording();
        let handle = router.subscribe(rx, options);

        tx.send(Ok(todo_event("1"))).await.unwrap();
        settle(|| seen.lock().unwrap().len() == 1).await;

        assert!(backend.contains("Todo", "1"));
        assert_eq!(handle.stats().delivered, 1);
    }

    #[tokio::test]
    async fn auto_apply_off_still_delivers() {
        let backend = InMemoryBackend::new();
        let router = router_over(&backend);
        let (tx, rx) = source();
        let (options, seen) = recording();
        let _handle = router.subscribe(rx, options.auto_apply(false));

        tx.send(Ok(todo_event("1"))).await.unwrap();
        settle(|| seen.lock().unwrap().len() == 1).await;
        assert!(!backend.contains("Todo", "1"));
    }

    #[tokio::test]
    async fn paused_events_are_dropped_not_queued() {
        let backend = InMemoryBackend::new();
        let router = router_over(&backend);
        let (tx, rx) = source();
        let (options, seen) = recording();
        let handle = router.subscribe(rx, options);

        assert!(handle.pause());
        for i in 0..10 {
            tx.send(Ok(todo_event(&format!("p{i}")))).await.unwrap();
        }
        settle(|| handle.stats().received == 10).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(handle.stats().dropped, 10);

        assert!(handle.resume());
        tx.send(Ok(todo_event("after"))).await.unwrap();
        settle(|| !seen.lock().unwrap().is_empty()).await;
        assert_eq!(*seen.lock().unwrap(), vec!["after"]);
        assert!(!backend.contains("Todo", "p0"));
    }

    #[tokio::test]
    async fn malformed_cascade_is_reported_and_handle_stays_active() {
        let backend = InMemoryBackend::new();
        let router = router_over(&backend);
        let (tx, rx) = source();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let error_sink = errors.clone();
        let (options, seen) = recording();
        let handle = router.subscribe(
            rx,
            options.on_error(move |e| error_sink.lock().unwrap().push(e.kind())),
        );

        let malformed = json!({ "extensions": { "cascade": { "updated": [{ "id": 1 }] } } });
        tx.send(Ok(malformed.clone())).await.unwrap();
        settle(|| errors.lock().unwrap().len() == 1).await;
        assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::InvalidPayload]);
        assert!(handle.is_active());
        assert_eq!(handle.stats().dropped, 1);

        tx.send(Ok(todo_event("1"))).await.unwrap();
        settle(|| seen.lock().unwrap().len() == 1).await;
        assert!(backend.contains("Todo", "1"));

        // While paused even malformed events are ignored silently.
        handle.pause();
        tx.send(Ok(malformed)).await.unwrap();
        settle(|| handle.stats().received == 3).await;
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(handle.stats().dropped, 2);
    }

    #[tokio::test]
    async fn filter_skips_unwanted_types() {
        let backend = InMemoryBackend::new();
        let router = router_over(&backend);
        let (tx, rx) = source();
        let (options, seen) = recording();
        let handle = router.subscribe(
            rx,
            options.event_types(&[CascadeEventType::EntityDeleted]),
        );

        tx.send(Ok(todo_event("1"))).await.unwrap();
        settle(|| handle.stats().received == 1).await;
        assert!(seen.lock().unwrap().is_empty());
        assert!(!backend.contains("Todo", "1"));
    }

    #[tokio::test]
    async fn callback_errors_keep_subscription_active() {
        let backend = InMemoryBackend::new();
        let router = router_over(&backend);
        let (tx, rx) = source();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let error_sink = errors.clone();

        let handle = router.subscribe(
            rx,
            SubscriptionOptions::new()
                .on_cascade(|event| {
                    if event.payload.updated[0].id == "boom" {
                        panic!("callback exploded");
                    }
                    anyhow::bail!("callback rejected {}", event.payload.updated[0].id)
                })
                .on_error(move |e| error_sink.lock().unwrap().push(e.kind())),
        );

        tx.send(Ok(todo_event("1"))).await.unwrap();
        tx.send(Ok(todo_event("boom"))).await.unwrap();
        settle(|| errors.lock().unwrap().len() == 2).await;

        assert!(handle.is_active());
        assert_eq!(
            *errors.lock().unwrap(),
            vec![ErrorKind::SubscriptionError, ErrorKind::SubscriptionError]
        );
    }

    #[tokio::test]
    async fn terminal_error_unsubscribes() {
        let backend = InMemoryBackend::new();
        let router = router_over(&backend);
        let (tx, rx) = source();
        let handle = router.subscribe(rx, SubscriptionOptions::new().on_error(|_| {}));

        tx.send(Err(TransportError::transient("hiccup"))).await.unwrap();
        tx.send(Ok(todo_event("1"))).await.unwrap();
        settle(|| backend.contains("Todo", "1")).await;
        assert!(handle.is_active());

        tx.send(Err(TransportError::terminal("socket closed"))).await.unwrap();
        settle(|| handle.state() == SubscriptionState::Unsubscribed).await;
        assert_eq!(router.active_count(), 0);
    }

    #[tokio::test]
    async fn completion_unsubscribes() {
        let backend = InMemoryBackend::new();
        let router = router_over(&backend);
        let (tx, rx) = source();
        let handle = router.subscribe(rx, SubscriptionOptions::new());

        drop(tx);
        settle(|| handle.state() == SubscriptionState::Unsubscribed).await;
    }

    #[tokio::test]
    async fn handles_are_isolated() {
        let backend = InMemoryBackend::new();
        let router = router_over(&backend);
        let (tx_a, rx_a) = source();
        let (tx_b, rx_b) = source();
        let (options_a, seen_a) = recording();
        let (options_b, seen_b) = recording();
        let handle_a = router.subscribe(rx_a, options_a);
        let handle_b = router.subscribe(rx_b, options_b);

        handle_a.pause();
        tx_a.send(Ok(todo_event("a"))).await.unwrap();
        tx_b.send(Ok(todo_event("b"))).await.unwrap();
        settle(|| seen_b.lock().unwrap().len() == 1).await;
        settle(|| handle_a.stats().received == 1).await;

        assert!(seen_a.lock().unwrap().is_empty());
        assert!(handle_b.is_active());

        handle_a.unsubscribe();
        tx_b.send(Ok(todo_event("b2"))).await.unwrap();
        settle(|| seen_b.lock().unwrap().len() == 2).await;
        assert_eq!(router.active_count(), 1);
    }

    #[tokio::test]
    async fn bulk_operations() {
        let backend = InMemoryBackend::new();
        let router = router_over(&backend);
        let (_tx_a, rx_a) = source();
        let (_tx_b, rx_b) = source();
        let handle_a = router.subscribe(rx_a, SubscriptionOptions::new());
        let handle_b = router.subscribe(rx_b, SubscriptionOptions::new());

        assert_eq!(router.pause_all(), 2);
        assert_eq!(handle_a.state(), SubscriptionState::Paused);
        assert_eq!(router.resume_all(), 2);
        assert!(handle_b.is_active());

        assert_eq!(router.unsubscribe_all(), 2);
        assert_eq!(handle_a.state(), SubscriptionState::Unsubscribed);
        assert!(!handle_b.resume());
        assert_eq!(router.active_count(), 0);
    }

    #[tokio::test]
    async fn dropping_handle_deregisters() {
        let backend = InMemoryBackend::new();
        let router = router_over(&backend);
        let (_tx, rx) = source();
        let handle = router.subscribe(rx, SubscriptionOptions::new());
        assert_eq!(router.active_count(), 1);

        drop(handle);
        assert_eq!(router.active_count(), 0);
    }
}
