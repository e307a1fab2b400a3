use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::backend::CacheBackend;
use crate::error::{CascadeError, CascadeResult, ErrorBoundary};
use crate::invalidation::{InvalidationMatcher, InvalidationOutcome};
use crate::types::{CascadePayload, UpdatedEntity};

/// Notified after every cascade the applier processes.
pub trait CascadeObserver: Send + Sync {
    fn on_cascade(&self, payload: &CascadePayload, applied: bool);
}

pub type WriteListener = Arc<dyn Fn(&UpdatedEntity) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub written: usize,
    pub evicted: usize,
    pub invalidations: Vec<InvalidationOutcome>,
}

/// Applies cascade payloads to the cache backend.
///
/// Order is fixed: every `updated` entity is written (in payload order),
/// then every `deleted` entity is evicted, then invalidations run. A query
/// refetched by step three therefore sees the already-written entities.
pub struct CascadeApplier {
    backend: Arc<dyn CacheBackend>,
    matcher: Arc<InvalidationMatcher>,
    write_listeners: RwLock<Vec<WriteListener>>,
    observers: RwLock<Vec<Arc<dyn CascadeObserver>>>,
}

impl CascadeApplier {
    pub fn new(backend: Arc<dyn CacheBackend>, matcher: Arc<InvalidationMatcher>) -> Self {
        Self {
            backend,
            matcher,
            write_listeners: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn matcher(&self) -> &Arc<InvalidationMatcher> {
        &self.matcher
    }

    /// Registers a callback invoked after each successful entity write.
    pub fn on_write(&self, listener: impl Fn(&UpdatedEntity) + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.write_listeners.write() {
            listeners.push(Arc::new(listener));
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn CascadeObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    /// Applies one payload. Per-entity failures don't stop the remaining
    /// steps; they are reported together once the payload has been processed.
    pub async fn apply(&self, payload: &CascadePayload) -> CascadeResult<ApplyReport> {
        payload.validate()?;
        let result = self.apply_entities(payload).await;
        self.notify(payload, result.is_ok());
        result
    }

    /// Same as [`apply`](Self::apply) but observers are not told. Used for
    /// speculative writes that may still be rolled back.
    pub(crate) async fn apply_unobserved(&self, payload: &CascadePayload) -> CascadeResult<ApplyReport> {
        payload.validate()?;
        self.apply_entities(payload).await
    }

    async fn apply_entities(&self, payload: &CascadePayload) -> CascadeResult<ApplyReport> {
        let mut boundary = ErrorBoundary::new();
        let mut report = ApplyReport::default();

        for update in &payload.updated {
            match self.write_entity(update) {
                Ok(()) => report.written += 1,
                Err(e) => boundary.push(e),
            }
        }

        for deleted in &payload.deleted {
            match self.backend.evict(&deleted.typename, &deleted.id) {
                Ok(()) => report.evicted += 1,
                Err(e) => boundary.push(CascadeError::from(e)),
            }
        }

        for invalidation in &payload.invalidations {
            if let Some(outcome) = boundary.capture(self.matcher.dispatch(invalidation).await) {
                report.invalidations.push(outcome);
            }
        }

        debug!(
            written = report.written,
            evicted = report.evicted,
            invalidations = report.invalidations.len(),
            errors = boundary.len(),
            "cascade applied"
        );

        boundary.into_result().map(|()| report)
    }

    fn write_entity(&self, update: &UpdatedEntity) -> CascadeResult<()> {
        self.backend
            .write(&update.typename, &update.id, &update.entity)?;

        if let Ok(listeners) = self.write_listeners.read() {
            for listener in listeners.iter() {
                listener(update);
            }
        }
        Ok(())
    }

    fn notify(&self, payload: &CascadePayload, applied: bool) {
        let observers = match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(_) => return,
        };
        for observer in observers {
            observer.on_cascade(payload, applied);
        }
    }
}
