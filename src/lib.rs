//! Client-side cascade synchronization for GraphQL entity caches.
//!
//! A cascade is the set of entity writes, deletions and query invalidations a
//! server reports for one mutation or subscription event. [`CascadeEngine`]
//! applies cascades to a [`backend::CacheBackend`], layers optimistic updates
//! with rollback on top, routes subscription events and persists history.

use std::sync::Arc;

use futures::Stream;
use serde_json::Value;
use tracing::{debug, info};

pub mod applier;
pub mod backend;
pub mod config;
pub mod conflict;
pub mod error;
pub mod fetch;
pub mod invalidation;
pub mod optimistic;
pub mod persistence;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod types;

pub use applier::{ApplyReport, CascadeApplier, CascadeObserver};
pub use backend::{CacheBackend, InMemoryBackend, SnapshotBackend};
pub use config::EngineConfig;
pub use conflict::{ConflictResolver, PendingConflict, ResolutionStrategy};
pub use error::{CascadeError, CascadeResult, ErrorKind, Severity};
pub use optimistic::{ConfirmOutcome, OptimisticManager, OptimisticUpdate};
pub use persistence::{PersistenceManager, PersistentStorage};
pub use recovery::{RecoveryAction, RecoveryExecutor, RecoveryPlanner};
pub use registry::{QueryRegistry, TrackedQuery};
pub use router::{SubscriptionHandle, SubscriptionOptions, SubscriptionRouter};
pub use types::{CascadePayload, DeletedEntity, EntityOperation, QueryInvalidation, UpdatedEntity};

use fetch::TransportError;
use invalidation::InvalidationMatcher;
use optimistic::ManualConflictHandler;

/// Builds a [`CascadeEngine`] over a concrete backend.
pub struct EngineBuilder<B> {
    config: EngineConfig,
    backend: Arc<B>,
    storage: Option<Arc<dyn PersistentStorage>>,
    manual_handler: Option<ManualConflictHandler>,
    recovery: Option<RecoveryExecutor>,
}

impl<B: SnapshotBackend + 'static> EngineBuilder<B> {
    pub fn storage(mut self, storage: Arc<dyn PersistentStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn manual_conflicts(mut self, handler: impl Fn(PendingConflict) + Send + Sync + 'static) -> Self {
        self.manual_handler = Some(Arc::new(handler));
        self
    }

    /// Replaces the executor built from the config's retry settings.
    pub fn recovery(mut self, recovery: RecoveryExecutor) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn build(self) -> Arc<CascadeEngine> {
        let config = self.config;
        let cache: Arc<dyn CacheBackend> = self.backend.clone();
        let registry = QueryRegistry::new();
        let recovery = self
            .recovery
            .unwrap_or_else(|| RecoveryExecutor::new(config.retry_policy()));

        let matcher = Arc::new(InvalidationMatcher::new(
            registry.clone(),
            cache.clone(),
            config.refetch_concurrency,
            recovery,
        ));
        let applier = Arc::new(CascadeApplier::new(cache, matcher));

        let persistence = self.storage.map(|storage| {
            let snapshots: Arc<dyn SnapshotBackend> = self.backend.clone();
            let manager = PersistenceManager::new(snapshots, storage, config.persistence_options());
            applier.add_observer(manager.clone());
            manager
        });

        let resolver = ConflictResolver::with_protected_fields(config.protected_fields.iter().cloned());
        let mut optimistic = OptimisticManager::new(applier.clone(), resolver);
        if let Some(handler) = self.manual_handler {
            optimistic = optimistic.with_manual_handler(handler);
        }

        let router = SubscriptionRouter::new(applier.clone());

        info!(
            refetch_concurrency = config.refetch_concurrency,
            conflict_strategy = ?config.conflict_strategy,
            persistence = persistence.is_some(),
            "cascade engine initialized"
        );

        Arc::new(CascadeEngine {
            config,
            registry,
            applier,
            optimistic,
            router,
            persistence,
            planner: RecoveryPlanner::new(),
        })
    }
}

/// Shared state of one synchronization engine instance.
pub struct CascadeEngine {
    config: EngineConfig,
    registry: QueryRegistry,
    applier: Arc<CascadeApplier>,
    optimistic: OptimisticManager,
    router: SubscriptionRouter,
    persistence: Option<Arc<PersistenceManager>>,
    planner: RecoveryPlanner,
}

impl CascadeEngine {
    pub fn builder<B: SnapshotBackend + 'static>(config: EngineConfig, backend: Arc<B>) -> EngineBuilder<B> {
        EngineBuilder {
            config,
            backend,
            storage: None,
            manual_handler: None,
            recovery: None,
        }
    }

    pub fn initialize<B: SnapshotBackend + 'static>(
        config: EngineConfig,
        backend: Arc<B>,
        storage: Option<Arc<dyn PersistentStorage>>,
    ) -> Arc<Self> {
        let builder = Self::builder(config, backend);
        match storage {
            Some(storage) => builder.storage(storage).build(),
            None => builder.build(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    pub fn applier(&self) -> &Arc<CascadeApplier> {
        &self.applier
    }

    pub fn optimistic(&self) -> &OptimisticManager {
        &self.optimistic
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    pub fn persistence(&self) -> Option<&Arc<PersistenceManager>> {
        self.persistence.as_ref()
    }

    pub fn planner(&self) -> &RecoveryPlanner {
        &self.planner
    }

    pub fn register_query(&self, query: TrackedQuery) -> CascadeResult<()> {
        self.registry.register(query)
    }

    pub async fn apply(&self, payload: &CascadePayload) -> CascadeResult<ApplyReport> {
        self.applier.apply(payload).await
    }

    /// Applies the cascade carried in a mutation response's
    /// `extensions.cascade` field.
    pub async fn apply_response(&self, response: &Value) -> CascadeResult<ApplyReport> {
        let cascade = response
            .pointer("/extensions/cascade")
            .filter(|c| !c.is_null())
            .ok_or_else(|| {
                CascadeError::new(ErrorKind::MissingPayload, "response carries no cascade extension")
            })?;
        let payload = CascadePayload::from_wire(cascade)?;
        self.applier.apply(&payload).await
    }

    /// Applies `optimistic` while `mutation` runs, then reconciles with the
    /// server cascade using the configured conflict strategy.
    pub async fn mutate<Fut>(&self, optimistic: CascadePayload, mutation: Fut) -> CascadeResult<ConfirmOutcome>
    where
        Fut: std::future::Future<Output = CascadeResult<CascadePayload>>,
    {
        self.optimistic
            .run(optimistic, mutation, self.config.conflict_strategy)
            .await
    }

    pub fn subscribe<S>(&self, source: S, options: SubscriptionOptions) -> SubscriptionHandle
    where
        S: Stream<Item = Result<Value, TransportError>> + Send + 'static,
    {
        self.router.subscribe(source, options)
    }

    pub fn recovery_actions(&self, error: &CascadeError) -> Vec<RecoveryAction> {
        self.planner.actions_for(error)
    }

    /// Restores persisted state if storage is configured.
    pub async fn restore(&self) -> CascadeResult<bool> {
        match &self.persistence {
            Some(persistence) => persistence.restore().await,
            None => Ok(false),
        }
    }

    /// Ends every subscription and writes a final snapshot.
    pub async fn shutdown(&self) -> CascadeResult<()> {
        let ended = self.router.unsubscribe_all();
        if let Some(persistence) = &self.persistence {
            persistence.flush().await?;
        }
        debug!(subscriptions = ended, "cascade engine shut down");
        Ok(())
    }
}
