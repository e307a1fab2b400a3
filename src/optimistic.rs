use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::applier::{ApplyReport, CascadeApplier};
use crate::backend::CacheBackend;
use crate::conflict::{ConflictDescriptor, ConflictResolver, PendingConflict, ResolutionStrategy};
use crate::error::{CascadeError, CascadeResult, ErrorKind};
use crate::types::{CascadePayload, EntityRef, RollbackRecord};

pub type ManualConflictHandler = Arc<dyn Fn(PendingConflict) + Send + Sync>;

/// Reads the current state of every entity the payload touches. Each entity
/// is captured once, at its first occurrence.
pub fn capture_rollback(
    backend: &dyn CacheBackend,
    payload: &CascadePayload,
) -> CascadeResult<Vec<RollbackRecord>> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for entity in payload.entity_refs() {
        if !seen.insert(entity.clone()) {
            continue;
        }
        let previous_data = backend.read(&entity.typename, &entity.id)?;
        records.push(RollbackRecord {
            typename: entity.typename,
            id: entity.id,
            previous_data,
        });
    }

    Ok(records)
}

/// Replays captured records in reverse: absent entities are evicted, the
/// rest are written back exactly as captured.
pub fn rollback_records(backend: &dyn CacheBackend, records: &[RollbackRecord]) -> CascadeResult<()> {
    let mut failures = Vec::new();

    for record in records.iter().rev() {
        let result = match &record.previous_data {
            None => backend.evict(&record.typename, &record.id),
            Some(data) => backend.write(&record.typename, &record.id, data),
        };
        if let Err(e) = result {
            failures.push(
                CascadeError::new(ErrorKind::OptimisticRollbackFailed, e.to_string())
                    .with_entity(record.entity_ref())
                    .with_source(e),
            );
        }
    }

    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0)),
        n => Err(CascadeError::new(
            ErrorKind::OptimisticRollbackFailed,
            format!("{n} of {} rollback writes failed", records.len()),
        )
        .with_causes(failures)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimisticState {
    Pending,
    Confirmed,
    RolledBack,
}

/// A speculative write and the records needed to undo it.
pub struct OptimisticUpdate {
    backend: Arc<dyn CacheBackend>,
    payload: CascadePayload,
    records: Vec<RollbackRecord>,
    state: OptimisticState,
}

impl OptimisticUpdate {
    pub fn payload(&self) -> &CascadePayload {
        &self.payload
    }

    pub fn records(&self) -> &[RollbackRecord] {
        &self.records
    }

    pub fn state(&self) -> OptimisticState {
        self.state
    }

    /// Restores the pre-write state. A settled update is left alone.
    pub fn rollback(&mut self) -> CascadeResult<()> {
        if self.state != OptimisticState::Pending {
            return Ok(());
        }
        rollback_records(self.backend.as_ref(), &self.records)?;
        self.state = OptimisticState::RolledBack;
        debug!(entities = self.records.len(), "optimistic update rolled back");
        Ok(())
    }
}

impl std::fmt::Debug for OptimisticUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticUpdate")
            .field("records", &self.records)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfirmOutcome {
    pub report: ApplyReport,
    pub conflicts: Vec<ConflictDescriptor>,
    /// Optimistic entities the server did not mention, restored to their
    /// prior state.
    pub reverted: usize,
}

pub struct OptimisticManager {
    applier: Arc<CascadeApplier>,
    resolver: ConflictResolver,
    manual_handler: Option<ManualConflictHandler>,
}

impl OptimisticManager {
    pub fn new(applier: Arc<CascadeApplier>, resolver: ConflictResolver) -> Self {
        Self {
            applier,
            resolver,
            manual_handler: None,
        }
    }

    pub fn with_manual_handler(mut self, handler: ManualConflictHandler) -> Self {
        self.manual_handler = Some(handler);
        self
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Captures rollback state, then writes and evicts the payload's
    /// entities. If applying fails part-way, whatever was written is undone
    /// before the error is returned.
    ///
    /// Invalidations are not run: query state has no rollback record, so it
    /// is only changed by the authoritative cascade. Observers are not told
    /// either, which keeps speculative writes out of persisted history.
    pub async fn apply_optimistic(&self, payload: CascadePayload) -> CascadeResult<OptimisticUpdate> {
        payload.validate()?;
        let backend = self.applier.backend().clone();
        let records = capture_rollback(backend.as_ref(), &payload)?;

        let entities = CascadePayload {
            invalidations: Vec::new(),
            ..payload.clone()
        };
        if let Err(err) = self.applier.apply_unobserved(&entities).await {
            rollback_records(backend.as_ref(), &records)?;
            return Err(err);
        }

        debug!(entities = records.len(), "optimistic update applied");
        Ok(OptimisticUpdate {
            backend,
            payload,
            records,
            state: OptimisticState::Pending,
        })
    }

    /// Reconciles a pending update with the authoritative cascade.
    pub async fn confirm(
        &self,
        update: &mut OptimisticUpdate,
        server: CascadePayload,
        strategy: ResolutionStrategy,
    ) -> CascadeResult<ConfirmOutcome> {
        server.validate()?;
        let mut server = server;
        let mut outcome = ConfirmOutcome::default();

        if update.state == OptimisticState::Pending {
            let speculative: HashMap<EntityRef, &Value> = update
                .payload
                .updated
                .iter()
                .map(|u| (u.entity_ref(), &u.entity))
                .collect();

            for authoritative in server.updated.iter_mut() {
                let entity = authoritative.entity_ref();
                let Some(local) = speculative.get(&entity) else {
                    continue;
                };

                let descriptor = self.resolver.detect(local, &authoritative.entity);
                if !descriptor.has_conflict {
                    continue;
                }

                debug!(%entity, conflict = ?descriptor.conflict_type, "optimistic conflict");
                authoritative.entity = match self.resolver.resolve(&descriptor, strategy) {
                    Some(resolved) => resolved,
                    None => self.await_manual(entity, descriptor.clone()).await?,
                };
                outcome.conflicts.push(descriptor);
            }

            let confirmed: HashSet<EntityRef> = server.entity_refs().collect();
            let unconfirmed: Vec<RollbackRecord> = update
                .records
                .iter()
                .filter(|r| !confirmed.contains(&r.entity_ref()))
                .cloned()
                .collect();
            rollback_records(update.backend.as_ref(), &unconfirmed)?;
            outcome.reverted = unconfirmed.len();
        }

        outcome.report = self.applier.apply(&server).await?;
        update.state = OptimisticState::Confirmed;
        Ok(outcome)
    }

    /// Applies `optimistic`, awaits the mutation, then confirms with its
    /// cascade or rolls back if it failed.
    pub async fn run<Fut>(
        &self,
        optimistic: CascadePayload,
        mutation: Fut,
        strategy: ResolutionStrategy,
    ) -> CascadeResult<ConfirmOutcome>
    where
        Fut: Future<Output = CascadeResult<CascadePayload>>,
    {
        let mut update = self.apply_optimistic(optimistic).await?;

        match mutation.await {
            Ok(server) => match self.confirm(&mut update, server, strategy).await {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    warn!(error = %err, "server cascade not applied, rolling back optimistic update");
                    update.rollback()?;
                    Err(err)
                }
            },
            Err(err) => {
                warn!(error = %err, "mutation failed, rolling back optimistic update");
                update.rollback()?;
                Err(err)
            }
        }
    }

    async fn await_manual(
        &self,
        entity: EntityRef,
        descriptor: ConflictDescriptor,
    ) -> CascadeResult<Value> {
        let Some(handler) = &self.manual_handler else {
            return Err(CascadeError::new(
                ErrorKind::CascadeConflict,
                "manual resolution requested without a handler",
            )
            .with_entity(entity));
        };

        let (pending, receiver) = PendingConflict::new(entity.clone(), descriptor);
        handler(pending);
        receiver.await.map_err(|_| {
            CascadeError::new(ErrorKind::CascadeConflict, "manual resolution abandoned")
                .with_entity(entity)
        })
    }
}
