use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use regex::Regex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::backend::CacheBackend;
use crate::error::{CascadeError, CascadeResult, ErrorKind};
use crate::recovery::RecoveryExecutor;
use crate::registry::{canonical_json, QueryRegistry};
use crate::types::{InvalidationScope, InvalidationStrategy, QueryInvalidation, QUERY_TYPENAME};

/// What one invalidation directive did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationOutcome {
    pub query_name: String,
    pub strategy: InvalidationStrategy,
    pub matched: Vec<String>,
    /// Matched queries whose refetch failed; they remain stale.
    pub failed: Vec<String>,
}

/// Resolves invalidation directives against the query registry and carries
/// out their strategy.
pub struct InvalidationMatcher {
    registry: QueryRegistry,
    backend: Arc<dyn CacheBackend>,
    patterns: DashMap<String, Regex>,
    refetch_semaphore: Arc<Semaphore>,
    recovery: RecoveryExecutor,
}

impl InvalidationMatcher {
    pub fn new(
        registry: QueryRegistry,
        backend: Arc<dyn CacheBackend>,
        refetch_concurrency: usize,
        recovery: RecoveryExecutor,
    ) -> Self {
        Self {
            registry,
            backend,
            patterns: DashMap::new(),
            refetch_semaphore: Arc::new(Semaphore::new(refetch_concurrency.max(1))),
            recovery,
        }
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    /// Number of distinct compiled patterns held in the cache.
    pub fn compiled_patterns(&self) -> usize {
        self.patterns.len()
    }

    fn compiled(&self, pattern: &str) -> CascadeResult<Regex> {
        if let Some(re) = self.patterns.get(pattern) {
            return Ok(re.value().clone());
        }

        let re = Regex::new(pattern).map_err(|e| {
            CascadeError::new(
                ErrorKind::InvalidPayload,
                format!("invalid invalidation pattern {pattern:?}"),
            )
            .with_source(e)
        })?;
        self.patterns.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    /// Active registry entries selected by the directive's scope (and
    /// arguments, when present), sorted by name.
    pub fn matching_queries(&self, invalidation: &QueryInvalidation) -> CascadeResult<Vec<String>> {
        let candidates = self.registry.active_names();
        let name = invalidation.query_name.as_str();

        let mut matched: Vec<String> = match invalidation.scope {
            InvalidationScope::Exact => candidates
                .into_iter()
                .filter(|key| &**key == name)
                .map(|key| key.to_string())
                .collect(),
            InvalidationScope::Prefix => candidates
                .into_iter()
                .filter(|key| key.starts_with(name))
                .map(|key| key.to_string())
                .collect(),
            InvalidationScope::Pattern => {
                let re = self.compiled(invalidation.pattern.as_deref().unwrap_or(name))?;
                candidates
                    .into_iter()
                    .filter(|key| re.is_match(key))
                    .map(|key| key.to_string())
                    .collect()
            }
            InvalidationScope::All => candidates.into_iter().map(|key| key.to_string()).collect(),
        };

        if let Some(arguments) = &invalidation.arguments {
            let canonical = canonical_json(arguments)?;
            matched.retain(|key| self.registry.variables_match(key, &canonical));
        }

        Ok(matched)
    }

    /// Matches the directive and applies its strategy to every match.
    pub async fn dispatch(&self, invalidation: &QueryInvalidation) -> CascadeResult<InvalidationOutcome> {
        let matched = self.matching_queries(invalidation)?;
        let mut outcome = InvalidationOutcome {
            query_name: invalidation.query_name.clone(),
            strategy: invalidation.strategy,
            matched: matched.clone(),
            failed: Vec::new(),
        };

        if matched.is_empty() {
            debug!(
                query = %invalidation.query_name,
                scope = ?invalidation.scope,
                "invalidation matched no tracked queries"
            );
            return Ok(outcome);
        }

        match invalidation.strategy {
            InvalidationStrategy::Invalidate => {
                for name in &matched {
                    self.registry.mark_stale(name);
                }
                debug!(count = matched.len(), "queries marked stale");
            }
            InvalidationStrategy::Refetch => {
                outcome.failed = self.refetch_all(&matched).await;
            }
            InvalidationStrategy::Remove => {
                for name in &matched {
                    self.registry.unregister(name);
                    self.backend.evict(QUERY_TYPENAME, name)?;
                }
                debug!(count = matched.len(), "queries removed");
            }
        }

        Ok(outcome)
    }

    async fn refetch_all(&self, names: &[String]) -> Vec<String> {
        for name in names {
            self.registry.mark_stale(name);
        }

        let results = join_all(names.iter().map(|name| async move {
            (name, self.refetch_single(name).await)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(name, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(query = %name, error = %e, "failed to refetch query");
                    Some(name.clone())
                }
            })
            .collect()
    }

    async fn refetch_single(&self, name: &str) -> CascadeResult<()> {
        self.registry
            .with_refresh_lock(name, || async {
                let Some(query) = self.registry.query(name) else {
                    return Ok(());
                };
                let Some(fetcher) = query.fetcher.clone() else {
                    debug!(query = %name, "no fetcher registered, left stale");
                    return Ok(());
                };

                let _permit = self.refetch_semaphore.acquire().await.map_err(|e| {
                    CascadeError::new(ErrorKind::Network, "refetch semaphore closed").with_source(e)
                })?;

                let data = self
                    .recovery
                    .execute(|| async {
                        fetcher
                            .fetch(&query.definition, &query.variables)
                            .await
                            .map_err(|e| CascadeError::from(e).with_query(name))
                    })
                    .await?;

                self.backend.write(QUERY_TYPENAME, name, &data)?;
                self.registry.store_result(name, data);
                debug!(query = %name, "query refetched");
                Ok::<(), CascadeError>(())
            })
            .await
    }
}
