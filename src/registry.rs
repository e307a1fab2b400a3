use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CascadeError, ErrorKind};
use crate::fetch::QueryFetcher;

/// A standing query as registered by the caller.
#[derive(Clone)]
pub struct TrackedQuery {
    pub name: String,
    pub definition: String,
    pub variables: Value,
    pub fetcher: Option<Arc<dyn QueryFetcher>>,
}

impl TrackedQuery {
    pub fn new(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: definition.into(),
            variables: Value::Object(Default::default()),
            fetcher: None,
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn QueryFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }
}

impl std::fmt::Debug for TrackedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedQuery")
            .field("name", &self.name)
            .field("variables", &self.variables)
            .field("has_fetcher", &self.fetcher.is_some())
            .finish()
    }
}

/// Point-in-time view of a registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub name: String,
    pub definition: String,
    pub variables: Value,
    pub active: bool,
    pub stale: bool,
    pub last_result: Option<Value>,
}

struct QueryEntry {
    query: TrackedQuery,
    variables_canonical: String,
    active: bool,
    stale: bool,
    last_result: Option<Value>,
}

/// Canonical JSON form used to compare variables with invalidation arguments.
pub fn canonical_json(value: &Value) -> Result<String, CascadeError> {
    serde_jcs::to_string(value)
        .or_else(|_| serde_json::to_string(value))
        .map_err(|e| {
            CascadeError::new(ErrorKind::InvalidPayload, "unserializable query variables")
                .with_source(e)
        })
}

/// Registry of tracked queries, owned by the caller and shared with the
/// invalidation matcher. Entries live from `register` until `unregister`
/// (or a REMOVE invalidation).
#[derive(Clone, Default)]
pub struct QueryRegistry {
    entries: Arc<DashMap<Arc<str>, QueryEntry>>,
    refresh_locks: Arc<DashMap<Arc<str>, Arc<Mutex<()>>>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a query. New registrations start active and fresh.
    pub fn register(&self, query: TrackedQuery) -> Result<(), CascadeError> {
        let variables_canonical = canonical_json(&query.variables)?;
        let name: Arc<str> = Arc::from(query.name.as_str());
        debug!(query = %name, "query registered");

        self.entries.insert(
            name,
            QueryEntry {
                query,
                variables_canonical,
                active: true,
                stale: false,
                last_result: None,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.entries.remove(name).is_some();
        self.refresh_locks.remove(name);
        if removed {
            debug!(query = %name, "query unregistered");
        }
        removed
    }

    /// Inactive entries stay registered but are skipped by invalidation.
    pub fn set_active(&self, name: &str, active: bool) -> bool {
        match self.entries.get_mut(name) {
            Some(mut entry) => {
                entry.active = active;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of active entries, sorted.
    pub fn active_names(&self) -> Vec<Arc<str>> {
        let mut names: Vec<Arc<str>> = self
            .entries
            .iter()
            .filter(|entry| entry.value().active)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn state(&self, name: &str) -> Option<QueryState> {
        self.entries.get(name).map(|entry| QueryState {
            name: entry.query.name.clone(),
            definition: entry.query.definition.clone(),
            variables: entry.query.variables.clone(),
            active: entry.active,
            stale: entry.stale,
            last_result: entry.last_result.clone(),
        })
    }

    pub fn is_stale(&self, name: &str) -> Option<bool> {
        self.entries.get(name).map(|entry| entry.stale)
    }

    pub fn mark_stale(&self, name: &str) -> bool {
        match self.entries.get_mut(name) {
            Some(mut entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Stores a fresh result and clears the stale flag.
    pub fn store_result(&self, name: &str, result: Value) -> bool {
        match self.entries.get_mut(name) {
            Some(mut entry) => {
                entry.last_result = Some(result);
                entry.stale = false;
                true
            }
            None => false,
        }
    }

    pub fn variables_match(&self, name: &str, canonical_arguments: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|entry| entry.variables_canonical == canonical_arguments)
    }

    pub fn query(&self, name: &str) -> Option<TrackedQuery> {
        self.entries.get(name).map(|entry| entry.query.clone())
    }

    /// Serializes refreshes of a single query.
    pub async fn with_refresh_lock<F, Fut, T, E>(&self, name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let lock = self
            .refresh_locks
            .entry(Arc::from(name))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let _guard = lock.lock().await;
        f().await
    }
}
