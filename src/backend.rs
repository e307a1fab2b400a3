use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::EntityRef;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("write failed for {entity}: {reason}")]
    Write { entity: EntityRef, reason: String },
    #[error("read failed for {entity}: {reason}")]
    Read { entity: EntityRef, reason: String },
    #[error("evict failed for {entity}: {reason}")]
    Evict { entity: EntityRef, reason: String },
    #[error("cannot identify entity: {0}")]
    Unidentifiable(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Storage primitives the engine issues against the local cache.
///
/// Implementations may be a normalized `(typename, id)` store or a per-query
/// document cache; the engine only ever calls these four operations.
pub trait CacheBackend: Send + Sync {
    fn write(&self, typename: &str, id: &str, data: &Value) -> BackendResult<()>;

    fn read(&self, typename: &str, id: &str) -> BackendResult<Option<Value>>;

    /// Evicting an absent entity is a no-op.
    fn evict(&self, typename: &str, id: &str) -> BackendResult<()>;

    /// Canonical storage key for a raw entity object.
    fn identify(&self, entity: &Value) -> BackendResult<String> {
        identify_entity(entity)
            .map(|r| r.to_string())
            .ok_or_else(|| BackendError::Unidentifiable(entity.to_string()))
    }
}

/// Whole-cache access used by persistence to snapshot and restore state.
pub trait SnapshotBackend: CacheBackend {
    fn entries(&self) -> Vec<StoredEntity>;

    fn clear(&self);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub typename: String,
    pub id: String,
    pub data: Value,
}

/// Reads `__typename` and `id` from an entity object. Numeric ids are
/// accepted and rendered as strings.
pub fn identify_entity(entity: &Value) -> Option<EntityRef> {
    let typename = entity.get("__typename")?.as_str()?;
    let id = match entity.get("id")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(EntityRef::new(typename, id))
}

/// Normalized in-memory backend keyed by `(typename, id)`.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    entities: Arc<DashMap<EntityRef, Value>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, typename: &str, id: &str) -> bool {
        self.entities.contains_key(&EntityRef::new(typename, id))
    }
}

impl CacheBackend for InMemoryBackend {
    fn write(&self, typename: &str, id: &str, data: &Value) -> BackendResult<()> {
        self.entities
            .insert(EntityRef::new(typename, id), data.clone());
        Ok(())
    }

    fn read(&self, typename: &str, id: &str) -> BackendResult<Option<Value>> {
        Ok(self
            .entities
            .get(&EntityRef::new(typename, id))
            .map(|entry| entry.value().clone()))
    }

    fn evict(&self, typename: &str, id: &str) -> BackendResult<()> {
        self.entities.remove(&EntityRef::new(typename, id));
        Ok(())
    }
}

impl SnapshotBackend for InMemoryBackend {
    fn entries(&self) -> Vec<StoredEntity> {
        let mut entries: Vec<StoredEntity> = self
            .entities
            .iter()
            .map(|entry| StoredEntity {
                typename: entry.key().typename.clone(),
                id: entry.key().id.clone(),
                data: entry.value().clone(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.typename, &a.id).cmp(&(&b.typename, &b.id)));
        entries
    }

    fn clear(&self) {
        self.entities.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn write_read_evict() {
        let backend = InMemoryBackend::new();
        backend
            .write("Todo", "1", &json!({ "id": "1", "title": "a" }))
            .unwrap();
        assert_eq!(
            backend.read("Todo", "1").unwrap(),
            Some(json!({ "id": "1", "title": "a" }))
        );

        backend
            .write("Todo", "1", &json!({ "id": "1", "title": "b" }))
            .unwrap();
        assert_eq!(backend.read("Todo", "1").unwrap().unwrap()["title"], "b");
        assert_eq!(backend.len(), 1);

        backend.evict("Todo", "1").unwrap();
        assert_eq!(backend.read("Todo", "1").unwrap(), None);
        backend.evict("Todo", "1").unwrap();
        assert!(backend.is_empty());
    }

    #[test]
    fn identify_uses_typename_and_id() {
        let backend = InMemoryBackend::new();
        assert_eq!(
            backend
                .identify(&json!({ "__typename": "Todo", "id": "9" }))
                .unwrap(),
            "Todo:9"
        );
        assert_eq!(
            backend
                .identify(&json!({ "__typename": "User", "id": 42 }))
                .unwrap(),
            "User:42"
        );
        assert!(matches!(
            backend.identify(&json!({ "id": "1" })),
            Err(BackendError::Unidentifiable(_))
        ));
    }

    #[test]
    fn entries_are_sorted_and_clear_empties() {
        let backend = InMemoryBackend::new();
        backend.write("User", "2", &json!({})).unwrap();
        backend.write("Todo", "1", &json!({})).unwrap();

        let keys: Vec<_> = backend
            .entries()
            .into_iter()
            .map(|e| format!("{}:{}", e.typename, e.id))
            .collect();
        assert_eq!(keys, vec!["Todo:1", "User:2"]);

        backend.clear();
        assert!(backend.is_empty());
    }
}
