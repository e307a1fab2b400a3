use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CascadeError, ErrorKind};

/// Typename used for query results written to the backend by refetches.
pub const QUERY_TYPENAME: &str = "Query";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Identifies one cacheable object by `(typename, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "__typename")]
    pub typename: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(typename: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            typename: typename.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.typename, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityOperation {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedEntity {
    #[serde(rename = "__typename")]
    pub typename: String,
    pub id: String,
    pub operation: EntityOperation,
    pub entity: Value,
}

impl UpdatedEntity {
    pub fn new(
        typename: impl Into<String>,
        id: impl Into<String>,
        operation: EntityOperation,
        entity: Value,
    ) -> Self {
        Self {
            typename: typename.into(),
            id: id.into(),
            operation,
            entity,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.typename.as_str(), self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedEntity {
    #[serde(rename = "__typename")]
    pub typename: String,
    pub id: String,
    #[serde(default)]
    pub deleted_at: String,
}

impl DeletedEntity {
    pub fn new(typename: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            typename: typename.into(),
            id: id.into(),
            deleted_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.typename.as_str(), self.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidationStrategy {
    /// Mark stale; refetch lazily on next read.
    Invalidate,
    /// Refetch eagerly and await completion.
    Refetch,
    /// Drop from the registry and the backend.
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidationScope {
    #[default]
    Exact,
    Prefix,
    Pattern,
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryInvalidation {
    pub query_name: String,
    pub strategy: InvalidationStrategy,
    #[serde(default)]
    pub scope: InvalidationScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl QueryInvalidation {
    pub fn new(
        query_name: impl Into<String>,
        strategy: InvalidationStrategy,
        scope: InvalidationScope,
    ) -> Self {
        Self {
            query_name: query_name.into(),
            strategy,
            scope,
            pattern: None,
            arguments: None,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeMetadata {
    pub timestamp: String,
    pub depth: u32,
    pub affected_count: usize,
}

/// Entity changes and query invalidations produced by one server-side event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadePayload {
    #[serde(default)]
    pub updated: Vec<UpdatedEntity>,
    #[serde(default)]
    pub deleted: Vec<DeletedEntity>,
    #[serde(default)]
    pub invalidations: Vec<QueryInvalidation>,
    pub metadata: CascadeMetadata,
}

impl CascadePayload {
    /// Builds a payload with metadata derived from its contents.
    pub fn new(
        updated: Vec<UpdatedEntity>,
        deleted: Vec<DeletedEntity>,
        invalidations: Vec<QueryInvalidation>,
    ) -> Self {
        let affected_count = updated.len() + deleted.len();
        Self {
            updated,
            deleted,
            invalidations,
            metadata: CascadeMetadata {
                timestamp: chrono::Utc::now().to_rfc3339(),
                depth: 1,
                affected_count,
            },
        }
    }

    /// Parses a payload from its JSON wire shape. A missing `metadata`
    /// object is derived from the payload contents.
    pub fn from_wire(value: &Value) -> Result<Self, CascadeError> {
        if !value.is_object() {
            return Err(CascadeError::new(
                ErrorKind::InvalidPayload,
                "cascade payload must be a JSON object",
            ));
        }

        let mut value = value.clone();
        let has_metadata = value.get("metadata").is_some_and(Value::is_object);
        if !has_metadata {
            if let Some(obj) = value.as_object_mut() {
                obj.insert(
                    "metadata".into(),
                    serde_json::json!({ "timestamp": "", "depth": 1, "affectedCount": 0 }),
                );
            }
        }

        let mut payload: CascadePayload = serde_json::from_value(value).map_err(|e| {
            CascadeError::new(ErrorKind::InvalidPayload, "malformed cascade payload")
                .with_source(e)
        })?;

        if !has_metadata {
            payload.metadata.affected_count = payload.updated.len() + payload.deleted.len();
            payload.metadata.timestamp = chrono::Utc::now().to_rfc3339();
        }

        Ok(payload)
    }

    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty() && self.invalidations.is_empty()
    }

    /// Checks `affected_count == updated.len() + deleted.len()`.
    pub fn validate(&self) -> Result<(), CascadeError> {
        let expected = self.updated.len() + self.deleted.len();
        if self.metadata.affected_count != expected {
            return Err(CascadeError::new(
                ErrorKind::InvalidPayload,
                format!(
                    "affectedCount is {} but payload carries {} entities",
                    self.metadata.affected_count, expected
                ),
            ));
        }
        Ok(())
    }

    /// Every entity referenced by `updated` then `deleted`, in payload order.
    pub fn entity_refs(&self) -> impl Iterator<Item = EntityRef> + '_ {
        self.updated
            .iter()
            .map(UpdatedEntity::entity_ref)
            .chain(self.deleted.iter().map(DeletedEntity::entity_ref))
    }

    pub fn event_type(&self) -> CascadeEventType {
        CascadeEventType::classify(self)
    }
}

/// Event classification used by subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CascadeEventType {
    EntityUpdated,
    EntityDeleted,
    QueryInvalidated,
    BatchUpdate,
}

impl CascadeEventType {
    /// Exactly one non-empty section gives its own type; anything else is a batch.
    pub fn classify(payload: &CascadePayload) -> Self {
        let sections = [
            (!payload.updated.is_empty(), Self::EntityUpdated),
            (!payload.deleted.is_empty(), Self::EntityDeleted),
            (!payload.invalidations.is_empty(), Self::QueryInvalidated),
        ];

        let mut present = sections.iter().filter(|(non_empty, _)| *non_empty);
        match (present.next(), present.next()) {
            (Some((_, kind)), None) => *kind,
            _ => Self::BatchUpdate,
        }
    }
}

/// State of one entity captured before an optimistic write.
/// `previous_data == None` means the entity did not exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRecord {
    #[serde(rename = "__typename")]
    pub typename: String,
    pub id: String,
    pub previous_data: Option<Value>,
}

impl RollbackRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.typename.as_str(), self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeHistoryEntry {
    /// Epoch milliseconds at which the cascade was recorded.
    pub timestamp: i64,
    pub cascade: CascadePayload,
    pub applied: bool,
}
