//! Conflict detection between speculative and authoritative entity state.
//!
//! Detection and resolution are pure: nothing here touches the cache. The
//! caller writes the resolved value back through the applier.

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::types::EntityRef;

const VERSION_FIELD: &str = "version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    VersionMismatch,
    FieldConflict,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDescriptor {
    pub has_conflict: bool,
    pub conflict_type: ConflictType,
    pub local_entity: Value,
    pub server_entity: Value,
    pub conflicting_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    #[default]
    ServerWins,
    ClientWins,
    Merge,
    Manual,
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "SERVER_WINS" => Ok(Self::ServerWins),
            "CLIENT_WINS" => Ok(Self::ClientWins),
            "MERGE" => Ok(Self::Merge),
            "MANUAL" => Ok(Self::Manual),
            other => Err(format!("unknown resolution strategy: {other}")),
        }
    }
}

/// A conflict waiting on the caller under [`ResolutionStrategy::Manual`].
#[derive(Debug)]
pub struct PendingConflict {
    pub entity: EntityRef,
    pub descriptor: ConflictDescriptor,
    responder: oneshot::Sender<Value>,
}

impl PendingConflict {
    pub(crate) fn new(
        entity: EntityRef,
        descriptor: ConflictDescriptor,
    ) -> (Self, oneshot::Receiver<Value>) {
        let (responder, receiver) = oneshot::channel();
        (
            Self {
                entity,
                descriptor,
                responder,
            },
            receiver,
        )
    }

    /// Supplies the value to write. Returns false if nobody is waiting anymore.
    pub fn resolve(self, value: Value) -> bool {
        self.responder.send(value).is_ok()
    }
}

/// Numeric value of the `version` field, accepting numeric strings.
fn version_of(record: &Value) -> Option<f64> {
    match record.get(VERSION_FIELD)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn divergent_fields(local: &Map<String, Value>, server: &Map<String, Value>) -> Vec<String> {
    local
        .iter()
        .filter(|(key, value)| key.as_str() != VERSION_FIELD && server.get(*key).is_some_and(|s| s != *value))
        .map(|(key, _)| key.clone())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    protected_fields: HashSet<String>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fields kept from the local value when merging.
    pub fn with_protected_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protected_fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn protected_fields(&self) -> &HashSet<String> {
        &self.protected_fields
    }

    pub fn detect(&self, local: &Value, server: &Value) -> ConflictDescriptor {
        let fields = match (local.as_object(), server.as_object()) {
            (Some(l), Some(s)) => divergent_fields(l, s),
            _ => Vec::new(),
        };

        let conflict_type = match (version_of(local), version_of(server)) {
            (Some(lv), Some(sv)) if lv != sv => ConflictType::VersionMismatch,
            (Some(_), Some(_)) => ConflictType::None,
            _ if !fields.is_empty() => ConflictType::FieldConflict,
            _ if !(local.is_object() && server.is_object()) && local != server => {
                ConflictType::FieldConflict
            }
            _ => ConflictType::None,
        };

        ConflictDescriptor {
            has_conflict: conflict_type != ConflictType::None,
            conflict_type,
            local_entity: local.clone(),
            server_entity: server.clone(),
            conflicting_fields: fields,
        }
    }

    /// Resolved value, or `None` under [`ResolutionStrategy::Manual`].
    pub fn resolve(
        &self,
        descriptor: &ConflictDescriptor,
        strategy: ResolutionStrategy,
    ) -> Option<Value> {
        match strategy {
            ResolutionStrategy::ServerWins => Some(descriptor.server_entity.clone()),
            ResolutionStrategy::ClientWins => Some(descriptor.local_entity.clone()),
            ResolutionStrategy::Merge => Some(self.merge(&descriptor.local_entity, &descriptor.server_entity)),
            ResolutionStrategy::Manual => None,
        }
    }

    fn merge(&self, local: &Value, server: &Value) -> Value {
        let (Some(local), Some(server)) = (local.as_object(), server.as_object()) else {
            return server.clone();
        };

        let mut merged = local.clone();
        for (key, value) in server {
            if self.protected_fields.contains(key) && local.contains_key(key) {
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
        Value::Object(merged)
    }
}
