//! Error taxonomy for cascade synchronization.
//!
//! Failures are classified by [`ErrorKind`] rather than by error type. Every
//! [`CascadeError`] carries a severity, a recoverability flag and whatever
//! context was known when it was raised (entity, query, attempt count, cause).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::BackendError;
use crate::fetch::{FetchError, TransportError};
use crate::persistence::StorageError;
use crate::types::EntityRef;

pub type CascadeResult<T> = Result<T, CascadeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Network,
    Timeout,
    CacheWrite,
    CacheRead,
    CacheCorruption,
    InvalidPayload,
    MissingPayload,
    PartialCascadeFailure,
    CascadeConflict,
    OptimisticRollbackFailed,
    SubscriptionError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CacheWrite => "cache-write",
            ErrorKind::CacheRead => "cache-read",
            ErrorKind::CacheCorruption => "cache-corruption",
            ErrorKind::InvalidPayload => "invalid-payload",
            ErrorKind::MissingPayload => "missing-payload",
            ErrorKind::PartialCascadeFailure => "partial-cascade-failure",
            ErrorKind::CascadeConflict => "cascade-conflict",
            ErrorKind::OptimisticRollbackFailed => "optimistic-rollback-failed",
            ErrorKind::SubscriptionError => "subscription-error",
        }
    }

    pub fn default_severity(self) -> Severity {
        match self {
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::CacheRead => Severity::Warning,
            ErrorKind::MissingPayload | ErrorKind::CascadeConflict => Severity::Warning,
            ErrorKind::CacheWrite
            | ErrorKind::InvalidPayload
            | ErrorKind::PartialCascadeFailure
            | ErrorKind::SubscriptionError => Severity::Error,
            ErrorKind::CacheCorruption | ErrorKind::OptimisticRollbackFailed => Severity::Critical,
        }
    }

    pub fn is_recoverable_by_default(self) -> bool {
        !matches!(
            self,
            ErrorKind::CacheCorruption
                | ErrorKind::OptimisticRollbackFailed
                | ErrorKind::InvalidPayload
                | ErrorKind::MissingPayload
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CascadeError {
    kind: ErrorKind,
    severity: Severity,
    recoverable: bool,
    message: String,
    entity: Option<EntityRef>,
    query: Option<String>,
    attempt: Option<u32>,
    causes: Vec<CascadeError>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CascadeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            recoverable: kind.is_recoverable_by_default(),
            message: message.into(),
            entity: None,
            query: None,
            attempt: None,
            causes: Vec::new(),
            source: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_entity(mut self, entity: EntityRef) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_causes(mut self, causes: Vec<CascadeError>) -> Self {
        self.causes = causes;
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn entity(&self) -> Option<&EntityRef> {
        self.entity.as_ref()
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn attempt(&self) -> Option<u32> {
        self.attempt
    }

    /// Constituent errors of an aggregate; empty otherwise.
    pub fn causes(&self) -> &[CascadeError] {
        &self.causes
    }

    /// True when the affected cache state can no longer be trusted.
    pub fn should_reset_cache(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::CacheCorruption | ErrorKind::OptimisticRollbackFailed
        )
    }
}

impl From<BackendError> for CascadeError {
    fn from(err: BackendError) -> Self {
        match &err {
            BackendError::Write { entity, .. } | BackendError::Evict { entity, .. } => {
                let entity = entity.clone();
                CascadeError::new(ErrorKind::CacheWrite, err.to_string())
                    .with_entity(entity)
                    .with_source(err)
            }
            BackendError::Read { entity, .. } => {
                let entity = entity.clone();
                CascadeError::new(ErrorKind::CacheRead, err.to_string())
                    .with_entity(entity)
                    .with_source(err)
            }
            BackendError::Unidentifiable(_) => {
                CascadeError::new(ErrorKind::InvalidPayload, err.to_string()).with_source(err)
            }
        }
    }
}

impl From<FetchError> for CascadeError {
    fn from(err: FetchError) -> Self {
        let kind = match &err {
            FetchError::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            FetchError::Http(_) | FetchError::Stream(_) => ErrorKind::Network,
            FetchError::Deserialization(_) | FetchError::GraphQl(_) => ErrorKind::InvalidPayload,
        };
        CascadeError::new(kind, err.to_string()).with_source(err)
    }
}

impl From<TransportError> for CascadeError {
    fn from(err: TransportError) -> Self {
        CascadeError::new(ErrorKind::SubscriptionError, err.to_string()).with_source(err)
    }
}

impl From<StorageError> for CascadeError {
    fn from(err: StorageError) -> Self {
        CascadeError::new(ErrorKind::CacheWrite, err.to_string()).with_source(err)
    }
}

/// Collects the errors of a batch operation.
#[derive(Debug, Default)]
pub struct ErrorBoundary {
    errors: Vec<CascadeError>,
    counts: BTreeMap<Severity, usize>,
}

impl ErrorBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: CascadeError) {
        *self.counts.entry(err.severity()).or_default() += 1;
        self.errors.push(err);
    }

    /// Unwraps `result`, recording the error if there is one.
    pub fn capture<T>(&mut self, result: CascadeResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(err);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.counts.get(&severity).copied().unwrap_or(0)
    }

    pub fn has_critical(&self) -> bool {
        self.count(Severity::Critical) > 0
    }

    pub fn errors(&self) -> &[CascadeError] {
        &self.errors
    }

    /// `Ok` when nothing was collected, the error itself when exactly one
    /// was, otherwise an aggregate summarizing all of them.
    pub fn into_result(mut self) -> CascadeResult<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(self.into_aggregate()),
        }
    }

    fn into_aggregate(self) -> CascadeError {
        let summary = self
            .counts
            .iter()
            .rev()
            .map(|(severity, count)| format!("{count} {severity}"))
            .collect::<Vec<_>>()
            .join(", ");
        let severity = self
            .counts
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Severity::Error);
        let recoverable = self.errors.iter().all(CascadeError::is_recoverable);

        CascadeError::new(
            ErrorKind::PartialCascadeFailure,
            format!("{} errors ({summary})", self.errors.len()),
        )
        .with_severity(severity)
        .with_recoverable(recoverable)
        .with_causes(self.errors)
    }
}
