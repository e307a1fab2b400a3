use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{CascadeError, CascadeResult, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecoveryAction {
    Retry,
    Refetch,
    ResetCache,
    Rollback,
    Reconnect,
    NotifyUser,
    Custom(String),
}

/// Ordered recovery preferences for an error kind, most preferred first.
pub fn recovery_actions(kind: ErrorKind) -> Vec<RecoveryAction> {
    use RecoveryAction::*;

    match kind {
        ErrorKind::Network | ErrorKind::Timeout => vec![Retry, NotifyUser],
        ErrorKind::CacheWrite => vec![Retry, ResetCache],
        ErrorKind::CacheRead => vec![Refetch, Retry],
        ErrorKind::CacheCorruption => vec![ResetCache, Refetch],
        ErrorKind::InvalidPayload => vec![Refetch, NotifyUser],
        ErrorKind::MissingPayload => vec![Refetch],
        ErrorKind::PartialCascadeFailure => vec![Refetch, Retry],
        ErrorKind::CascadeConflict => vec![Rollback, Refetch],
        ErrorKind::OptimisticRollbackFailed => vec![ResetCache, Refetch, NotifyUser],
        ErrorKind::SubscriptionError => vec![Reconnect, NotifyUser],
    }
}

/// Recovery preferences with per-kind overrides layered over the defaults.
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlanner {
    overrides: Arc<DashMap<ErrorKind, Vec<RecoveryAction>>>,
}

impl RecoveryPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_actions(&self, kind: ErrorKind, actions: Vec<RecoveryAction>) {
        self.overrides.insert(kind, actions);
    }

    pub fn actions_for(&self, error: &CascadeError) -> Vec<RecoveryAction> {
        match self.overrides.get(&error.kind()) {
            Some(actions) => actions.clone(),
            None => recovery_actions(error.kind()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential_backoff {
            return self.base_delay;
        }
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

type AttemptHook = Arc<dyn Fn(u32, &CascadeError, Duration) + Send + Sync>;
type SuccessHook = Arc<dyn Fn(u32) + Send + Sync>;
type FailureHook = Arc<dyn Fn(&CascadeError) + Send + Sync>;

/// Runs an operation, retrying recoverable failures with backoff.
#[derive(Clone, Default)]
pub struct RecoveryExecutor {
    policy: RetryPolicy,
    on_attempt: Option<AttemptHook>,
    on_success: Option<SuccessHook>,
    on_failure: Option<FailureHook>,
}

impl std::fmt::Debug for RecoveryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RecoveryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Called after each failed attempt that will be retried, with the
    /// attempt number, its error and the delay before the next attempt.
    pub fn on_attempt(
        mut self,
        hook: impl Fn(u32, &CascadeError, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_attempt = Some(Arc::new(hook));
        self
    }

    pub fn on_success(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    pub fn on_failure(mut self, hook: impl Fn(&CascadeError) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> CascadeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CascadeResult<T>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation recovered");
                    }
                    if let Some(hook) = &self.on_success {
                        hook(attempt);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let err = err.with_attempt(attempt);

                    if !err.is_recoverable() || attempt > self.policy.max_retries {
                        warn!(attempt, kind = %err.kind(), error = %err, "operation failed");
                        if let Some(hook) = &self.on_failure {
                            hook(&err);
                        }
                        return Err(err);
                    }

                    let delay = self.policy.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                    if let Some(hook) = &self.on_attempt {
                        hook(attempt, &err, delay);
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
