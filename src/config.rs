use std::time::Duration;

use anyhow::Context;

use crate::conflict::ResolutionStrategy;
use crate::persistence::{PersistenceOptions, DEFAULT_HISTORY_CAPACITY};
use crate::recovery::RetryPolicy;

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub refetch_concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub exponential_backoff: bool,
    pub conflict_strategy: ResolutionStrategy,
    pub protected_fields: Vec<String>,
    pub storage_key: String,
    pub history_capacity: usize,
    pub persist_on_change: bool,
    pub persist_debounce_ms: u64,
    /// `0` disables snapshot expiry.
    pub persist_max_age_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refetch_concurrency: 8,
            max_retries: 3,
            retry_base_delay_ms: 500,
            exponential_backoff: true,
            conflict_strategy: ResolutionStrategy::ServerWins,
            protected_fields: Vec::new(),
            storage_key: "cascade-cache".into(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            persist_on_change: true,
            persist_debounce_ms: 1000,
            persist_max_age_secs: 24 * 60 * 60,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any variable source; unset keys take defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let refetch_concurrency: usize = var("CASCADE_REFETCH_CONCURRENCY")
            .unwrap_or_else(|| "8".into())
            .parse()
            .context("CASCADE_REFETCH_CONCURRENCY must be a number")?;
        anyhow::ensure!(
            refetch_concurrency > 0,
            "CASCADE_REFETCH_CONCURRENCY must be at least 1"
        );
        let max_retries = var("CASCADE_MAX_RETRIES")
            .unwrap_or_else(|| "3".into())
            .parse()
            .context("CASCADE_MAX_RETRIES must be a number")?;
        let retry_base_delay_ms = var("CASCADE_RETRY_BASE_DELAY_MS")
            .unwrap_or_else(|| "500".into())
            .parse()
            .context("CASCADE_RETRY_BASE_DELAY_MS must be a number")?;
        let exponential_backoff = var("CASCADE_EXPONENTIAL_BACKOFF")
            .unwrap_or_else(|| "true".into())
            .parse()
            .context("CASCADE_EXPONENTIAL_BACKOFF must be true or false")?;
        let conflict_strategy = var("CASCADE_CONFLICT_STRATEGY")
            .unwrap_or_else(|| "server_wins".into())
            .parse::<ResolutionStrategy>()
            .map_err(anyhow::Error::msg)
            .context("CASCADE_CONFLICT_STRATEGY is invalid")?;
        let protected_fields = var("CASCADE_PROTECTED_FIELDS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let storage_key = var("CASCADE_STORAGE_KEY").unwrap_or_else(|| "cascade-cache".into());
        let history_capacity = var("CASCADE_HISTORY_CAPACITY")
            .unwrap_or_else(|| DEFAULT_HISTORY_CAPACITY.to_string())
            .parse()
            .context("CASCADE_HISTORY_CAPACITY must be a number")?;
        let persist_on_change = var("CASCADE_PERSIST_ON_CHANGE")
            .unwrap_or_else(|| "true".into())
            .parse()
            .context("CASCADE_PERSIST_ON_CHANGE must be true or false")?;
        let persist_debounce_ms = var("CASCADE_PERSIST_DEBOUNCE_MS")
            .unwrap_or_else(|| "1000".into())
            .parse()
            .context("CASCADE_PERSIST_DEBOUNCE_MS must be a number")?;
        let persist_max_age_secs = var("CASCADE_PERSIST_MAX_AGE_SECS")
            .unwrap_or_else(|| "86400".into())
            .parse()
            .context("CASCADE_PERSIST_MAX_AGE_SECS must be a number")?;

        Ok(Self {
            refetch_concurrency,
            max_retries,
            retry_base_delay_ms,
            exponential_backoff,
            conflict_strategy,
            protected_fields,
            storage_key,
            history_capacity,
            persist_on_change,
            persist_debounce_ms,
            persist_max_age_secs,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            exponential_backoff: self.exponential_backoff,
        }
    }

    pub fn persistence_options(&self) -> PersistenceOptions {
        PersistenceOptions {
            storage_key: self.storage_key.clone(),
            max_age: (self.persist_max_age_secs > 0)
                .then(|| Duration::from_secs(self.persist_max_age_secs)),
            persist_on_change: self.persist_on_change,
            debounce: Duration::from_millis(self.persist_debounce_ms),
            history_capacity: self.history_capacity,
            filter: None,
        }
    }
}
