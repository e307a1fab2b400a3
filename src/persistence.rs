//! Durable snapshots of the cache backend plus a bounded cascade history.

use std::collections::VecDeque;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::applier::CascadeObserver;
use crate::backend::{SnapshotBackend, StoredEntity};
use crate::error::{CascadeError, CascadeResult, ErrorKind};
use crate::types::{now_millis, CascadeHistoryEntry, CascadePayload};

pub const SNAPSHOT_VERSION: u32 = 1;
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Key/value store the snapshot is written to.
#[async_trait]
pub trait PersistentStorage: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError>;

    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    items: Arc<DashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }
}

#[async_trait]
impl PersistentStorage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.get(key).map(|v| v.value().clone()))
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.items.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.remove(key);
        Ok(())
    }
}

/// One file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

/// Percent-escapes every byte outside `[A-Za-z0-9_-]`, so distinct keys
/// never share a file name.
fn encode_key(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name
}

fn io_error(key: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl PersistentStorage for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(key, e)),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(key, e))?;
        // Write beside the target and rename so a crash never leaves a
        // half-written snapshot behind.
        let path = self.path_for(key);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, value)
            .await
            .map_err(|e| io_error(key, e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| io_error(key, e))
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }
}

/// Decides whether an entity is included in a snapshot.
pub type PersistFilter = Arc<dyn Fn(&str, &str, &Value) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct PersistenceOptions {
    pub storage_key: String,
    /// Snapshots older than this are discarded on restore.
    pub max_age: Option<Duration>,
    pub persist_on_change: bool,
    pub debounce: Duration,
    pub history_capacity: usize,
    pub filter: Option<PersistFilter>,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            storage_key: "cascade-cache".to_string(),
            max_age: Some(Duration::from_secs(24 * 60 * 60)),
            persist_on_change: true,
            debounce: Duration::from_millis(1000),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            filter: None,
        }
    }
}

impl PersistenceOptions {
    pub fn with_filter(mut self, filter: impl Fn(&str, &str, &Value) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn history_key(&self) -> String {
        format!("{}:history", self.storage_key)
    }
}

impl std::fmt::Debug for PersistenceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceOptions")
            .field("storage_key", &self.storage_key)
            .field("max_age", &self.max_age)
            .field("persist_on_change", &self.persist_on_change)
            .field("debounce", &self.debounce)
            .field("history_capacity", &self.history_capacity)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotMetadata {
    version: u32,
    timestamp: i64,
    entity_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    metadata: SnapshotMetadata,
    entities: Vec<StoredEntity>,
}

struct RestoreGuard<'a>(&'a AtomicBool);

impl<'a> RestoreGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn corruption(message: &str, source: serde_json::Error) -> CascadeError {
    CascadeError::new(ErrorKind::CacheCorruption, message).with_source(source)
}

pub struct PersistenceManager {
    backend: Arc<dyn SnapshotBackend>,
    storage: Arc<dyn PersistentStorage>,
    options: PersistenceOptions,
    history: Mutex<VecDeque<CascadeHistoryEntry>>,
    restoring: AtomicBool,
    generation: AtomicU64,
    weak_self: Weak<Self>,
}

impl PersistenceManager {
    pub fn new(
        backend: Arc<dyn SnapshotBackend>,
        storage: Arc<dyn PersistentStorage>,
        options: PersistenceOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            backend,
            storage,
            history: Mutex::new(VecDeque::with_capacity(options.history_capacity)),
            options,
            restoring: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    pub fn options(&self) -> &PersistenceOptions {
        &self.options
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::SeqCst)
    }

    fn history_guard(&self) -> MutexGuard<'_, VecDeque<CascadeHistoryEntry>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the history ring, oldest first.
    pub fn history(&self) -> Vec<CascadeHistoryEntry> {
        self.history_guard().iter().cloned().collect()
    }

    /// Writes the backend snapshot and the history. Returns the number of
    /// entities persisted.
    pub async fn persist(&self) -> CascadeResult<usize> {
        let entities: Vec<StoredEntity> = self
            .backend
            .entries()
            .into_iter()
            .filter(|e| {
                self.options
                    .filter
                    .as_ref()
                    .map_or(true, |keep| keep(&e.typename, &e.id, &e.data))
            })
            .collect();
        let count = entities.len();

        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                version: SNAPSHOT_VERSION,
                timestamp: now_millis(),
                entity_count: count,
            },
            entities,
        };
        let encoded = serde_json::to_string(&snapshot).map_err(|e| {
            CascadeError::new(ErrorKind::CacheWrite, "failed to encode cache snapshot").with_source(e)
        })?;
        let history = serde_json::to_string(&self.history()).map_err(|e| {
            CascadeError::new(ErrorKind::CacheWrite, "failed to encode cascade history").with_source(e)
        })?;

        self.storage.set_item(&self.options.storage_key, encoded).await?;
        self.storage
            .set_item(&self.options.history_key(), history)
            .await?;

        debug!(key = %self.options.storage_key, entities = count, "cache persisted");
        Ok(count)
    }

    /// Loads the persisted snapshot into the backend.
    ///
    /// Returns `Ok(false)` when there is nothing to restore, when the snapshot
    /// is expired or from another format version (storage is cleared in both
    /// cases), or when another restore is already running.
    pub async fn restore(&self) -> CascadeResult<bool> {
        let Some(_guard) = RestoreGuard::acquire(&self.restoring) else {
            debug!("restore already in progress");
            return Ok(false);
        };

        let Some(raw) = self.storage.get_item(&self.options.storage_key).await? else {
            return Ok(false);
        };

        let snapshot: Snapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.clear().await?;
                return Err(corruption("persisted snapshot is corrupt", e));
            }
        };

        if snapshot.metadata.version != SNAPSHOT_VERSION {
            warn!(
                found = snapshot.metadata.version,
                expected = SNAPSHOT_VERSION,
                "discarding snapshot from another format version"
            );
            self.clear().await?;
            return Ok(false);
        }

        if let Some(max_age) = self.options.max_age {
            let age = now_millis().saturating_sub(snapshot.metadata.timestamp);
            if age > i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX) {
                debug!(age_ms = age, "discarding expired snapshot");
                self.clear().await?;
                return Ok(false);
            }
        }

        let history: Vec<CascadeHistoryEntry> =
            match self.storage.get_item(&self.options.history_key()).await? {
                Some(raw) => match serde_json::from_str(&raw) {
                    Ok(history) => history,
                    Err(e) => {
                        self.clear().await?;
                        return Err(corruption("persisted cascade history is corrupt", e));
                    }
                },
                None => Vec::new(),
            };

        self.backend.clear();
        for entity in &snapshot.entities {
            self.backend.write(&entity.typename, &entity.id, &entity.data)?;
        }

        {
            let mut ring = self.history_guard();
            ring.clear();
            let skip = history.len().saturating_sub(self.options.history_capacity);
            ring.extend(history.into_iter().skip(skip));
        }

        debug!(
            entities = snapshot.entities.len(),
            "cache restored from snapshot"
        );
        Ok(true)
    }

    /// Appends to the history ring and schedules a debounced persist.
    pub fn record_cascade(&self, payload: &CascadePayload, applied: bool) {
        let capacity = self.options.history_capacity;
        if capacity > 0 {
            let mut ring = self.history_guard();
            while ring.len() >= capacity {
                ring.pop_front();
            }
            ring.push_back(CascadeHistoryEntry {
                timestamp: now_millis(),
                cascade: payload.clone(),
                applied,
            });
        }

        if self.options.persist_on_change && !self.is_restoring() {
            self.schedule_persist();
        }
    }

    /// Trailing-edge debounce: only the last call within the window persists.
    fn schedule_persist(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available for debounced persist");
            return;
        };

        let weak = self.weak_self.clone();
        let delay = self.options.debounce;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if manager.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = manager.persist().await {
                warn!(error = %e, "debounced persist failed");
            }
        });
    }

    /// Cancels any pending debounced persist and persists immediately.
    pub async fn flush(&self) -> CascadeResult<usize> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.persist().await
    }

    /// Re-applies history entries recorded at or after `from` (epoch ms), in
    /// their original order. Returns how many were replayed.
    pub async fn replay<F, Fut>(&self, from: i64, mut apply: F) -> CascadeResult<usize>
    where
        F: FnMut(CascadePayload) -> Fut,
        Fut: std::future::Future<Output = CascadeResult<()>>,
    {
        let entries: Vec<CascadePayload> = self
            .history_guard()
            .iter()
            .filter(|entry| entry.timestamp >= from)
            .map(|entry| entry.cascade.clone())
            .collect();

        let mut replayed = 0;
        for payload in entries {
            apply(payload).await?;
            replayed += 1;
        }
        debug!(replayed, from, "cascade history replayed");
        Ok(replayed)
    }

    /// Removes the snapshot and history keys from storage.
    pub async fn clear(&self) -> CascadeResult<()> {
        self.storage.remove_item(&self.options.storage_key).await?;
        self.storage.remove_item(&self.options.history_key()).await?;
        Ok(())
    }
}

impl CascadeObserver for PersistenceManager {
    fn on_cascade(&self, payload: &CascadePayload, applied: bool) {
        self.record_cascade(payload, applied);
    }
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("options", &self.options)
            .field("history_len", &self.history_guard().len())
            .field("restoring", &self.is_restoring())
            .finish()
    }
}
