//! Request storage: one contract, three backends.
//!
//! - [`file::FileStorage`]: per-id JSON files plus an append-only index file.
//! - [`sql::SqlStorage`]: one table row per request.
//! - [`kv::KeyValueStorage`]: a sorted set for ordering plus one hash per request, on a
//!   Redis server ([`kv_redis`]) or in process memory.
//!
//! Reads never fail: errors are logged and surface as absent or empty results. Writes
//! report a [`StorageError`] to the caller.

use std::sync::Arc;

use rand::Rng as _;
use serde::{Deserialize, Deserializer};

use crate::{
    config::{Backend, StorageConfig},
    request::{Request, now_unix_secs},
    search::Search,
};

pub mod file;
pub mod index;
pub mod kv;
pub mod kv_redis;
pub mod line_cursor;
pub mod sql;
pub mod sql_search;

pub const DEFAULT_EXPIRATION_MINUTES: u64 = 60 * 24 * 7;
pub const DEFAULT_CLEANUP_CHANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The store location cannot be created or written.
    Write(String),
    /// A relational query kept failing after the schema was reinitialized.
    Schema(String),
    Io(String),
    Internal(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write(message) => write!(f, "storage not writable: {message}"),
            Self::Schema(message) => write!(f, "storage schema error: {message}"),
            Self::Io(message) | Self::Internal(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for StorageError {}

/// How long stored requests are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    Minutes(u64),
    Off,
}

impl Default for Expiration {
    fn default() -> Self {
        Self::Minutes(DEFAULT_EXPIRATION_MINUTES)
    }
}

impl Expiration {
    pub fn as_secs(self) -> Option<u64> {
        match self {
            Self::Minutes(minutes) => Some(minutes.saturating_mul(60)),
            Self::Off => None,
        }
    }

    /// Requests with a `time` before the returned epoch are expired.
    pub fn cutoff(self, now: f64) -> Option<f64> {
        self.as_secs().map(|secs| now - secs as f64)
    }
}

impl<'de> Deserialize<'de> for Expiration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Minutes(u64),
            Enabled(bool),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Minutes(minutes) => Self::Minutes(minutes),
            Raw::Enabled(true) => Self::default(),
            Raw::Enabled(false) => Self::Off,
        })
    }
}

/// When cleanup runs and what it removes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleanupPolicy {
    pub expiration: Expiration,
    /// Probability in `[0, 1]` that an unforced cleanup runs.
    pub chance: f64,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            expiration: Expiration::default(),
            chance: DEFAULT_CLEANUP_CHANCE,
        }
    }
}

impl CleanupPolicy {
    pub fn new(expiration: Expiration, chance: f64) -> Self {
        Self { expiration, chance }
    }

    /// The expiry cutoff if a cleanup should run now.
    pub fn due(&self, force: bool) -> Option<f64> {
        let cutoff = self.expiration.cutoff(now_unix_secs())?;
        (force || roll(self.chance)).then_some(cutoff)
    }
}

fn roll(chance: f64) -> bool {
    if chance.is_nan() || chance <= 0.0 {
        return false;
    }
    if chance >= 1.0 {
        return true;
    }
    rand::thread_rng().gen_bool(chance)
}

/// The storage contract shared by every backend.
///
/// `previous`, `next` and `all` return requests oldest-first. `count = None` is unbounded.
pub trait Storage: Send + Sync {
    fn all(&self, search: &Search) -> Vec<Request>;

    fn find(&self, id: &str) -> Option<Request>;

    fn latest(&self, search: &Search) -> Option<Request>;

    fn previous(&self, id: &str, count: Option<usize>, search: &Search) -> Vec<Request>;

    fn next(&self, id: &str, count: Option<usize>, search: &Search) -> Vec<Request>;

    /// Persists a new request and indexes it; may run a probabilistic cleanup.
    fn store(&self, request: &Request) -> Result<(), StorageError>;

    /// Rewrites a stored request without touching its position in the index.
    fn update(&self, request: &Request) -> Result<(), StorageError>;

    /// Removes expired requests and returns how many were removed.
    fn cleanup(&self, force: bool) -> Result<usize, StorageError>;
}

/// Opens the backend selected by configuration.
pub fn open(config: &StorageConfig) -> anyhow::Result<Arc<dyn Storage>> {
    let cleanup = CleanupPolicy::new(config.expiration, config.cleanup_chance);
    let storage: Arc<dyn Storage> = match config.backend {
        Backend::File => Arc::new(file::FileStorage::new(file::FileStorageConfig {
            path: config.path.clone(),
            compress: config.compress,
            cleanup,
        })),
        Backend::Sql => Arc::new(sql::SqlStorage::new(sql::SqlStorageConfig {
            path: config.path.clone(),
            table: config.sql.table.clone(),
            dialect: config.sql.dialect,
            cleanup,
        })?),
        Backend::Redis => Arc::new(kv::KeyValueStorage::new(
            Arc::new(kv_redis::RedisKeyValueStore::open(&config.kv.url)?),
            kv_config(config, cleanup),
        )),
        Backend::Memory => Arc::new(kv::KeyValueStorage::new(
            Arc::new(kv::MemoryKeyValueStore::default()),
            kv_config(config, cleanup),
        )),
    };
    tracing::debug!(backend = ?config.backend, path = %config.path.display(), "opened storage");
    Ok(storage)
}

fn kv_config(config: &StorageConfig, cleanup: CleanupPolicy) -> kv::KeyValueStorageConfig {
    kv::KeyValueStorageConfig {
        prefix: config.kv.prefix.clone(),
        cluster: config.kv.cluster,
        cleanup,
    }
}

/// Async access to a [`Storage`], running every call on the blocking thread pool.
#[derive(Clone)]
pub struct StorageHandle {
    inner: Arc<dyn Storage>,
}

impl StorageHandle {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self { inner }
    }

    pub fn from_config(config: &StorageConfig) -> anyhow::Result<Self> {
        Ok(Self::new(open(config)?))
    }

    pub async fn find(&self, id: &str) -> Option<Request> {
        let inner = self.inner.clone();
        let id = id.to_owned();
        read_task("find", move || inner.find(&id)).await
    }

    pub async fn latest(&self, search: Search) -> Option<Request> {
        let inner = self.inner.clone();
        read_task("latest", move || inner.latest(&search)).await
    }

    pub async fn previous(&self, id: &str, count: Option<usize>, search: Search) -> Vec<Request> {
        let inner = self.inner.clone();
        let id = id.to_owned();
        read_task("previous", move || inner.previous(&id, count, &search)).await
    }

    pub async fn next(&self, id: &str, count: Option<usize>, search: Search) -> Vec<Request> {
        let inner = self.inner.clone();
        let id = id.to_owned();
        read_task("next", move || inner.next(&id, count, &search)).await
    }

    pub async fn all(&self, search: Search) -> Vec<Request> {
        let inner = self.inner.clone();
        read_task("all", move || inner.all(&search)).await
    }

    pub async fn store(&self, request: Request) -> Result<(), StorageError> {
        let inner = self.inner.clone();
        write_task("store", move || inner.store(&request)).await
    }

    pub async fn update(&self, request: Request) -> Result<(), StorageError> {
        let inner = self.inner.clone();
        write_task("update", move || inner.update(&request)).await
    }

    pub async fn cleanup(&self, force: bool) -> Result<usize, StorageError> {
        let inner = self.inner.clone();
        write_task("cleanup", move || inner.cleanup(force)).await
    }
}

async fn read_task<T, F>(operation: &'static str, task: F) -> T
where
    T: Default + Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(operation, error = %err, "storage read task failed");
            T::default()
        }
    }
}

async fn write_task<T, F>(operation: &'static str, task: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|err| {
        StorageError::Internal(format!("join {operation} task failed: {err}"))
    })?
}
