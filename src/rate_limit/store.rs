use crate::error::StorageError;
use crate::rate_limit::entry::WindowEntry;
use crate::rate_limit::memory::MemoryStorage;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Abstract key/value storage for window records.
///
/// Values are opaque bytes with a time-to-live, so the same contract fits the in-process
/// [`MemoryStorage`] and external stores (Redis, memcached, a database table) shared between
/// processes. Implementations must hide expired records from [`get`](Storage::get).
///
/// The limiter performs a plain get-then-set per request. With a store shared across
/// processes, two processes can interleave between those calls and over-admit briefly; a
/// backend that needs exact cross-process counts has to provide that atomicity itself.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch the record for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Insert or overwrite the record for `key`. A zero `ttl` means the record never expires.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StorageError>;

    /// Remove the record for `key`.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every record.
    async fn reset(&self) -> Result<(), StorageError>;
}

/// Window-record view over a [`Storage`] backend.
///
/// This is where storage failures stop: a failed or undecodable read yields a fresh
/// [`WindowEntry`] and a failed write is dropped, both logged at `warn`. The algorithms
/// only ever see entries, never errors, so a broken backend admits traffic instead of
/// blocking it.
#[derive(Clone)]
pub struct CounterStore {
    backend: Arc<dyn Storage>,
}

impl std::fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStore").field("backend", &"<dyn Storage>").finish()
    }
}

impl CounterStore {
    /// Wrap an explicit backend.
    pub fn new(backend: Arc<dyn Storage>) -> Self {
        Self { backend }
    }

    /// Backed by a fresh [`MemoryStorage`].
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn Storage> {
        &self.backend
    }

    /// Read the entry for `key`; absent, expired, unreadable and failed reads all give the
    /// default entry.
    pub async fn load(&self, key: &str) -> WindowEntry {
        let bytes = match self.backend.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return WindowEntry::default(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "counter read failed; starting fresh");
                return WindowEntry::default();
            }
        };
        match WindowEntry::decode(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "counter record unreadable; starting fresh");
                WindowEntry::default()
            }
        }
    }

    /// Persist `entry` for `key` with the given time-to-live.
    pub async fn save(&self, key: &str, entry: &WindowEntry, ttl: Duration) {
        let bytes = match entry.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "counter record encode failed");
                return;
            }
        };
        if let Err(e) = self.backend.set(key, bytes, ttl).await {
            tracing::warn!(key = %key, error = %e, "counter write failed; update dropped");
        }
    }

    /// Forget the entry for `key`.
    pub async fn remove(&self, key: &str) {
        if let Err(e) = self.backend.delete(key).await {
            tracing::warn!(key = %key, error = %e, "counter delete failed");
        }
    }
}
