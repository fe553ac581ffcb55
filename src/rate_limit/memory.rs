//! Default in-process [`Storage`] backend.
//!
//! Records live in a `HashMap` behind a `RwLock` together with an absolute expiry second.
//! Expired records are invisible to `get` immediately; a background sweeper removes them
//! from the map once per second so idle keys do not accumulate.

use crate::clock::{Clock, CoarseClock};
use crate::error::StorageError;
use crate::rate_limit::store::Storage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

/// Default sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Item {
    value: Vec<u8>,
    // 0 = never expires
    expires_at: u32,
}

impl Item {
    fn is_expired(&self, now: u32) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }
}

#[derive(Debug)]
struct Table {
    items: RwLock<HashMap<String, Item>>,
    clock: Arc<dyn Clock>,
}

impl Table {
    /// Two-phase removal: collect under the read lock, delete under the write lock.
    fn sweep(&self) -> usize {
        let now = self.clock.now_secs();
        let expired: Vec<String> = {
            let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
            items.iter().filter(|(_, item)| item.is_expired(now)).map(|(k, _)| k.clone()).collect()
        };
        if expired.is_empty() {
            return 0;
        }

        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for key in expired {
            // The key may have been rewritten between the two phases.
            if items.get(&key).is_some_and(|item| item.is_expired(now)) {
                items.remove(&key);
                removed += 1;
            }
        }
        removed
    }
}

/// Owns the background sweep task.
///
/// The task starts on the first use inside a Tokio runtime, which may come later than
/// construction (a layer built in a sync `main` before the runtime exists). If the runtime
/// the task ran on shuts down, the next use on a live runtime starts a new one. The task
/// stops when the last storage handle goes away.
#[derive(Debug)]
struct Sweeper {
    interval: Duration,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Sweeper {
    fn new(interval: Duration) -> Self {
        Self { interval, shutdown: Mutex::new(None) }
    }

    fn ensure_running(&self, table: &Arc<Table>) {
        let mut shutdown = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
        if shutdown.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let (tx, mut rx) = oneshot::channel::<()>();
        let table = Arc::clone(table);
        let interval = self.interval;
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        let removed = table.sweep();
                        if removed > 0 {
                            tracing::trace!(removed, "swept expired counter records");
                        }
                    }
                }
            }
        });
        tracing::debug!(?interval, "memory storage sweeper started");
        *shutdown = Some(tx);
    }

    fn is_running(&self) -> bool {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let shutdown = self.shutdown.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// In-process expiring map; the default counter store.
///
/// Clones share the same records. Expired records are hidden from reads at once and removed
/// by a background sweep, which starts with the first use inside a Tokio runtime. Until then
/// (or with no runtime at all) they are reclaimed only when overwritten, deleted, swept with
/// [`sweep_now`](MemoryStorage::sweep_now) or [`reset`](Storage::reset).
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    table: Arc<Table>,
    sweeper: Arc<Sweeper>,
}

impl MemoryStorage {
    /// Storage on the process-wide coarse clock with a one-second sweep.
    pub fn new() -> Self {
        Self::with_options(Arc::new(CoarseClock::new()), DEFAULT_SWEEP_INTERVAL)
    }

    /// Storage reading expiry time from `clock`.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self::with_options(Arc::new(clock), DEFAULT_SWEEP_INTERVAL)
    }

    /// Full control over the clock and sweep period.
    pub fn with_options(clock: Arc<dyn Clock>, sweep_interval: Duration) -> Self {
        let table = Arc::new(Table { items: RwLock::new(HashMap::new()), clock });
        let sweeper = Sweeper::new(sweep_interval.max(Duration::from_millis(10)));
        let storage = Self { table, sweeper: Arc::new(sweeper) };
        storage.touch();
        storage
    }

    /// Number of stored records, including expired ones not swept yet.
    pub fn len(&self) -> usize {
        self.table.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch(&self) {
        self.sweeper.ensure_running(&self.table);
    }

    /// Whether the background sweeper is active.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.is_running()
    }

    /// Run one sweep now; returns how many records were removed.
    pub fn sweep_now(&self) -> usize {
        self.table.sweep()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.touch();
        let now = self.table.clock.now_secs();
        let items = self.table.items.read().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).filter(|item| !item.is_expired(now)).map(|item| item.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StorageError> {
        self.touch();
        let expires_at = if ttl.is_zero() {
            0
        } else {
            let secs = u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX);
            self.table.clock.now_secs().saturating_add(secs)
        };
        let item = Item { value, expires_at };
        self.table.items.write().unwrap_or_else(PoisonError::into_inner).insert(key.to_owned(), item);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.touch();
        self.table.items.write().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }

    async fn reset(&self) -> Result<(), StorageError> {
        self.touch();
        let fresh = HashMap::new();
        *self.table.items.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }
}
