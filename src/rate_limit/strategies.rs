use crate::clock::{Clock, CoarseClock};
use crate::error::BuildError;
use crate::rate_limit::entry::WindowEntry;
use crate::rate_limit::store::CounterStore;
use crate::rate_limit::{window_secs, Decision, RateLimiter};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

fn secs(s: u32) -> Duration {
    Duration::from_secs(u64::from(s))
}

fn decide(max: u32, counted: u64, reset_in: u32) -> Decision {
    match u64::from(max).checked_sub(counted) {
        Some(remaining) => Decision::Allowed {
            limit: max,
            remaining: u32::try_from(remaining).unwrap_or(u32::MAX),
            reset_after: secs(reset_in),
        },
        None => Decision::Denied { limit: max, retry_after: secs(reset_in) },
    }
}

/// A fixed-window counter.
///
/// Each key gets `max` requests per window; the window opens with the key's first request
/// and the count starts over on the first request at or after its end.
///
/// One lock per limiter serializes every read-modify-write, across all keys.
#[derive(Debug)]
pub struct FixedWindow {
    store: CounterStore,
    window: u32,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl FixedWindow {
    /// Create a fixed-window limiter over `store`. The window must be whole seconds.
    pub fn new(store: CounterStore, window: Duration) -> Result<Self, BuildError> {
        Ok(Self::from_parts(store, window_secs(window)?, Arc::new(CoarseClock::new())))
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn from_parts(store: CounterStore, window: u32, clock: Arc<dyn Clock>) -> Self {
        Self { store, window, clock, lock: Mutex::new(()) }
    }

    /// Configured window length.
    pub fn window(&self) -> Duration {
        secs(self.window)
    }

    /// The counter store this limiter writes to.
    pub fn store(&self) -> &CounterStore {
        &self.store
    }

    fn ttl(&self) -> Duration {
        secs(self.window)
    }
}

#[async_trait]
impl RateLimiter for FixedWindow {
    async fn acquire(&self, key: &str, max: u32) -> Decision {
        if max == 0 {
            return Decision::Unmetered;
        }

        let (entry, now) = {
            let _guard = self.lock.lock().await;
            let now = self.clock.now_secs();
            let mut entry = self.store.load(key).await;

            if entry.is_uninitialized() || now >= entry.expires_at {
                entry.current_hits = 0;
                entry.expires_at = now.saturating_add(self.window);
            }
            entry.current_hits = entry.current_hits.saturating_add(1);

            self.store.save(key, &entry, self.ttl()).await;
            (entry, now)
        };

        decide(max, u64::from(entry.current_hits), entry.reset_in(now))
    }

    async fn refund(&self, key: &str) {
        let _guard = self.lock.lock().await;
        let mut entry = self.store.load(key).await;
        if entry.is_uninitialized() {
            return;
        }
        entry.current_hits = entry.current_hits.saturating_sub(1);
        self.store.save(key, &entry, self.ttl()).await;
    }
}

/// A sliding-window counter approximated from two fixed windows.
///
/// The previous window's count is weighted by how much of it still overlaps a window
/// ending now:
///
/// ```text
/// weighted = floor(previous_hits * time_left / window) + current_hits
/// ```
///
/// Only two integers are kept per key, whatever the traffic. A key idle for a full window
/// or more starts over with no history.
#[derive(Debug)]
pub struct SlidingWindow {
    store: CounterStore,
    window: u32,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl SlidingWindow {
    /// Create a sliding-window limiter over `store`. The window must be whole seconds.
    pub fn new(store: CounterStore, window: Duration) -> Result<Self, BuildError> {
        Ok(Self::from_parts(store, window_secs(window)?, Arc::new(CoarseClock::new())))
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn from_parts(store: CounterStore, window: u32, clock: Arc<dyn Clock>) -> Self {
        Self { store, window, clock, lock: Mutex::new(()) }
    }

    /// Configured window length.
    pub fn window(&self) -> Duration {
        secs(self.window)
    }

    /// The counter store this limiter writes to.
    pub fn store(&self) -> &CounterStore {
        &self.store
    }

    /// Keep the record through the next window so its count can still be weighted.
    fn ttl(&self, reset_in: u32) -> Duration {
        secs(reset_in.saturating_add(self.window))
    }

    fn roll(&self, entry: &mut WindowEntry, now: u32) {
        if entry.is_uninitialized() {
            entry.expires_at = now.saturating_add(self.window);
        } else if now >= entry.expires_at {
            let overdue = now - entry.expires_at;
            if overdue >= self.window {
                entry.previous_hits = 0;
                entry.current_hits = 0;
                entry.expires_at = now.saturating_add(self.window);
            } else {
                entry.previous_hits = entry.current_hits;
                entry.current_hits = 0;
                entry.expires_at = entry.expires_at.saturating_add(self.window);
            }
        }
    }

    fn weighted(&self, entry: &WindowEntry, reset_in: u32) -> u64 {
        let overlap = u64::from(reset_in.min(self.window));
        u64::from(entry.previous_hits) * overlap / u64::from(self.window)
            + u64::from(entry.current_hits)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindow {
    async fn acquire(&self, key: &str, max: u32) -> Decision {
        if max == 0 {
            return Decision::Unmetered;
        }

        let (weighted, reset_in) = {
            let _guard = self.lock.lock().await;
            let now = self.clock.now_secs();
            let mut entry = self.store.load(key).await;

            self.roll(&mut entry, now);
            entry.current_hits = entry.current_hits.saturating_add(1);

            let reset_in = entry.reset_in(now);
            self.store.save(key, &entry, self.ttl(reset_in)).await;
            (self.weighted(&entry, reset_in), reset_in)
        };

        decide(max, weighted, reset_in)
    }

    async fn refund(&self, key: &str) {
        let _guard = self.lock.lock().await;
        let mut entry = self.store.load(key).await;
        if entry.is_uninitialized() {
            return;
        }
        entry.current_hits = entry.current_hits.saturating_sub(1);
        let reset_in = entry.reset_in(self.clock.now_secs());
        self.store.save(key, &entry, self.ttl(reset_in)).await;
    }
}
