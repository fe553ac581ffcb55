//! Live limits.
//!
//! A limiter built with a static maximum reads it through a [`DynamicConfig<u32>`] on every
//! request. An operator holding a clone of that handle (from
//! [`RateLimitConfig::max_handle`](crate::RateLimitConfig::max_handle) or passed in through
//! the builder) can raise, lower or lift the limit without rebuilding the middleware stack.
//!
//! ```rust
//! use tollgate::DynamicConfig;
//!
//! let limit = DynamicConfig::new(100u32);
//! limit.scale_percent(50);
//! assert_eq!(limit.value(), 50);
//! limit.lift();
//! assert!(limit.is_lifted());
//! ```

use crate::rate_limit::LimiterSettings;
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

/// Shared value swapped atomically; readers never block writers.
pub struct DynamicConfig<T> {
    current: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { current: Arc::clone(&self.current) }
    }
}

impl<T: fmt::Debug> fmt::Debug for DynamicConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DynamicConfig").field(&*self.current.load()).finish()
    }
}

impl<T> DynamicConfig<T> {
    /// Handle holding `value`.
    pub fn new(value: T) -> Self {
        Self { current: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        self.current.store(Arc::new(value));
    }

    /// Derive the next value from the current one.
    ///
    /// Retried if another writer swaps in between, so concurrent updates are not lost.
    pub fn update<F>(&self, mut f: F)
    where
        F: FnMut(&T) -> T,
    {
        let _ = self.current.rcu(|cur| f(cur.as_ref()));
    }
}

impl<T: Copy> DynamicConfig<T> {
    /// Copy out the current value.
    pub fn value(&self) -> T {
        **self.current.load()
    }
}

impl DynamicConfig<u32> {
    /// Remove the limit: a maximum of zero leaves every request unmetered.
    pub fn lift(&self) {
        self.set(0);
    }

    /// True while the limit is lifted.
    pub fn is_lifted(&self) -> bool {
        self.value() == 0
    }

    /// Scale the maximum by `percent`, never below one request while a limit is in force.
    ///
    /// A lifted limit stays lifted.
    pub fn scale_percent(&self, percent: u32) {
        self.update(|&max| {
            if max == 0 {
                return 0;
            }
            let scaled = u64::from(max) * u64::from(percent) / 100;
            u32::try_from(scaled).unwrap_or(u32::MAX).max(1)
        });
    }

    /// Take the maximum from reloaded settings. The window and algorithm are fixed when the
    /// limiter is built and are not affected.
    pub fn apply(&self, settings: &LimiterSettings) {
        self.set(settings.max);
    }
}
