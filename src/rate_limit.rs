//! Rate limiting primitives.
//!
//! This module provides the building blocks for window-based admission control:
//! - [`RateLimiter`]: The core trait for the counting logic.
//! - [`RateLimitLayer`]: Tower middleware that enforces the limit on HTTP services.
//! - [`Decision`]: The result of a rate limit check (Allowed/Denied/Unmetered).
//!
//! # Architecture
//!
//! The system is designed to be modular:
//! - **Middleware**: `RateLimitLayer` wraps your service. It extracts a key and a maximum
//!   from each request and asks a `RateLimiter` for a decision.
//! - **Logic**: `FixedWindow` and `SlidingWindow` (in the `strategies` module) handle the
//!   window arithmetic.
//! - **Storage**: `Storage` (in the `store` module) holds the per-key records, enabling
//!   in-memory or shared external backends. `CounterStore` sits between the two and
//!   absorbs storage failures.

use crate::error::BuildError;
use std::time::Duration;

pub mod config;
pub mod entry;
pub mod memory;
pub mod middleware;
pub mod store;
pub mod strategies;

pub use config::{LimiterSettings, RateLimitConfig, RateLimitConfigBuilder};
pub use entry::WindowEntry;
pub use memory::MemoryStorage;
pub use middleware::{RateLimitLayer, RateLimitService};
pub use store::{CounterStore, Storage};
pub use strategies::{FixedWindow, SlidingWindow};

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is within budget and was counted.
    Allowed {
        /// The maximum in force for this request (`X-RateLimit-Limit`).
        limit: u32,
        /// Requests left in the window (`X-RateLimit-Remaining`).
        remaining: u32,
        /// Time until the window ends (`X-RateLimit-Reset`).
        reset_after: Duration,
    },
    /// The request exceeded the budget. It was still counted.
    Denied {
        /// The maximum in force for this request.
        limit: u32,
        /// How long the caller should wait (`Retry-After`).
        retry_after: Duration,
    },
    /// The request was not subject to accounting (maximum of zero, or bypassed).
    Unmetered,
}

impl Decision {
    /// Helper to check if the request may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied { .. })
    }

    /// The wait hint of a denial.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Denied { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Same decision with one more slot available, after a refund.
    pub(crate) fn refunded(self) -> Self {
        match self {
            Decision::Allowed { limit, remaining, reset_after } => Decision::Allowed {
                limit,
                remaining: remaining.saturating_add(1),
                reset_after,
            },
            other => other,
        }
    }
}

/// Core interface for rate limiting logic.
///
/// Implementations must serialize the read-modify-write of a key's record so that
/// concurrent callers in one process never both take the last slot.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request against `key` and decide whether it fits under `max`.
    ///
    /// A `max` of zero means "unlimited for this request": the store is not touched and
    /// [`Decision::Unmetered`] is returned.
    async fn acquire(&self, key: &str, max: u32) -> Decision;

    /// Take back one request previously counted for `key` (skip accounting).
    async fn refund(&self, key: &str);
}

/// Which window algorithm a limiter runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Counter resets when the window ends.
    #[default]
    FixedWindow,
    /// Previous window's count is blended in by remaining overlap.
    SlidingWindow,
}

/// Validate a window length and convert it to whole seconds.
pub(crate) fn window_secs(window: Duration) -> Result<u32, BuildError> {
    if window < Duration::from_secs(1) {
        return Err(BuildError::WindowTooShort(window));
    }
    if window.subsec_nanos() != 0 {
        return Err(BuildError::FractionalWindow(window));
    }
    u32::try_from(window.as_secs()).map_err(|_| BuildError::WindowTooLong(window))
}
