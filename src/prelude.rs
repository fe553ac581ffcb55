//! Convenient re-exports for common Tollgate types.
pub use crate::{
    adaptive::DynamicConfig,
    clock::{Clock, ManualClock},
    error::{BuildError, StorageError},
    rate_limit::{
        config::{client_ip, too_many_requests},
        middleware::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET},
        Algorithm, Decision, LimiterSettings, MemoryStorage, RateLimitConfig, RateLimitLayer,
        RateLimiter, Storage,
    },
    telemetry::{LimiterEvent, LogSink, MemorySink, NullSink, TelemetrySink},
};
