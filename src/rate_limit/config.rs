//! Limiter configuration: the builder, its validated result and declarative settings.

use crate::adaptive::DynamicConfig;
use crate::clock::{Clock, CoarseClock};
use crate::error::BuildError;
use crate::rate_limit::memory::{MemoryStorage, DEFAULT_SWEEP_INTERVAL};
use crate::rate_limit::middleware::RateLimitLayer;
use crate::rate_limit::store::{CounterStore, Storage};
use crate::rate_limit::strategies::{FixedWindow, SlidingWindow};
use crate::rate_limit::{window_secs, Algorithm, Decision, RateLimiter};
use crate::telemetry::{Emitter, TelemetrySink};
use http::request::Parts;
use http::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Default admitted requests per window.
pub const DEFAULT_MAX: u32 = 5;
/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

type MaxFn = Arc<dyn Fn(&Parts) -> u32 + Send + Sync>;
type KeyFn = Arc<dyn Fn(&Parts) -> String + Send + Sync>;
type BypassFn = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;
type ResponderFn = Arc<dyn Fn(&Parts, &Decision) -> Response<String> + Send + Sync>;

/// Client IP from the request extensions, as put there by the server's connection info.
///
/// Falls back to `"unknown"`, so requests without connection info share one budget.
pub fn client_ip(parts: &Parts) -> String {
    if let Some(addr) = parts.extensions.get::<SocketAddr>() {
        return addr.ip().to_string();
    }
    if let Some(ip) = parts.extensions.get::<IpAddr>() {
        return ip.to_string();
    }
    String::from("unknown")
}

/// `429 Too Many Requests` with a plain-text body.
pub fn too_many_requests(_parts: &Parts, _decision: &Decision) -> Response<String> {
    let mut response = Response::new(String::from("Too Many Requests"));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response
}

/// Declarative limiter settings, e.g. loaded from a JSON config file.
///
/// ```rust
/// use tollgate::rate_limit::LimiterSettings;
///
/// let settings: LimiterSettings =
///     serde_json::from_str(r#"{ "max": 100, "window_secs": 30, "algorithm": "sliding-window" }"#)
///         .unwrap();
/// assert_eq!(settings.max, 100);
/// assert!(!settings.skip_failed);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterSettings {
    /// Admitted requests per window; `0` disables limiting.
    pub max: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Window algorithm.
    pub algorithm: Algorithm,
    /// Refund requests whose response status is below 400.
    pub skip_successful: bool,
    /// Refund requests that fail (status 400 or above, or an inner error).
    pub skip_failed: bool,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX,
            window_secs: DEFAULT_WINDOW.as_secs(),
            algorithm: Algorithm::FixedWindow,
            skip_successful: false,
            skip_failed: false,
        }
    }
}

#[derive(Clone)]
enum MaxSource {
    Fixed(DynamicConfig<u32>),
    PerRequest(MaxFn),
}

/// Resolved limiter configuration shared by every service a [`RateLimitLayer`] produces.
#[derive(Clone)]
pub struct RateLimitConfig {
    max: MaxSource,
    key_extractor: KeyFn,
    limit_reached: ResponderFn,
    bypass: Option<BypassFn>,
    skip_successful: bool,
    skip_failed: bool,
    window: Duration,
    algorithm: Algorithm,
    limiter: Arc<dyn RateLimiter>,
    telemetry: Emitter,
}

impl RateLimitConfig {
    /// Start a builder with the defaults: 5 requests per 60 s fixed window in memory.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::new()
    }

    /// Maximum in force for this request.
    pub fn max_for(&self, parts: &Parts) -> u32 {
        match &self.max {
            MaxSource::Fixed(handle) => handle.value(),
            MaxSource::PerRequest(f) => f(parts),
        }
    }

    /// Rate-limit key for this request.
    pub fn key_for(&self, parts: &Parts) -> String {
        (self.key_extractor)(parts)
    }

    /// Whether this request skips accounting entirely.
    pub fn is_bypassed(&self, parts: &Parts) -> bool {
        self.bypass.as_ref().is_some_and(|f| f(parts))
    }

    /// Response sent instead of calling the inner service.
    pub fn rejection(&self, parts: &Parts, decision: &Decision) -> Response<String> {
        (self.limit_reached)(parts, decision)
    }

    /// Whether an outcome is refunded after the inner service returns.
    ///
    /// `status` is `None` when the inner service returned an error; that counts as a failure.
    pub fn should_refund(&self, status: Option<StatusCode>) -> bool {
        match status {
            Some(status) if status.as_u16() < 400 => self.skip_successful,
            _ => self.skip_failed,
        }
    }

    /// The live handle behind a static maximum, if one is in use.
    pub fn max_handle(&self) -> Option<DynamicConfig<u32>> {
        match &self.max {
            MaxSource::Fixed(handle) => Some(handle.clone()),
            MaxSource::PerRequest(_) => None,
        }
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The counting engine.
    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    pub(crate) fn telemetry(&self) -> &Emitter {
        &self.telemetry
    }
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let max = match &self.max {
            MaxSource::Fixed(handle) => format!("{}", handle.value()),
            MaxSource::PerRequest(_) => String::from("<per-request>"),
        };
        f.debug_struct("RateLimitConfig")
            .field("max", &max)
            .field("window", &self.window)
            .field("algorithm", &self.algorithm)
            .field("skip_successful", &self.skip_successful)
            .field("skip_failed", &self.skip_failed)
            .field("bypass", &self.bypass.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`RateLimitConfig`].
pub struct RateLimitConfigBuilder {
    max: u32,
    max_fn: Option<MaxFn>,
    max_handle: Option<DynamicConfig<u32>>,
    window: Duration,
    key_extractor: KeyFn,
    limit_reached: ResponderFn,
    bypass: Option<BypassFn>,
    skip_successful: bool,
    skip_failed: bool,
    storage: Option<Arc<dyn Storage>>,
    algorithm: Algorithm,
    clock: Option<Arc<dyn Clock>>,
    telemetry: Emitter,
}

impl RateLimitConfigBuilder {
    /// Create a builder with sane defaults.
    pub fn new() -> Self {
        Self {
            max: DEFAULT_MAX,
            max_fn: None,
            max_handle: None,
            window: DEFAULT_WINDOW,
            key_extractor: Arc::new(client_ip),
            limit_reached: Arc::new(too_many_requests),
            bypass: None,
            skip_successful: false,
            skip_failed: false,
            storage: None,
            algorithm: Algorithm::FixedWindow,
            clock: None,
            telemetry: Emitter::default(),
        }
    }

    /// Static maximum per window. `0` disables limiting.
    pub fn max(mut self, max: u32) -> Self {
        self.max = max;
        self
    }

    /// Compute the maximum per request; takes precedence over [`max`](Self::max).
    /// Returning `0` leaves that request unlimited.
    pub fn max_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Parts) -> u32 + Send + Sync + 'static,
    {
        self.max_fn = Some(Arc::new(f));
        self
    }

    /// Read the static maximum from an existing handle, so it can be changed at runtime.
    /// The handle's value wins over [`max`](Self::max).
    pub fn max_handle(mut self, handle: DynamicConfig<u32>) -> Self {
        self.max_handle = Some(handle);
        self
    }

    /// Window length; whole seconds, at least one.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Derive the rate-limit key from the request. Defaults to [`client_ip`].
    pub fn key_extractor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Parts) -> String + Send + Sync + 'static,
    {
        self.key_extractor = Arc::new(f);
        self
    }

    /// Build the response for rejected requests. Defaults to [`too_many_requests`].
    /// `Retry-After` is added unless the responder sets it.
    pub fn limit_reached<F>(mut self, f: F) -> Self
    where
        F: Fn(&Parts, &Decision) -> Response<String> + Send + Sync + 'static,
    {
        self.limit_reached = Arc::new(f);
        self
    }

    /// Requests matching the predicate pass straight through, uncounted.
    pub fn bypass<F>(mut self, f: F) -> Self
    where
        F: Fn(&Parts) -> bool + Send + Sync + 'static,
    {
        self.bypass = Some(Arc::new(f));
        self
    }

    /// Do not count requests answered with a status below 400.
    pub fn skip_successful(mut self, skip: bool) -> Self {
        self.skip_successful = skip;
        self
    }

    /// Do not count requests answered with a status of 400 or more, or that error.
    pub fn skip_failed(mut self, skip: bool) -> Self {
        self.skip_failed = skip;
        self
    }

    /// Counter storage backend. Defaults to a new [`MemoryStorage`].
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Window algorithm.
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Provide a custom clock (useful for deterministic tests).
    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Send limiter events to `sink`.
    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        self.telemetry = Emitter::new(sink);
        self
    }

    /// Apply declarative settings over the current values.
    pub fn settings(self, settings: &LimiterSettings) -> Self {
        self.max(settings.max)
            .window(Duration::from_secs(settings.window_secs))
            .algorithm(settings.algorithm)
            .skip_successful(settings.skip_successful)
            .skip_failed(settings.skip_failed)
    }

    /// Build the config, validating inputs.
    pub fn build(self) -> Result<RateLimitConfig, BuildError> {
        let window = window_secs(self.window)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(CoarseClock::new()));
        let storage = self.storage.unwrap_or_else(|| {
            Arc::new(MemoryStorage::with_options(clock.clone(), DEFAULT_SWEEP_INTERVAL))
        });
        let store = CounterStore::new(storage);

        let limiter: Arc<dyn RateLimiter> = match self.algorithm {
            Algorithm::FixedWindow => Arc::new(FixedWindow::from_parts(store, window, clock)),
            Algorithm::SlidingWindow => Arc::new(SlidingWindow::from_parts(store, window, clock)),
        };

        let max = match (self.max_fn, self.max_handle) {
            (Some(f), _) => MaxSource::PerRequest(f),
            (None, Some(handle)) => MaxSource::Fixed(handle),
            (None, None) => MaxSource::Fixed(DynamicConfig::new(self.max)),
        };

        Ok(RateLimitConfig {
            max,
            key_extractor: self.key_extractor,
            limit_reached: self.limit_reached,
            bypass: self.bypass,
            skip_successful: self.skip_successful,
            skip_failed: self.skip_failed,
            window: self.window,
            algorithm: self.algorithm,
            limiter,
            telemetry: self.telemetry,
        })
    }

    /// Build straight into a [`RateLimitLayer`].
    pub fn layer(self) -> Result<RateLimitLayer, BuildError> {
        self.build().map(RateLimitLayer::new)
    }
}

impl Default for RateLimitConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RateLimitConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfigBuilder")
            .field("max", &self.max)
            .field("window", &self.window)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
