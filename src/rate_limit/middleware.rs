use crate::rate_limit::config::{RateLimitConfig, RateLimitConfigBuilder};
use crate::rate_limit::Decision;
use crate::telemetry::LimiterEvent;
use futures::future::BoxFuture;
use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use http::{Request, Response};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Maximum in force for the request.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Seconds until the current window ends.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// A layer that enforces window rate limits on HTTP services.
///
/// ```rust
/// use std::time::Duration;
/// use tollgate::RateLimitLayer;
///
/// let layer = RateLimitLayer::builder()
///     .max(100)
///     .window(Duration::from_secs(60))
///     .layer()
///     .unwrap();
/// # let _ = layer;
/// ```
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    config: Arc<RateLimitConfig>,
}

impl RateLimitLayer {
    /// Create a new rate limit layer.
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config: Arc::new(config) }
    }

    /// Start configuring a layer.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::new()
    }

    /// The shared configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, config: self.config.clone() }
    }
}

/// Middleware service that enforces rate limits.
///
/// Every service produced by one layer shares the same counters.
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    config: Arc<RateLimitConfig>,
}

fn stamp(headers: &mut HeaderMap, decision: &Decision) {
    if let Decision::Allowed { limit, remaining, reset_after } = decision {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(*limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(*remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_after.as_secs()));
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let config = self.config.clone();
        // Keep the instance that was polled ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (parts, body) = req.into_parts();

            if config.is_bypassed(&parts) {
                config.telemetry().emit(LimiterEvent::Unmetered { key: None }).await;
                return inner.call(Request::from_parts(parts, body)).await;
            }

            let key = config.key_for(&parts);
            let max = config.max_for(&parts);
            let decision = config.limiter().acquire(&key, max).await;

            match decision {
                Decision::Denied { limit, retry_after } => {
                    tracing::debug!(key = %key, limit, retry_after = ?retry_after, "request rate limited");
                    config
                        .telemetry()
                        .emit(LimiterEvent::Rejected { key, limit, retry_after })
                        .await;

                    let mut response = config.rejection(&parts, &decision).map(ResBody::from);
                    response
                        .headers_mut()
                        .entry(RETRY_AFTER)
                        .or_insert_with(|| HeaderValue::from(retry_after.as_secs()));
                    Ok(response)
                }
                Decision::Unmetered => {
                    config.telemetry().emit(LimiterEvent::Unmetered { key: Some(key) }).await;
                    inner.call(Request::from_parts(parts, body)).await
                }
                Decision::Allowed { limit, remaining, .. } => {
                    config
                        .telemetry()
                        .emit(LimiterEvent::Admitted { key: key.clone(), limit, remaining })
                        .await;

                    let result = inner.call(Request::from_parts(parts, body)).await;

                    let status = result.as_ref().ok().map(|response| response.status());
                    let decision = if config.should_refund(status) {
                        config.limiter().refund(&key).await;
                        tracing::debug!(key = %key, status = ?status, "skipped outcome refunded");
                        config.telemetry().emit(LimiterEvent::Refunded { key }).await;
                        decision.refunded()
                    } else {
                        decision
                    };

                    result.map(|mut response| {
                        stamp(response.headers_mut(), &decision);
                        response
                    })
                }
            }
        })
    }
}
