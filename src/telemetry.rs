//! Telemetry for limiter decisions.
//!
//! The middleware emits a [`LimiterEvent`] for every request it accounts for. Events flow
//! through [`TelemetrySink`] implementations, which are plain `tower::Service<LimiterEvent>`s
//! so they can be composed with standard tower combinators.
//!
//! ```rust
//! use tollgate::telemetry::{LimiterEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(LimiterEvent::Refunded { key: "10.0.0.1".into() }).await.unwrap();
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

use futures::future::BoxFuture;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// A telemetry sink that consumes limiter events.
pub trait TelemetrySink:
    Service<LimiterEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// A sink that is not ready or fails never affects the request being limited.
pub async fn emit_best_effort<S>(sink: S, event: LimiterEvent)
where
    S: Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Type-erased handle to a sink, shareable across services.
#[derive(Clone)]
pub(crate) struct Emitter {
    emit: Arc<dyn Fn(LimiterEvent) -> BoxFuture<'static, ()> + Send + Sync>,
}

impl Emitter {
    pub(crate) fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        Self {
            emit: Arc::new(move |event: LimiterEvent| -> BoxFuture<'static, ()> {
                Box::pin(emit_best_effort(sink.clone(), event))
            }),
        }
    }

    pub(crate) async fn emit(&self, event: LimiterEvent) {
        (self.emit)(event).await
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Emitter")
    }
}

/// What the limiter did with one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// Request counted and forwarded.
    Admitted {
        /// Rate-limit key.
        key: String,
        /// Maximum in force.
        limit: u32,
        /// Slots left in the window after this request.
        remaining: u32,
    },
    /// Request counted and answered with the rejection response.
    Rejected {
        /// Rate-limit key.
        key: String,
        /// Maximum in force.
        limit: u32,
        /// Wait hint sent back to the client.
        retry_after: Duration,
    },
    /// A counted request was taken back because its outcome is skipped.
    Refunded {
        /// Rate-limit key.
        key: String,
    },
    /// Request forwarded without accounting (bypass predicate, or a maximum of zero).
    Unmetered {
        /// Rate-limit key, when one was derived.
        key: Option<String>,
    },
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Admitted { key, limit, remaining } => {
                write!(f, "Admitted(key={}, limit={}, remaining={})", key, limit, remaining)
            }
            LimiterEvent::Rejected { key, limit, retry_after } => {
                write!(f, "Rejected(key={}, limit={}, retry_after={:?})", key, limit, retry_after)
            }
            LimiterEvent::Refunded { key } => write!(f, "Refunded(key={})", key),
            LimiterEvent::Unmetered { key: Some(key) } => write!(f, "Unmetered(key={})", key),
            LimiterEvent::Unmetered { key: None } => write!(f, "Unmetered(bypass)"),
        }
    }
}

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op telemetry sink that discards all events. This is the default.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LimiterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimiterEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Rejections are logged at INFO, everything else at DEBUG.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<LimiterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        match event {
            LimiterEvent::Rejected { .. } => tracing::info!(event = %event, "limiter_event"),
            _ => tracing::debug!(event = %event, "limiter_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory.
///
/// Bounded; the oldest events are evicted once capacity is reached.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LimiterEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Vec<LimiterEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<LimiterEvent> {
        self.guard().clone()
    }

    /// Clears all stored events.
    pub fn clear(&self) {
        self.guard().clear();
    }

    /// Returns the number of events stored.
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    /// Returns true if no events are stored.
    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimiterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let mut guard = self.guard();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
