#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Request-rate admission control for tower services: fixed- and sliding-window limits
//! per key, with pluggable counter storage.
//!
//! ## Features
//!
//! - **Fixed window** counters that start over when the window ends
//! - **Sliding window** approximation that blends in the previous window
//! - **Pluggable storage** through the [`Storage`] trait, with an in-process
//!   [`MemoryStorage`] default; storage failures fail open
//! - **Skip accounting** for successful or failed responses
//! - **Live limits** through [`DynamicConfig`]
//!
//! ## Quick Start
//!
//! ```rust
//! use std::convert::Infallible;
//! use std::time::Duration;
//! use http::{Request, Response};
//! use tollgate::RateLimitLayer;
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let layer = RateLimitLayer::builder()
//!         .max(2)
//!         .window(Duration::from_secs(2))
//!         .layer()
//!         .expect("valid window");
//!
//!     let svc = layer.layer(service_fn(|_req: Request<()>| async {
//!         Ok::<_, Infallible>(Response::new(String::from("hello")))
//!     }));
//!
//!     let response = svc.oneshot(Request::new(())).await.unwrap();
//!     assert_eq!(response.headers()["x-ratelimit-limit"], "2");
//! }
//! ```

pub mod adaptive;
pub mod clock;
pub mod error;
pub mod prelude;
pub mod rate_limit;
pub mod telemetry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use clock::{Clock, CoarseClock, ManualClock, SystemClock};
pub use error::{BuildError, StorageError};
pub use rate_limit::{
    Algorithm, CounterStore, Decision, FixedWindow, LimiterSettings, MemoryStorage,
    RateLimitConfig, RateLimitConfigBuilder, RateLimitLayer, RateLimitService, RateLimiter,
    SlidingWindow, Storage, WindowEntry,
};
