#![allow(missing_docs)]

mod common;

use common::test_helpers::{header, request, request_from, StatusService, UnreachableStorage};
use http::request::Parts;
use http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tollgate::prelude::*;
use tower::{Layer, ServiceExt};

fn limited(layer: &RateLimitLayer) -> (tollgate::RateLimitService<StatusService>, StatusService) {
    let inner = StatusService::default();
    (layer.layer(inner.clone()), inner)
}

#[tokio::test]
async fn two_per_two_seconds() {
    let clock = ManualClock::new(0);
    let layer = RateLimitLayer::builder()
        .max(2)
        .window(Duration::from_secs(2))
        .clock(clock.clone())
        .layer()
        .unwrap();
    let (svc, inner) = limited(&layer);

    let first = svc.clone().oneshot(request("/")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, "x-ratelimit-limit"), Some("2"));
    assert_eq!(header(&first, "x-ratelimit-remaining"), Some("1"));
    assert_eq!(header(&first, "x-ratelimit-reset"), Some("2"));

    let second = svc.clone().oneshot(request("/")).await.unwrap();
    assert_eq!(header(&second, "x-ratelimit-remaining"), Some("0"));

    let third = svc.clone().oneshot(request("/")).await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&third, "retry-after"), Some("2"));
    assert_eq!(third.body(), "Too Many Requests");
    assert_eq!(inner.calls(), 2);

    clock.advance(3);
    let fourth = svc.oneshot(request("/")).await.unwrap();
    assert_eq!(fourth.status(), StatusCode::OK);
    assert_eq!(inner.calls(), 3);
}

#[tokio::test]
async fn window_reset_restores_full_budget() {
    let clock = ManualClock::new(1_000);
    let layer = RateLimitLayer::builder()
        .max(5)
        .window(Duration::from_secs(10))
        .clock(clock.clone())
        .layer()
        .unwrap();
    let (svc, _) = limited(&layer);

    for _ in 0..5 {
        assert_eq!(svc.clone().oneshot(request("/")).await.unwrap().status(), StatusCode::OK);
    }
    let denied = svc.clone().oneshot(request("/")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

    clock.advance(9);
    let still = svc.clone().oneshot(request("/")).await.unwrap();
    assert_eq!(header(&still, "retry-after"), Some("1"));

    clock.advance(1);
    for remaining in (0..5).rev() {
        let response = svc.clone().oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-remaining"), Some(remaining.to_string().as_str()));
    }
}

#[tokio::test]
async fn clients_are_counted_separately() {
    let layer = RateLimitLayer::builder().max(1).clock(ManualClock::new(50)).layer().unwrap();
    let (svc, _) = limited(&layer);

    let a = svc.clone().oneshot(request_from([10, 0, 0, 1], "/")).await.unwrap();
    let b = svc.clone().oneshot(request_from([10, 0, 0, 2], "/")).await.unwrap();
    let a_again = svc.oneshot(request_from([10, 0, 0, 1], "/")).await.unwrap();
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);
    assert_eq!(a_again.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn sliding_window_smooths_the_boundary() {
    let clock = ManualClock::new(1_000);
    let layer = RateLimitLayer::builder()
        .max(10)
        .window(Duration::from_secs(10))
        .algorithm(Algorithm::SlidingWindow)
        .clock(clock.clone())
        .layer()
        .unwrap();
    let (svc, _) = limited(&layer);

    // Open the window, then burst right before its end.
    assert_eq!(svc.clone().oneshot(request("/")).await.unwrap().status(), StatusCode::OK);
    clock.advance(9);
    for _ in 0..9 {
        assert_eq!(svc.clone().oneshot(request("/")).await.unwrap().status(), StatusCode::OK);
    }

    // Just past the boundary a fixed window would admit ten more; here the previous window
    // still weighs floor(10 * 9 / 10) = 9.
    clock.advance(2);
    let mut admitted = 0;
    for _ in 0..10 {
        if svc.clone().oneshot(request("/")).await.unwrap().status() == StatusCode::OK {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
}

#[tokio::test]
async fn skip_successful_never_exhausts_on_successes() {
    let layer = RateLimitLayer::builder()
        .max(2)
        .skip_successful(true)
        .clock(ManualClock::new(1_000))
        .layer()
        .unwrap();
    let (svc, inner) = limited(&layer);

    for _ in 0..20 {
        let response = svc.clone().oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-remaining"), Some("2"));
    }
    assert_eq!(inner.calls(), 20);

    // Failures still count.
    for _ in 0..2 {
        let response = svc.clone().oneshot(request("/status/500")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    let denied = svc.oneshot(request("/")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn skip_failed_never_exhausts_on_failures() {
    let layer = RateLimitLayer::builder()
        .max(2)
        .skip_failed(true)
        .clock(ManualClock::new(1_000))
        .layer()
        .unwrap();
    let (svc, _) = limited(&layer);

    for _ in 0..20 {
        let response = svc.clone().oneshot(request("/status/404")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(header(&response, "x-ratelimit-remaining"), Some("2"));
    }

    // A 3xx is a success and is counted.
    for _ in 0..2 {
        let response = svc.clone().oneshot(request("/status/304")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }
    let denied = svc.oneshot(request("/")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn inner_errors_count_as_failures() {
    let layer = RateLimitLayer::builder()
        .max(1)
        .skip_failed(true)
        .clock(ManualClock::new(1_000))
        .layer()
        .unwrap();
    let svc = layer.layer(tower::service_fn(|_req: http::Request<()>| async {
        Err::<http::Response<String>, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
    }));

    for _ in 0..5 {
        let err = svc.clone().oneshot(request("/")).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_burst_admits_exactly_max() {
    let layer = RateLimitLayer::builder()
        .max(10)
        .window(Duration::from_secs(60))
        .clock(ManualClock::new(1_000))
        .layer()
        .unwrap();
    let (svc, inner) = limited(&layer);

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let svc = svc.clone();
            tokio::spawn(async move { svc.oneshot(request("/")).await.unwrap().status() })
        })
        .collect();

    let mut admitted = 0;
    let mut rejected = 0;
    for handle in handles {
        let status = handle.await.unwrap();
        if status == StatusCode::OK {
            admitted += 1;
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            rejected += 1;
        } else {
            panic!("unexpected status {}", status);
        }
    }
    assert_eq!(admitted, 10);
    assert_eq!(rejected, 90);
    assert_eq!(inner.calls(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sliding_concurrent_burst_admits_exactly_max() {
    let layer = RateLimitLayer::builder()
        .max(10)
        .window(Duration::from_secs(60))
        .algorithm(Algorithm::SlidingWindow)
        .clock(ManualClock::new(1_000))
        .layer()
        .unwrap();
    let (svc, inner) = limited(&layer);

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let svc = svc.clone();
            tokio::spawn(async move { svc.oneshot(request("/")).await.unwrap().status() })
        })
        .collect();

    let statuses = futures::future::join_all(handles).await;
    let admitted = statuses.iter().filter(|s| *s.as_ref().unwrap() == StatusCode::OK).count();
    let rejected = statuses
        .iter()
        .filter(|s| *s.as_ref().unwrap() == StatusCode::TOO_MANY_REQUESTS)
        .count();
    assert_eq!(admitted, 10);
    assert_eq!(rejected, 90);
    assert_eq!(inner.calls(), 10);
}

#[tokio::test]
async fn sliding_skip_failed_requests() {
    let clock = ManualClock::new(1_000);
    let layer = RateLimitLayer::builder()
        .max(1)
        .window(Duration::from_secs(2))
        .algorithm(Algorithm::SlidingWindow)
        .skip_failed(true)
        .clock(clock.clone())
        .layer()
        .unwrap();
    let (svc, _) = limited(&layer);

    let failed = svc.clone().oneshot(request("/status/400")).await.unwrap();
    assert_eq!(failed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(header(&failed, "x-ratelimit-remaining"), Some("1"));

    let ok = svc.clone().oneshot(request("/")).await.unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(header(&ok, "x-ratelimit-remaining"), Some("0"));

    let denied = svc.clone().oneshot(request("/")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

    // Two full windows idle: nothing carries over.
    clock.advance(4);
    let response = svc.oneshot(request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn sliding_skip_successful_requests() {
    let clock = ManualClock::new(1_000);
    let layer = RateLimitLayer::builder()
        .max(1)
        .window(Duration::from_secs(2))
        .algorithm(Algorithm::SlidingWindow)
        .skip_successful(true)
        .clock(clock.clone())
        .layer()
        .unwrap();
    let (svc, _) = limited(&layer);

    for _ in 0..10 {
        let response = svc.clone().oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let failed = svc.clone().oneshot(request("/status/500")).await.unwrap();
    assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let denied = svc.clone().oneshot(request("/status/500")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

    clock.advance(4);
    let response = svc.oneshot(request("/status/500")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn zero_max_is_unlimited_and_never_stored() {
    let clock = ManualClock::new(1_000);
    let storage = MemoryStorage::with_clock(clock.clone());
    let layer = RateLimitLayer::builder()
        .max_fn(|parts: &Parts| if parts.uri.path() == "/health" { 0 } else { 1 })
        .storage(Arc::new(storage.clone()))
        .clock(clock)
        .layer()
        .unwrap();
    let (svc, _) = limited(&layer);

    for _ in 0..50 {
        let response = svc.clone().oneshot(request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
    assert!(storage.is_empty());

    assert_eq!(svc.clone().oneshot(request("/api")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(storage.len(), 1);
    let denied = svc.oneshot(request("/api")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn bypassed_requests_skip_accounting() {
    let clock = ManualClock::new(1_000);
    let storage = MemoryStorage::with_clock(clock.clone());
    let layer = RateLimitLayer::builder()
        .max(1)
        .bypass(|parts: &Parts| parts.headers.contains_key("x-internal"))
        .storage(Arc::new(storage.clone()))
        .clock(clock)
        .layer()
        .unwrap();
    let (svc, inner) = limited(&layer);

    for _ in 0..10 {
        let mut req = request("/");
        req.headers_mut().insert("x-internal", http::HeaderValue::from_static("1"));
        let response = svc.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-remaining").is_none());
    }
    assert!(storage.is_empty());
    assert_eq!(inner.calls(), 10);
}

#[tokio::test]
async fn custom_key_extractor() {
    let layer = RateLimitLayer::builder()
        .max(1)
        .key_extractor(|parts: &Parts| {
            parts
                .headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("anonymous")
                .to_owned()
        })
        .clock(ManualClock::new(1_000))
        .layer()
        .unwrap();
    let (svc, _) = limited(&layer);

    let keyed = |key: &'static str| {
        let mut req = request("/");
        req.headers_mut().insert("x-api-key", http::HeaderValue::from_static(key));
        req
    };

    assert_eq!(svc.clone().oneshot(keyed("alpha")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(svc.clone().oneshot(keyed("beta")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(
        svc.oneshot(keyed("alpha")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn unreachable_store_fails_open() {
    let backend = Arc::new(UnreachableStorage::default());
    let layer = RateLimitLayer::builder()
        .max(1)
        .storage(backend.clone())
        .clock(ManualClock::new(1_000))
        .layer()
        .unwrap();
    let (svc, inner) = limited(&layer);

    for _ in 0..20 {
        let response = svc.clone().oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(inner.calls(), 20);
    assert_eq!(backend.calls.load(std::sync::atomic::Ordering::SeqCst), 40);
}

#[tokio::test]
async fn limit_changes_apply_to_next_request() {
    let handle = DynamicConfig::new(1u32);
    let layer = RateLimitLayer::builder()
        .max_handle(handle.clone())
        .clock(ManualClock::new(1_000))
        .layer()
        .unwrap();
    let (svc, _) = limited(&layer);

    assert_eq!(svc.clone().oneshot(request("/")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(
        svc.clone().oneshot(request("/")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    handle.set(4);
    let response = svc.oneshot(request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-limit"), Some("4"));
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("1"));
}

#[tokio::test]
async fn custom_responder_gets_retry_after() {
    let layer = RateLimitLayer::builder()
        .max(1)
        .window(Duration::from_secs(30))
        .limit_reached(|_parts: &Parts, decision: &Decision| {
            let wait = decision.retry_after().unwrap_or_default().as_secs();
            let mut response = http::Response::new(format!("come back in {}s", wait));
            *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
            response
        })
        .clock(ManualClock::new(1_000))
        .layer()
        .unwrap();
    let (svc, _) = limited(&layer);

    svc.clone().oneshot(request("/")).await.unwrap();
    let denied = svc.oneshot(request("/")).await.unwrap();
    assert_eq!(denied.body(), "come back in 30s");
    assert_eq!(header(&denied, "retry-after"), Some("30"));
}

#[tokio::test]
async fn telemetry_records_decisions() {
    let sink = MemorySink::new();
    let layer = RateLimitLayer::builder()
        .max(1)
        .skip_failed(true)
        .telemetry(sink.clone())
        .clock(ManualClock::new(1_000))
        .layer()
        .unwrap();
    let (svc, _) = limited(&layer);

    svc.clone().oneshot(request("/status/503")).await.unwrap();
    svc.clone().oneshot(request("/")).await.unwrap();
    svc.oneshot(request("/")).await.unwrap();

    let key = String::from("127.0.0.1");
    assert_eq!(
        sink.events(),
        vec![
            LimiterEvent::Admitted { key: key.clone(), limit: 1, remaining: 0 },
            LimiterEvent::Refunded { key: key.clone() },
            LimiterEvent::Admitted { key: key.clone(), limit: 1, remaining: 0 },
            LimiterEvent::Rejected { key, limit: 1, retry_after: Duration::from_secs(60) },
        ]
    );
}

#[tokio::test]
async fn layer_from_settings() {
    let settings: LimiterSettings =
        serde_json::from_str(r#"{"max": 3, "window_secs": 5, "algorithm": "sliding-window"}"#)
            .unwrap();
    let layer = RateLimitLayer::builder()
        .settings(&settings)
        .clock(ManualClock::new(1_000))
        .layer()
        .unwrap();
    assert_eq!(layer.config().algorithm(), Algorithm::SlidingWindow);
    let (svc, _) = limited(&layer);

    let response = svc.oneshot(request("/")).await.unwrap();
    assert_eq!(header(&response, "x-ratelimit-limit"), Some("3"));
    assert_eq!(header(&response, "x-ratelimit-reset"), Some("5"));
}

#[test]
fn invalid_window_is_a_build_error() {
    let err = RateLimitLayer::builder().window(Duration::from_millis(250)).layer().unwrap_err();
    assert!(matches!(err, BuildError::WindowTooShort(_)));
}
