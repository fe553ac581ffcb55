use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollgate::{Storage, StorageError};

/// Request from `ip` for `path`, with connection info the way a server would attach it.
pub fn request_from(ip: [u8; 4], path: &str) -> Request<()> {
    let mut req = Request::builder().uri(path).body(()).expect("valid request");
    req.extensions_mut().insert(SocketAddr::from((ip, 40_000)));
    req
}

pub fn request(path: &str) -> Request<()> {
    request_from([127, 0, 0, 1], path)
}

/// Echo service: `/status/<code>` answers with that status, anything else with 200.
/// Counts how many requests reached it.
#[derive(Clone, Default)]
pub struct StatusService {
    pub calls: Arc<AtomicUsize>,
}

impl StatusService {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl tower::Service<Request<()>> for StatusService {
    type Response = Response<String>;
    type Error = Infallible;
    type Future = futures::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<()>) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let status = req
            .uri()
            .path()
            .strip_prefix("/status/")
            .and_then(|code| code.parse::<u16>().ok())
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::OK);
        let mut response = Response::new(String::from("ok"));
        *response.status_mut() = status;
        futures::future::ready(Ok(response))
    }
}

/// A backend that is always down.
#[derive(Debug, Default)]
pub struct UnreachableStorage {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Storage for UnreachableStorage {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Unavailable("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::backend(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reset")))
    }

    async fn delete(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("connection refused".into()))
    }

    async fn reset(&self) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
}

pub fn header<'a>(response: &'a Response<String>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}
