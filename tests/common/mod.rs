//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backends, a scripted proxy capability for
//! driving the retry/failover state machine without a network, pool
//! builders, and small utilities used across all integration test modules.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tandem::{
    Backend, BoxBody, BufferedRequest, Forward, HttpClient, HttpForwarder, ProxyError, ServerPool,
    StdError, Strategy, ValidatedBackend,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

pub fn test_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// A forwarder over a fresh client with a short per-invocation timeout.
pub fn test_forwarder() -> HttpForwarder {
    HttpForwarder::new(test_client(), Duration::from_secs(5))
}

/// Collects a [`BoxBody`] into [`Bytes`].
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// An empty GET request to the given path.
pub fn get(path: &str) -> Request<Empty<Bytes>> {
    Request::builder()
        .uri(format!("http://lb.local{path}"))
        .body(Empty::<Bytes>::new())
        .unwrap()
}

/// Builds a pool with unit weights over the given `host:port` authorities.
pub fn pool_of(strategy: Strategy, authorities: &[&str]) -> ServerPool {
    let weighted = authorities.iter().map(|a| (*a, 1)).collect::<Vec<_>>();
    weighted_pool(strategy, &weighted)
}

/// Builds a pool over `(host:port, weight)` pairs.
pub fn weighted_pool(strategy: Strategy, specs: &[(&str, u32)]) -> ServerPool {
    let validated = specs
        .iter()
        .map(|(authority, weight)| ValidatedBackend {
            uri: format!("http://{authority}").parse().unwrap(),
            weight: *weight,
        })
        .collect::<Vec<_>>();
    ServerPool::from_validated(strategy, &validated)
}

/// Returns the `host:port` of a backend.
pub fn authority(backend: &Backend) -> String {
    backend
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default()
}

/// A proxy capability with scripted outcomes per backend authority.
///
/// Backends listed in `always_fail` report a transport error on every
/// invocation; backends in `fail_times` fail that many times and then
/// succeed. Successful responses are `200 OK` with the authority as body.
/// Every invocation is recorded in order.
#[derive(Debug, Default)]
pub struct ScriptedForwarder {
    always_fail: Vec<String>,
    fail_times: Mutex<HashMap<String, u32>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    loads_seen: Mutex<Vec<usize>>,
}

impl ScriptedForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_failing(mut self, authority: &str) -> Self {
        self.always_fail.push(authority.to_owned());
        self
    }

    pub fn failing_times(self, authority: &str, times: u32) -> Self {
        self.fail_times
            .lock()
            .unwrap()
            .insert(authority.to_owned(), times);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Authorities invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Load counters of the target backend observed during each invocation.
    pub fn loads_seen(&self) -> Vec<usize> {
        self.loads_seen.lock().unwrap().clone()
    }
}

impl Forward for ScriptedForwarder {
    async fn forward(
        &self,
        _req: &BufferedRequest,
        backend: &Backend,
    ) -> tandem::Result<Response<BoxBody>> {
        let name = authority(backend);
        self.calls.lock().unwrap().push(name.clone());
        self.loads_seen
            .lock()
            .unwrap()
            .push(backend.active_connections());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail = self.always_fail.contains(&name) || {
            let mut remaining = self.fail_times.lock().unwrap();
            match remaining.get_mut(&name) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };

        if fail {
            return Err(ProxyError::Upstream(format!("connection refused: {name}")));
        }

        Ok(Response::new(
            Full::new(Bytes::from(name))
                .map_err(|never| -> StdError { match never {} })
                .boxed(),
        ))
    }
}

/// Binds a listener on an OS-assigned port and spawns `service` on every
/// accepted connection until the returned sender fires or is dropped.
async fn spawn_backend<S>(service: S) -> (SocketAddr, oneshot::Sender<()>)
where
    S: hyper::service::Service<
            Request<Incoming>,
            Response = Response<Full<Bytes>>,
            Error = std::convert::Infallible,
        > + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service.clone();
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a local HTTP server that responds to every request with the given
/// status and plain-text body.
pub async fn start_backend(
    status: StatusCode,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    spawn_backend(service_fn(move |_req: Request<Incoming>| async move {
        Ok::<_, std::convert::Infallible>(
            Response::builder()
                .status(status)
                .header("content-type", "text/plain")
                .body(Full::new(Bytes::from(body)))
                .expect("test response must build"),
        )
    }))
    .await
}

/// Starts a backend that echoes the request body, prefixed by the `Host`
/// and `X-Forwarded-For` headers it received.
pub async fn start_echo_backend() -> (SocketAddr, oneshot::Sender<()>) {
    spawn_backend(service_fn(|req: Request<Incoming>| async move {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned()
        };
        let prefix = format!("{}|{}|", header("host"), header("x-forwarded-for"));
        let body = req
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();

        let mut echoed = prefix.into_bytes();
        echoed.extend_from_slice(&body);
        Ok::<_, std::convert::Infallible>(
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from(echoed)))
                .expect("test response must build"),
        )
    }))
    .await
}

/// Starts a backend that sleeps for the given duration before responding.
pub async fn start_slow_backend(
    delay: Duration,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    spawn_backend(service_fn(move |_req: Request<Incoming>| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, std::convert::Infallible>(
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from(body)))
                .expect("test response must build"),
        )
    }))
    .await
}

/// Returns a local address that refuses connections.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind probe socket");
    listener.local_addr().unwrap()
}
