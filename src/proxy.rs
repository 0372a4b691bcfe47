//! The HTTP proxy capability: one request, one backend, one response.
//!
//! [`HttpForwarder`] rewrites a [`BufferedRequest`] to target the chosen
//! backend, sends it over a shared pooled client, and streams the backend's
//! response back without buffering. Connection failures and timeouts are
//! reported as transport errors for the dispatcher to retry; every HTTP
//! response, 5xx included, is passed through as-is.

use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::debug;

use crate::backend::Backend;
use crate::dispatch::{BufferedRequest, Forward};
use crate::{BoxBody, ProxyError, Result, RuntimeConfig, StdError, headers};

/// The HTTP client type used to reach backends.
pub type HttpClient = Client<HttpConnector, BoxBody>;

/// Constructs the pooled [`HttpClient`] shared by every dispatcher.
pub fn build_client(config: &RuntimeConfig) -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(config.connect_timeout));

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build(connector)
}

/// Forwards requests over an [`HttpClient`], bounding each invocation by a
/// timeout.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: HttpClient,
    request_timeout: Duration,
}

impl HttpForwarder {
    /// Creates a forwarder that bounds each invocation by `request_timeout`.
    pub fn new(client: HttpClient, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }

    /// Builds a forwarder with its own client from the runtime settings.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(build_client(config), config.request_timeout)
    }
}

impl Forward for HttpForwarder {
    async fn forward(&self, req: &BufferedRequest, backend: &Backend) -> Result<Response<BoxBody>> {
        let target = backend.uri();
        let authority = target
            .authority()
            .ok_or_else(|| ProxyError::InvalidBackend(format!("{target} has no authority")))?;

        let mut headers = req.headers().clone();
        headers::strip_hop_by_hop(&mut headers);
        headers::inject_forwarding_headers(&mut headers, req.client_addr());
        headers::rewrite_host(&mut headers, authority);

        let body = Full::new(req.body().clone())
            .map_err(|never| -> StdError { match never {} })
            .boxed();
        let mut outbound = Request::new(body);
        *outbound.method_mut() = req.method().clone();
        *outbound.uri_mut() = rewrite_uri(req.uri(), target)?;
        *outbound.headers_mut() = headers;

        debug!(upstream_uri = %outbound.uri(), "forwarding request");

        let start = Instant::now();
        let mut resp = match timeout(self.request_timeout, self.client.request(outbound)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(e.into()),
            Err(_elapsed) => return Err(ProxyError::Timeout(self.request_timeout)),
        };

        debug!(
            status = resp.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            upstream = %target,
            "upstream responded"
        );

        headers::strip_hop_by_hop(resp.headers_mut());
        Ok(resp.map(|body| body.map_err(|e| -> StdError { Box::new(e) }).boxed()))
    }
}

/// Rewrites the original request URI to target `backend`, preserving the
/// path and query string.
fn rewrite_uri(original: &Uri, backend: &Uri) -> Result<Uri> {
    let scheme = backend
        .scheme()
        .ok_or_else(|| ProxyError::InvalidBackend(format!("{backend} has no scheme")))?;
    let authority = backend
        .authority()
        .ok_or_else(|| ProxyError::InvalidBackend(format!("{backend} has no authority")))?;
    let path_and_query = original
        .path_and_query()
        .map_or("/", |pq| pq.as_str());

    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build upstream URI: {e}")))
}
