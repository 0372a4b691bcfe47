//! Per-request orchestration: peer selection, proxying, retry and failover.
//!
//! A [`Dispatcher`] serves every request arriving on one listener against
//! that listener's [`ServerPool`]. For each request it:
//!
//! 1. Buffers the body once (bounded by the configured limit) so the same
//!    request can be resent on retry.
//! 2. Selects a peer; if none is alive the request is rejected with 503.
//! 3. On least-connections pools, claims a load slot on the peer that is
//!    held until the response body has been fully streamed or the peer is
//!    abandoned.
//! 4. Invokes the [`Forward`] capability. Transport failures drive the
//!    [`RetryPolicy`] state machine: a bounded number of same-backend
//!    retries with a fixed backoff, then the backend is marked dead and a
//!    new peer is selected. Once the attempt budget is spent the request
//!    is rejected with 503.
//!
//! HTTP responses from a backend, whatever their status, are successes and
//! are streamed to the client unmodified.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Frame, SizeHint};
use hyper::{HeaderMap, Method, Request, Response, Uri};
use tracing::{Instrument, debug, info, warn};

use crate::backend::{Backend, LoadGuard};
use crate::retry::{AttemptState, RetryPolicy, Step};
use crate::{BoxBody, ProxyError, Result, ServerPool, StdError, headers};

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// The proxy capability: sends one request to one backend.
///
/// Implementations report unreachable backends, broken connections, and
/// timeouts as [`ProxyError::Upstream`] or [`ProxyError::Timeout`]; only
/// those are retried. Any HTTP response is returned as `Ok`.
pub trait Forward: Send + Sync + 'static {
    /// Forwards `req` to `backend` and returns its response.
    fn forward(
        &self,
        req: &BufferedRequest,
        backend: &Backend,
    ) -> impl Future<Output = Result<Response<BoxBody>>> + Send;
}

/// An inbound request whose body has been read into memory so that it can
/// be sent more than once.
#[derive(Debug, Clone)]
pub struct BufferedRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    client_addr: SocketAddr,
}

impl BufferedRequest {
    /// Reads the body of `req`, failing with [`ProxyError::BodyTooLarge`]
    /// once more than `limit` bytes have arrived.
    pub async fn from_request<B>(
        req: Request<B>,
        client_addr: SocketAddr,
        limit: u64,
    ) -> Result<Self>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<StdError>,
    {
        if headers::content_length_exceeds(req.headers(), limit) {
            return Err(ProxyError::BodyTooLarge { limit });
        }

        let (parts, body) = req.into_parts();
        let limit_usize = usize::try_from(limit).unwrap_or(usize::MAX);
        let body = Limited::new(body, limit_usize)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    ProxyError::BodyTooLarge { limit }
                } else {
                    ProxyError::Internal(format!("failed to read request body: {e}"))
                }
            })?
            .to_bytes();

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            client_addr,
        })
    }

    /// Builds a buffered request from already-available parts.
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_addr: SocketAddr,
    ) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            client_addr,
        }
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the URI as received from the client.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Returns the headers as received from the client.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the buffered body, resent unchanged on every invocation.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the address of the connecting client.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }
}

/// Serves requests for one pool through a [`Forward`] capability.
pub struct Dispatcher<F> {
    pool: ServerPool,
    forwarder: Arc<F>,
    policy: RetryPolicy,
    max_body_size: u64,
}

impl<F> Clone for Dispatcher<F> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            forwarder: Arc::clone(&self.forwarder),
            policy: self.policy,
            max_body_size: self.max_body_size,
        }
    }
}

impl<F: Forward> Dispatcher<F> {
    /// Creates a dispatcher over `pool`.
    pub fn new(pool: ServerPool, forwarder: F, policy: RetryPolicy, max_body_size: u64) -> Self {
        Self {
            pool,
            forwarder: Arc::new(forwarder),
            policy,
            max_body_size,
        }
    }

    /// Returns the pool this dispatcher selects from.
    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }

    /// Returns the proxy capability requests are sent through.
    pub fn forwarder(&self) -> &F {
        &self.forwarder
    }

    /// Handles a request, converting any rejection into its HTTP response.
    pub async fn dispatch<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<BoxBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<StdError>,
    {
        self.handle(req, client_addr)
            .await
            .unwrap_or_else(error_response)
    }

    /// Handles a request, returning the backend response or the reason it
    /// was rejected.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<StdError>,
    {
        let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!(
            "request",
            id = request_id,
            method = %req.method(),
            uri = %req.uri(),
            client = %client_addr,
            pool = %self.pool.strategy(),
        );

        async move {
            let buffered = BufferedRequest::from_request(req, client_addr, self.max_body_size)
                .await
                .inspect_err(|e| warn!(error = %e, "rejecting request body"))?;
            self.handle_buffered(&buffered).await
        }
        .instrument(span)
        .await
    }

    /// Runs the retry/failover state machine for an already buffered request.
    pub async fn handle_buffered(&self, req: &BufferedRequest) -> Result<Response<BoxBody>> {
        let mut state = AttemptState::initial();

        'select: loop {
            if !self.policy.admits(state) {
                warn!(
                    attempts = state.attempt - 1,
                    path = req.uri().path(),
                    "max attempts reached, terminating"
                );
                return Err(ProxyError::AttemptsExhausted {
                    attempts: state.attempt - 1,
                });
            }

            let Some(peer) = self.pool.select() else {
                warn!(attempt = state.attempt, "no live backend available");
                return Err(ProxyError::NoPeerAvailable);
            };
            let slot = self.pool.strategy().tracks_load().then(|| peer.acquire());
            debug!(
                upstream = %peer.uri(),
                attempt = state.attempt,
                load = peer.active_connections(),
                "selected peer"
            );

            loop {
                let err = match self.forwarder.forward(req, &peer).await {
                    Ok(resp) => return Ok(hold_slot_until_streamed(resp, slot)),
                    Err(e) if e.is_transport() => e,
                    Err(e) => return Err(e),
                };

                warn!(
                    upstream = %peer.uri(),
                    attempt = state.attempt,
                    retry = state.retry,
                    error = %err,
                    "proxy invocation failed"
                );

                match self.policy.on_failure(state) {
                    Step::Retry(next) => {
                        tokio::time::sleep(self.policy.backoff).await;
                        state = next;
                    }
                    Step::Failover(next) => {
                        if peer.set_alive(false) {
                            warn!(
                                upstream = %peer.uri(),
                                "retries exhausted, marking backend down"
                            );
                        }
                        info!(attempt = next.attempt, "failing over to another backend");
                        state = next;
                        continue 'select;
                    }
                }
            }
        }
    }
}

/// Renders a rejection as a response with the streaming body type.
pub fn error_response(err: ProxyError) -> Response<BoxBody> {
    err.into_response()
        .map(|body| body.map_err(|never| -> StdError { match never {} }).boxed())
}

fn hold_slot_until_streamed(
    resp: Response<BoxBody>,
    slot: Option<LoadGuard>,
) -> Response<BoxBody> {
    match slot {
        Some(slot) => resp.map(|inner| {
            TrackedBody {
                inner,
                _slot: slot,
            }
            .boxed()
        }),
        None => resp,
    }
}

/// A response body that keeps its backend's load slot claimed until the
/// body is dropped.
struct TrackedBody {
    inner: BoxBody,
    _slot: LoadGuard,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = StdError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
