//! Error types and HTTP status code mapping.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

/// Body text returned to clients whenever a request is rejected.
pub const SERVICE_UNAVAILABLE_BODY: &str = "Service not available";

/// Every failure the load balancer can produce, each mapping to a specific
/// HTTP status.
#[derive(Debug)]
pub enum ProxyError {
    /// The configuration file could not be loaded, parsed, or validated.
    Config(String),
    /// A backend URL is malformed or uses an unsupported scheme.
    InvalidBackend(String),
    /// Every backend in the pool is currently marked dead.
    NoPeerAvailable,
    /// The failover budget for a single request has been spent.
    AttemptsExhausted { attempts: u32 },
    /// The backend was unreachable or the connection failed mid-exchange.
    Upstream(String),
    /// A single proxy invocation exceeded its timeout.
    Timeout(Duration),
    /// The request body exceeded the replay buffer limit.
    BodyTooLarge { limit: u64 },
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidBackend(msg) => write!(f, "invalid backend: {msg}"),
            Self::NoPeerAvailable => write!(f, "no live backend available"),
            Self::AttemptsExhausted { attempts } => {
                write!(f, "gave up after {attempts} attempts")
            }
            Self::Upstream(msg) => write!(f, "upstream error: {msg}"),
            Self::Timeout(after) => write!(f, "upstream timed out after {after:?}"),
            Self::BodyTooLarge { limit } => {
                write!(f, "request body exceeds {limit} bytes")
            }
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl ProxyError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoPeerAvailable | Self::AttemptsExhausted { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) | Self::InvalidBackend(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns `true` for failures of the transport to a backend, the only
    /// kind that the retry/failover protocol recovers from.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Timeout(_))
    }

    /// Converts this error into a plain-text HTTP response.
    ///
    /// Rejections render the fixed [`SERVICE_UNAVAILABLE_BODY`] so clients
    /// never see backend details.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.status_code();
        let body = match status {
            StatusCode::SERVICE_UNAVAILABLE => SERVICE_UNAVAILABLE_BODY.to_owned(),
            _ => self.to_string(),
        };

        Response::builder()
            .status(status)
            .header("content-type", "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| {
                let mut fallback = Response::new(Full::new(Bytes::new()));
                *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}
