//!
//! An HTTP load balancer built on [Hyper].
//!
//! Each configured pool gets its own listener and its own fixed, ordered set
//! of backends. Requests are spread with either round-robin or weighted
//! least-connections selection; transport failures are retried against the
//! same backend and then failed over to another one, and a background task
//! keeps each backend's liveness flag current.
//!
//! [Hyper]: https://hyper.rs/

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod headers;
pub mod health;
pub mod pool;
pub mod proxy;
pub mod retry;
pub mod server;

pub use backend::{Backend, LoadGuard};
pub use config::{
    BackendConfig, Config, HealthCheckConfig, PoolConfig, RetryConfig, RuntimeConfig,
    ValidatedBackend, ValidatedPool,
};
pub use dispatch::{BufferedRequest, Dispatcher, Forward, error_response};
pub use error::ProxyError;
pub use health::{HealthChecker, probe, spawn_health_checker};
pub use pool::{ServerPool, Strategy};
pub use proxy::{HttpClient, HttpForwarder, build_client};
pub use retry::{AttemptState, RetryPolicy, Step};
pub use server::{serve, shutdown_signal};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
pub type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased body used for forwarded requests and streamed responses.
pub type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, StdError>;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, ProxyError>;
