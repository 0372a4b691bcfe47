//! Configuration loading, validation, and pre-computed runtime state.
//!
//! The balancer reads its configuration exactly once at startup. Every
//! backend URL is parsed and every weight checked before a single listener
//! is bound, so the process never serves with an inconsistent backend set.
//!
//! Two on-disk shapes are accepted: a full document with a `pools` list and
//! optional tuning sections, or a bare list of pools as written by older
//! deployments (`[{port, strategy, backends: [{url, weight}]}]`).

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::Strategy;
use crate::retry::RetryPolicy;
use crate::{ProxyError, Result};

/// Default address every pool listener binds to.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Default weight assigned to backends when none is specified.
pub const DEFAULT_BACKEND_WEIGHT: i64 = 1;

/// Default period between health-check sweeps.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(120);

/// Default bound on a single reachability probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of same-backend retries per logical request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default pause before each same-backend retry.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Default number of peer selections per logical request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default connect timeout for establishing backend TCP connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a single proxy invocation.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle timeout for pooled backend connections.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum number of idle connections kept per backend host.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Default maximum request body buffered for replay: 10 MiB.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Raw configuration as deserialized from the configuration file.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// IP address every listener binds to (default `"0.0.0.0"`).
    #[serde(default)]
    pub bind: Option<String>,
    /// One entry per listener/strategy.
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    /// Background reachability probing.
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    /// Retry and failover budget per request.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Connect timeout in milliseconds for backend connections (default: 5000).
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Timeout in milliseconds for a single proxy invocation (default: 30000).
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Idle timeout in milliseconds for pooled connections (default: 60000).
    #[serde(default)]
    pub pool_idle_timeout_ms: Option<u64>,
    /// Maximum idle connections kept per backend host (default: 32).
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    /// Maximum request body size in bytes buffered for retries (default: 10 MiB).
    #[serde(default)]
    pub max_body_size: Option<u64>,
    /// Log filter used when `RUST_LOG` is unset (default: `info`).
    #[serde(default)]
    pub log_level: Option<String>,
}

/// A single listener and the backends it balances across.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Port the listener binds to.
    pub port: u16,
    /// Peer selection algorithm for this pool.
    pub strategy: Strategy,
    /// Backends in selection order.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// Configuration for a single backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// The backend address (e.g. `"http://10.0.0.5:8080"`).
    pub url: String,
    /// Relative capacity. Must be positive.
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_weight() -> i64 {
    DEFAULT_BACKEND_WEIGHT
}

/// Health checker tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    /// Interval between sweeps in milliseconds (default: 120000).
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Per-probe timeout in milliseconds (default: 2000).
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_health_interval_ms() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL.as_millis() as u64
}

fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT.as_millis() as u64
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Retry/failover budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Same-backend retries before the backend is marked dead (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause before each retry in milliseconds (default: 10).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Peer selections before the request is rejected (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF.as_millis() as u64
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Validated backend descriptor produced from [`BackendConfig`].
#[derive(Debug, Clone)]
pub struct ValidatedBackend {
    /// The parsed backend URI (scheme and authority only are used).
    pub uri: hyper::Uri,
    /// Relative capacity, guaranteed non-zero.
    pub weight: u32,
}

/// Validated listener descriptor produced from [`PoolConfig`].
#[derive(Debug, Clone)]
pub struct ValidatedPool {
    /// Socket address the listener binds to.
    pub listen: SocketAddr,
    /// Peer selection algorithm.
    pub strategy: Strategy,
    /// Backends in configuration order, never empty.
    pub backends: Vec<ValidatedBackend>,
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and handed to the listeners, dispatchers and
/// health checker that need it.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// One validated pool per listener, never empty.
    pub pools: Vec<ValidatedPool>,
    /// Period between health-check sweeps.
    pub health_check_interval: Duration,
    /// Bound on a single reachability probe.
    pub probe_timeout: Duration,
    /// Retry/failover budget shared by every dispatcher.
    pub retry: RetryPolicy,
    /// Connect timeout for backend TCP connections.
    pub connect_timeout: Duration,
    /// Timeout for a single proxy invocation.
    pub request_timeout: Duration,
    /// Idle timeout for pooled backend connections.
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per backend host.
    pub pool_max_idle_per_host: usize,
    /// Maximum request body size buffered for replay.
    pub max_body_size: u64,
    /// Fallback log filter.
    pub log_level: String,
}

/// Validates a single backend entry.
fn validate_backend(backend: &BackendConfig) -> Result<ValidatedBackend> {
    let url = backend.url.trim();
    if url.is_empty() {
        return Err(ProxyError::InvalidBackend(
            "backend url must not be empty".into(),
        ));
    }

    let uri = url
        .parse::<hyper::Uri>()
        .map_err(|e| ProxyError::InvalidBackend(format!("{url}: {e}")))?;

    match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
        Some(scheme) => {
            return Err(ProxyError::InvalidBackend(format!(
                "unsupported scheme \"{scheme}\" in {url}"
            )));
        }
        None => {
            return Err(ProxyError::InvalidBackend(format!(
                "backend url has no scheme: {url}"
            )));
        }
    }

    uri.authority().ok_or_else(|| {
        ProxyError::InvalidBackend(format!("backend url has no authority: {url}"))
    })?;

    if backend.weight <= 0 {
        return Err(ProxyError::Config(format!(
            "backend weight must be positive, got {} for {url}",
            backend.weight
        )));
    }
    let weight = u32::try_from(backend.weight)
        .map_err(|_| ProxyError::Config(format!("backend weight too large for {url}")))?;

    Ok(ValidatedBackend { uri, weight })
}

fn validate_pool(bind: IpAddr, pool: &PoolConfig) -> Result<ValidatedPool> {
    if pool.port == 0 {
        return Err(ProxyError::Config("pool port must be non-zero".into()));
    }

    if pool.backends.is_empty() {
        return Err(ProxyError::Config(format!(
            "pool on port {} has no backends",
            pool.port
        )));
    }

    let backends = pool
        .backends
        .iter()
        .map(validate_backend)
        .collect::<Result<Vec<_>>>()?;

    Ok(ValidatedPool {
        listen: SocketAddr::new(bind, pool.port),
        strategy: pool.strategy,
        backends,
    })
}

impl Config {
    /// Loads configuration from a file. Files ending in `.json` are read as
    /// JSON, everything else as YAML.
    ///
    /// Returns a [`ProxyError::Config`] if the file cannot be read or its
    /// contents fail deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let path = file_path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("failed to open {}: {e}", path.display())))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::from_yaml_str(&contents)
        }
    }

    /// Parses a YAML document, accepting either a full document or a bare
    /// list of pools.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(contents)
            .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))?;

        if value.is_sequence() {
            let pools = serde_yaml::from_value(value)
                .map_err(|e| ProxyError::Config(format!("failed to parse pools: {e}")))?;
            return Ok(Self {
                pools,
                ..Default::default()
            });
        }

        serde_yaml::from_value(value)
            .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))
    }

    /// Parses a JSON document, accepting either a full document or a bare
    /// list of pools.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))?;

        if value.is_array() {
            let pools = serde_json::from_value(value)
                .map_err(|e| ProxyError::Config(format!("failed to parse pools: {e}")))?;
            return Ok(Self {
                pools,
                ..Default::default()
            });
        }

        serde_json::from_value(value)
            .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields, producing a [`RuntimeConfig`].
    ///
    /// At least one pool must be configured, every pool needs at least one
    /// backend, and listener ports must be distinct.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        if self.pools.is_empty() {
            return Err(ProxyError::Config(
                "at least one pool must be configured".into(),
            ));
        }

        let bind_str = self.bind.as_deref().unwrap_or(DEFAULT_BIND_ADDR);
        let bind = bind_str.parse::<IpAddr>().map_err(|e| {
            ProxyError::Config(format!("invalid bind address \"{bind_str}\": {e}"))
        })?;

        let mut ports = HashSet::new();
        if let Some(dup) = self.pools.iter().find(|p| !ports.insert(p.port)) {
            return Err(ProxyError::Config(format!(
                "port {} is used by more than one pool",
                dup.port
            )));
        }

        let pools = self
            .pools
            .iter()
            .map(|p| validate_pool(bind, p))
            .collect::<Result<Vec<_>>>()?;

        let health = self.health_check.unwrap_or_default();
        if health.interval_ms == 0 || health.timeout_ms == 0 {
            return Err(ProxyError::Config(
                "health check interval and timeout must be non-zero".into(),
            ));
        }

        let retry = self.retry.unwrap_or_default();
        if retry.max_attempts == 0 {
            return Err(ProxyError::Config("max_attempts must be at least 1".into()));
        }

        Ok(RuntimeConfig {
            pools,
            health_check_interval: Duration::from_millis(health.interval_ms),
            probe_timeout: Duration::from_millis(health.timeout_ms),
            retry: RetryPolicy {
                max_retries: retry.max_retries,
                backoff: Duration::from_millis(retry.backoff_ms),
                max_attempts: retry.max_attempts,
            },
            connect_timeout: self
                .connect_timeout_ms
                .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis),
            request_timeout: self
                .request_timeout_ms
                .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_millis),
            pool_idle_timeout: self
                .pool_idle_timeout_ms
                .map_or(DEFAULT_POOL_IDLE_TIMEOUT, Duration::from_millis),
            pool_max_idle_per_host: self
                .pool_max_idle_per_host
                .unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST),
            max_body_size: self.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE),
            log_level: self
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned()),
        })
    }
}
