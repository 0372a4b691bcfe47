//! Periodic backend reachability checks.
//!
//! The [`HealthChecker`] walks every backend of every pool once per
//! interval, opening a TCP connection to the backend's address with a
//! bounded timeout. A successful connect marks the backend alive and any
//! failure marks it dead; a single probe result flips liveness either way.
//!
//! Probes run sequentially on their own task. They only touch each
//! backend's liveness flag, so a slow probe delays the next status update
//! and never request serving.

use std::time::Duration;

use hyper::Uri;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::pool::ServerPool;

/// Probes the backends of a fixed set of pools.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    pools: Vec<ServerPool>,
    probe_timeout: Duration,
}

impl HealthChecker {
    /// Creates a checker over `pools`, bounding each probe by `probe_timeout`.
    pub fn new(pools: Vec<ServerPool>, probe_timeout: Duration) -> Self {
        Self {
            pools,
            probe_timeout,
        }
    }

    /// Runs one sweep over every backend of every pool.
    pub async fn check_all(&self) {
        info!("starting health check");
        for pool in &self.pools {
            self.check_pool(pool).await;
        }
        info!("health check completed");
    }

    /// Probes each backend of `pool` in order and records the result.
    pub async fn check_pool(&self, pool: &ServerPool) {
        for backend in pool.all() {
            self.check_backend(backend).await;
        }
    }

    /// Probes a single backend and records the result, returning it.
    pub async fn check_backend(&self, backend: &Backend) -> bool {
        let alive = probe(backend.uri(), self.probe_timeout).await;
        let was_alive = backend.set_alive(alive);

        match (was_alive, alive) {
            (false, true) => info!(upstream = %backend.uri(), "backend recovered"),
            (true, false) => warn!(upstream = %backend.uri(), "backend went down"),
            _ => {}
        }
        info!(
            upstream = %backend.uri(),
            status = if alive { "UP" } else { "DOWN" },
            "health probe"
        );

        alive
    }
}

/// Returns `true` if a TCP connection to the authority of `uri` can be
/// established within `limit`.
pub async fn probe(uri: &Uri, limit: Duration) -> bool {
    let Some(authority) = uri.authority() else {
        warn!(%uri, "cannot probe backend without authority");
        return false;
    };

    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    let port = authority.port_u16().unwrap_or(80);

    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(%uri, error = %e, "backend unreachable");
            false
        }
        Err(_) => {
            debug!(%uri, timeout = ?limit, "backend probe timed out");
            false
        }
    }
}

/// Spawns a background task running [`HealthChecker::check_all`] every
/// `period`, starting one period from now.
pub fn spawn_health_checker(checker: HealthChecker, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            checker.check_all().await;
        }
    })
}
