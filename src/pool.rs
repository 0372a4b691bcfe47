//! Backend pools and peer selection.
//!
//! A [`ServerPool`] owns the ordered backends behind one listener and picks
//! a peer for each request using its configured [`Strategy`]:
//!
//! - **Round-robin** advances a shared [`AtomicUsize`] cursor and scans
//!   forward from it for the first alive backend. The index it lands on is
//!   published back into the cursor, so a run of dead backends is skipped
//!   once instead of being re-scanned by every following request.
//! - **Weighted least-connections** picks the alive backend with the
//!   smallest `active_connections / weight`, with ties going to the
//!   earliest backend in configuration order.
//!
//! Both are lock-free and safe to call concurrently. Load and liveness are
//! read as momentary snapshots, so selection is best-effort under
//! contention.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::config::{ValidatedBackend, ValidatedPool};

/// Peer selection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    #[serde(rename = "round-robin", alias = "round_robin", alias = "rr")]
    RoundRobin,
    #[serde(
        rename = "least-connections",
        alias = "least_connections",
        alias = "lc"
    )]
    LeastConnections,
}

impl Strategy {
    /// Returns `true` if dispatch must hold a load slot on the chosen peer.
    pub fn tracks_load(self) -> bool {
        matches!(self, Self::LeastConnections)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => f.write_str("round-robin"),
            Self::LeastConnections => f.write_str("least-connections"),
        }
    }
}

/// An ordered, fixed set of backends and the selection state over them.
///
/// Cheap to clone; clones share backends and cursor.
#[derive(Debug, Clone)]
pub struct ServerPool {
    strategy: Strategy,
    backends: Arc<Vec<Backend>>,
    /// Index of the last backend handed out by round-robin selection.
    cursor: Arc<AtomicUsize>,
}

impl ServerPool {
    /// Constructs a pool from validated backends, marking all of them alive.
    pub fn from_validated(strategy: Strategy, backends: &[ValidatedBackend]) -> Self {
        let backends = backends.iter().map(Backend::new).collect();
        Self {
            strategy,
            backends: Arc::new(backends),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Constructs the pool described by a validated listener entry.
    pub fn from_config(pool: &ValidatedPool) -> Self {
        Self::from_validated(pool.strategy, &pool.backends)
    }

    /// Returns the selection algorithm of this pool.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Returns all backends in configuration order, alive or not.
    pub fn all(&self) -> &[Backend] {
        &self.backends
    }

    /// Returns the number of backends currently marked alive.
    pub fn alive_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }

    /// Returns the total number of configured backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Returns `true` if no backends are configured.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Picks a peer using this pool's strategy.
    pub fn select(&self) -> Option<Backend> {
        match self.strategy {
            Strategy::RoundRobin => self.next_peer(),
            Strategy::LeastConnections => self.next_peer_least_connections(),
        }
    }

    /// Round-robin selection.
    ///
    /// Advances the cursor by one and scans a full rotation from there,
    /// returning the first alive backend and publishing its index as the
    /// new cursor. Returns `None` if every backend is dead.
    pub fn next_peer(&self) -> Option<Backend> {
        let len = self.backends.len();
        if len == 0 {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::AcqRel).wrapping_add(1) % len;

        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| self.backends[idx].is_alive())
            .map(|idx| {
                self.cursor.store(idx, Ordering::Release);
                self.backends[idx].clone()
            })
    }

    /// Weighted least-connections selection.
    ///
    /// Returns the alive backend with the strictly smallest
    /// `active_connections / weight`; on equal ratios the earlier backend
    /// wins. Returns `None` if every backend is dead.
    pub fn next_peer_least_connections(&self) -> Option<Backend> {
        let mut best: Option<&Backend> = None;
        let mut best_ratio = f64::INFINITY;

        for backend in self.backends.iter().filter(|b| b.is_alive()) {
            let ratio = backend.load_ratio();
            if ratio < best_ratio {
                best_ratio = ratio;
                best = Some(backend);
            }
        }

        best.cloned()
    }
}
