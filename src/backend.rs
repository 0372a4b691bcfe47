//! Per-backend liveness and load tracking.
//!
//! Each backend is represented by a [`Backend`] holding its validated URI,
//! weight, a liveness flag, and a counter of in-flight proxied requests.
//! Every field is synchronized on its own: the flag is an [`AtomicBool`]
//! and the counter an [`AtomicUsize`], so no operation ever spans both.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config::ValidatedBackend;

/// Runtime state for a single backend.
///
/// Cheap to clone; every clone observes the same state.
#[derive(Debug, Clone)]
pub struct Backend {
    state: Arc<InnerState>,
}

#[derive(Debug)]
struct InnerState {
    /// The validated backend URI.
    uri: hyper::Uri,
    /// Relative capacity for least-connections selection.
    weight: u32,
    /// Whether this backend currently appears reachable.
    alive: AtomicBool,
    /// Number of proxied requests currently holding a [`LoadGuard`].
    active_connections: AtomicUsize,
}

/// An in-flight slot on a [`Backend`].
///
/// Created by [`Backend::acquire`], which increments the load counter;
/// dropping the guard decrements it again. Because release happens in
/// `Drop`, it runs on every exit path, including early returns,
/// cancellation of the owning future, and unwinding.
#[derive(Debug)]
#[must_use = "the load slot is released as soon as the guard is dropped"]
pub struct LoadGuard {
    backend: Backend,
}

impl Backend {
    /// Creates a new alive backend from a validated configuration entry.
    pub fn new(backend: &ValidatedBackend) -> Self {
        Self {
            state: Arc::new(InnerState {
                uri: backend.uri.clone(),
                weight: backend.weight,
                alive: AtomicBool::new(true),
                active_connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the backend URI.
    pub fn uri(&self) -> &hyper::Uri {
        &self.state.uri
    }

    /// Returns the configured weight.
    pub fn weight(&self) -> u32 {
        self.state.weight
    }

    /// Returns `true` if this backend is currently considered alive.
    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::Acquire)
    }

    /// Sets the liveness flag, returning the previous value.
    ///
    /// Requests already dispatched to this backend are unaffected.
    pub fn set_alive(&self, alive: bool) -> bool {
        self.state.alive.swap(alive, Ordering::AcqRel)
    }

    /// Returns a snapshot of the number of in-flight requests.
    pub fn active_connections(&self) -> usize {
        self.state.active_connections.load(Ordering::Acquire)
    }

    /// Returns the load normalized by weight, as compared by
    /// least-connections selection.
    pub fn load_ratio(&self) -> f64 {
        self.active_connections() as f64 / f64::from(self.state.weight)
    }

    /// Claims an in-flight slot, held until the returned guard is dropped.
    pub fn acquire(&self) -> LoadGuard {
        self.state.active_connections.fetch_add(1, Ordering::AcqRel);
        LoadGuard {
            backend: self.clone(),
        }
    }

    /// Returns `true` if both handles refer to the same backend.
    pub fn ptr_eq(&self, other: &Backend) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        // Paired with the increment in `acquire`, so this never underflows.
        self.backend
            .state
            .active_connections
            .fetch_sub(1, Ordering::AcqRel);
    }
}
