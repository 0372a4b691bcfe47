//! Retry and failover budget for a single logical request.
//!
//! The protocol is a small state machine over [`AttemptState`]: every
//! transport failure is fed to [`RetryPolicy::on_failure`], which either
//! schedules another invocation against the same backend or fails over to a
//! freshly selected one. [`RetryPolicy::admits`] ends the cycle once the
//! attempt budget is spent.
//!
//! The retry counter belongs to the logical request and is not reset on
//! failover, so with the default budget a request makes at most
//! `max_retries + max_attempts` proxy invocations.

use std::time::Duration;

use crate::config::{DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF};

/// Limits applied to every request handled by a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Same-backend retries allowed before failing over.
    pub max_retries: u32,
    /// Pause before each same-backend retry.
    pub backoff: Duration,
    /// Peer selections allowed before rejecting the request.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_RETRY_BACKOFF,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Request-scoped counters threaded through retries and failovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptState {
    /// Current peer selection, starting at 1.
    pub attempt: u32,
    /// Same-backend retries performed so far, starting at 0.
    pub retry: u32,
}

impl AttemptState {
    /// State of a request that has not been dispatched yet.
    pub const fn initial() -> Self {
        Self {
            attempt: 1,
            retry: 0,
        }
    }
}

impl Default for AttemptState {
    fn default() -> Self {
        Self::initial()
    }
}

/// What to do after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Wait for the backoff, then resend to the same backend.
    Retry(AttemptState),
    /// Mark the backend dead and select a new peer.
    Failover(AttemptState),
}

impl RetryPolicy {
    /// Returns `true` if a peer may still be selected in `state`.
    pub fn admits(&self, state: AttemptState) -> bool {
        state.attempt <= self.max_attempts
    }

    /// Transition taken when the proxy invocation in `state` failed.
    pub fn on_failure(&self, state: AttemptState) -> Step {
        if state.retry < self.max_retries {
            Step::Retry(AttemptState {
                retry: state.retry + 1,
                ..state
            })
        } else {
            Step::Failover(AttemptState {
                attempt: state.attempt + 1,
                ..state
            })
        }
    }

    /// Upper bound on proxy invocations for one request.
    pub fn max_invocations(&self) -> u32 {
        self.max_retries + self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives the policy against a backend set that always fails and never
    /// runs out of peers, returning invocations per attempt.
    fn run_to_exhaustion(policy: &RetryPolicy) -> Vec<u32> {
        let mut per_attempt = Vec::new();
        let mut state = AttemptState::initial();

        while policy.admits(state) {
            let mut invocations = 0;
            loop {
                invocations += 1;
                match policy.on_failure(state) {
                    Step::Retry(next) => state = next,
                    Step::Failover(next) => {
                        state = next;
                        break;
                    }
                }
            }
            per_attempt.push(invocations);
        }

        per_attempt
    }

    #[test]
    fn initial_state_is_first_attempt() {
        let state = AttemptState::default();
        assert_eq!(state.attempt, 1);
        assert_eq!(state.retry, 0);
        assert!(RetryPolicy::default().admits(state));
    }

    #[test]
    fn retries_before_failing_over() {
        let policy = RetryPolicy::default();
        let mut state = AttemptState::initial();

        for expected in 1..=3 {
            match policy.on_failure(state) {
                Step::Retry(next) => {
                    assert_eq!(next.retry, expected);
                    assert_eq!(next.attempt, 1);
                    state = next;
                }
                Step::Failover(_) => panic!("failed over after {} retries", expected - 1),
            }
        }

        assert_eq!(
            policy.on_failure(state),
            Step::Failover(AttemptState {
                attempt: 2,
                retry: 3
            })
        );
    }

    #[test]
    fn fourth_attempt_is_not_admitted() {
        let policy = RetryPolicy::default();
        assert!(policy.admits(AttemptState {
            attempt: 3,
            retry: 3
        }));
        assert!(!policy.admits(AttemptState {
            attempt: 4,
            retry: 3
        }));
    }

    #[test]
    fn retry_budget_carries_across_failover() {
        let policy = RetryPolicy::default();
        assert_eq!(run_to_exhaustion(&policy), vec![4, 1, 1]);
    }

    #[test]
    fn total_invocations_are_bounded() {
        let policy = RetryPolicy::default();
        let total: u32 = run_to_exhaustion(&policy).iter().sum();
        assert_eq!(total, policy.max_invocations());
        assert!(total <= 9);
    }

    #[test]
    fn zero_retries_fails_over_immediately() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..Default::default()
        };
        assert_eq!(run_to_exhaustion(&policy), vec![1, 1, 1]);
    }
}
