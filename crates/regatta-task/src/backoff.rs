//! Placement backoff policy.
//!
//! A task that fails to find a host backs off exponentially before it may
//! re-enter placement: each consecutive failure doubles the backoff from
//! `min_backoff` up to `max_backoff`, and a successful placement resets it.

use std::time::Duration;

/// Bounds for the per-task placement backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Per-task backoff state.
#[derive(Debug, Clone)]
pub struct PlacementBackoff {
    policy: BackoffPolicy,
    current: Duration,
    /// Unix milliseconds before which the task may not re-enter placement.
    not_before_ms: u64,
}

impl PlacementBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: Duration::ZERO,
            not_before_ms: 0,
        }
    }

    /// Record a "no host matched" round; returns the new backoff.
    pub fn on_no_match(&mut self, now_ms: u64) -> Duration {
        self.current = if self.current.is_zero() {
            self.policy.min_backoff
        } else {
            (self.current * 2).min(self.policy.max_backoff)
        };
        self.not_before_ms = now_ms + self.current.as_millis() as u64;
        self.current
    }

    /// A successful placement clears all backoff state.
    pub fn on_success(&mut self) {
        self.current = Duration::ZERO;
        self.not_before_ms = 0;
    }

    /// Whether the task may be handed to the placement engine.
    pub fn eligible(&self, now_ms: u64) -> bool {
        now_ms >= self.not_before_ms
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn not_before_ms(&self) -> u64 {
        self.not_before_ms
    }
}
