//! Circuit breaker for upstream rate limiting.
//!
//! When the feed answers HTTP 429 the breaker opens for the cooldown the feed
//! asked for (`Retry-After`), or a default. While open, fetches fail fast so
//! the poll loop logs a failed cycle instead of hammering the feed.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation: requests are allowed.
    Closed,
    /// Tripped: requests are refused until `until`.
    Open { until: Instant },
}

/// Fail-fast guard in front of a rate-limited feed.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    default_cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(default_cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed),
            default_cooldown,
        }
    }

    /// One-minute default, matching the poll cadence.
    pub fn default_provider() -> Self {
        Self::new(Duration::from_secs(60))
    }

    fn state(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check if requests are currently allowed.
    pub fn is_allowed(&self) -> bool {
        let mut state = self.state();
        match *state {
            BreakerState::Closed => true,
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    *state = BreakerState::Closed;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Open the breaker for `cooldown`, or the default when the feed gave none.
    pub fn trip(&self, cooldown: Option<Duration>) {
        let cooldown = cooldown.unwrap_or(self.default_cooldown);
        *self.state() = BreakerState::Open {
            until: Instant::now() + cooldown,
        };
    }

    /// Close the breaker after a successful request.
    pub fn record_success(&self) {
        *self.state() = BreakerState::Closed;
    }

    /// Remaining cooldown time (zero if not tripped).
    pub fn remaining_cooldown(&self) -> Duration {
        match *self.state() {
            BreakerState::Closed => Duration::ZERO,
            BreakerState::Open { until } => until.saturating_duration_since(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new(Duration::from_secs(60));
        assert!(cb.is_allowed());
        assert_eq!(cb.remaining_cooldown(), Duration::ZERO);
    }

    #[test]
    fn trip_uses_default_cooldown() {
        let cb = CircuitBreaker::new(Duration::from_secs(60));
        cb.trip(None);
        assert!(!cb.is_allowed());
        assert!(cb.remaining_cooldown() > Duration::from_secs(50));
    }

    #[test]
    fn trip_honors_explicit_cooldown() {
        let cb = CircuitBreaker::new(Duration::from_secs(60));
        cb.trip(Some(Duration::from_secs(5)));
        assert!(cb.remaining_cooldown() <= Duration::from_secs(5));
    }

    #[test]
    fn success_closes() {
        let cb = CircuitBreaker::new(Duration::from_secs(60));
        cb.trip(None);
        cb.record_success();
        assert!(cb.is_allowed());
    }

    #[test]
    fn expires_after_cooldown() {
        let cb = CircuitBreaker::new(Duration::from_secs(60));
        cb.trip(Some(Duration::from_millis(10)));
        assert!(!cb.is_allowed());
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.is_allowed());
    }
}
