//! Three-state circuit breaker guarding a single outbound call site.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl Default for CircuitState {
    fn default() -> Self {
        CircuitState::Closed
    }
}

pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    last_failure_at: RwLock<Option<Instant>>,
    failure_threshold: u32,
    timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            last_failure_at: RwLock::new(None),
            failure_threshold,
            timeout,
        }
    }

    /// Returns whether a call may proceed right now. `Open` transitions to
    /// `HalfOpen` in place once the reset timeout has elapsed, admitting
    /// exactly the call that observed the transition.
    pub fn can_execute(&self) -> bool {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_at
                    .read()
                    .map(|t| t.elapsed() >= self.timeout)
                    .unwrap_or(false);
                if elapsed {
                    let mut state = self.state.write();
                    if *state == CircuitState::Open {
                        *state = CircuitState::HalfOpen;
                        return true;
                    }
                    *state == CircuitState::HalfOpen
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        *self.state.write() = CircuitState::Closed;
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        *self.last_failure_at.write() = Some(Instant::now());
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        let mut state = self.state.write();
        match *state {
            CircuitState::HalfOpen => *state = CircuitState::Open,
            CircuitState::Closed if failures >= self.failure_threshold => {
                *state = CircuitState::Open;
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn reset(&self) {
        *self.state.write() = CircuitState::Closed;
        *self.last_failure_at.write() = None;
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_open_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(3, Duration::from_millis(50));
        assert!(cb.can_execute());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn half_open_admits_one_probe_after_timeout() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.can_execute());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_success_closes_and_resets_counter() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.can_execute());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
