use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::config::BreakerConfig;
use crate::error::RelayError;
use crate::telemetry;

/// Circuit breaker states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerState {
    /// Normal operation, calls pass through.
    Closed,
    /// Probing after the reset timeout; limited calls pass through.
    HalfOpen,
    /// Short-circuiting; calls fail fast with [`RelayError::BreakerOpen`].
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }

    /// Value exported on the `circuit_breaker_state` gauge.
    pub fn gauge_value(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type TransitionHook = Box<dyn Fn(BreakerState, BreakerState) + Send + Sync>;

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// Tri-state circuit breaker guarding publish calls.
///
/// State observation takes the read lock and returns a snapshot; any
/// transition drops it, re-acquires the write lock, and re-checks the
/// state before mutating. A caller that sees CLOSED and proceeds may race
/// a concurrent trip; the final outcome is still recorded under the write
/// lock.
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    inner: RwLock<BreakerInner>,
    on_transition: Option<TransitionHook>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        telemetry::set_breaker_state(BreakerState::Closed);
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            reset_timeout: config.reset_timeout(),
            inner: RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
            on_transition: None,
        }
    }

    /// Install a callback invoked on every state transition.
    pub fn with_transition_hook(
        mut self,
        hook: impl Fn(BreakerState, BreakerState) + Send + Sync + 'static,
    ) -> Self {
        self.on_transition = Some(Box::new(hook));
        self
    }

    /// Gate a call. `Ok` means the caller may proceed and must report the
    /// outcome via [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn try_acquire(&self) -> Result<(), RelayError> {
        {
            let inner = self.inner.read();
            match inner.state {
                BreakerState::Closed | BreakerState::HalfOpen => return Ok(()),
                BreakerState::Open => {
                    let waited_out = inner
                        .last_failure
                        .map(|at| at.elapsed() >= self.reset_timeout)
                        .unwrap_or(true);
                    if !waited_out {
                        return Err(RelayError::BreakerOpen);
                    }
                }
            }
        }

        // Reset window elapsed; re-check under the write lock before probing.
        let mut inner = self.inner.write();
        if inner.state == BreakerState::Open {
            let waited_out = inner
                .last_failure
                .map(|at| at.elapsed() >= self.reset_timeout)
                .unwrap_or(true);
            if waited_out {
                self.transition(&mut inner, BreakerState::HalfOpen);
            }
        }
        match inner.state {
            BreakerState::Open => Err(RelayError::BreakerOpen),
            _ => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        inner.failures = 0;
        inner.successes += 1;
        if inner.state == BreakerState::HalfOpen && inner.successes >= self.success_threshold {
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write();
        inner.successes = 0;
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed if inner.failures >= self.failure_threshold => {
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open);
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        inner.failures = 0;
        inner.successes = 0;

        telemetry::record_breaker_trip(from, to);
        if let Some(hook) = &self.on_transition {
            hook(from, to);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.read().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.read().failures
    }

    pub fn success_count(&self) -> u32 {
        self.inner.read().successes
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn breaker(failures: u32, successes: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(&BreakerConfig {
            enabled: true,
            failure_threshold: failures,
            success_threshold: successes,
            reset_timeout_ms: reset_ms,
        })
    }

    #[test]
    fn stays_closed_below_the_failure_threshold() {
        let cb = breaker(3, 1, 60_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 2);
    }

    #[test]
    fn success_resets_the_consecutive_failure_count() {
        let cb = breaker(3, 1, 60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn opens_at_the_failure_threshold_and_short_circuits() {
        let cb = breaker(2, 1, 60_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(matches!(cb.try_acquire(), Err(RelayError::BreakerOpen)));
    }

    #[test]
    fn probes_half_open_after_the_reset_timeout() {
        let cb = breaker(1, 1, 10);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(20));
        cb.try_acquire().unwrap();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_enough_successes() {
        let cb = breaker(1, 2, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        cb.try_acquire().unwrap();

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let cb = breaker(1, 2, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        cb.try_acquire().unwrap();

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn counters_reset_on_every_transition() {
        let cb = breaker(2, 2, 10);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.success_count(), 0);
    }

    #[test]
    fn transition_hook_sees_the_full_path() {
        let transitions: Arc<parking_lot::Mutex<Vec<(BreakerState, BreakerState)>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = transitions.clone();
        let cb = breaker(1, 1, 10)
            .with_transition_hook(move |from, to| seen.lock().push((from, to)));

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        cb.try_acquire().unwrap();
        cb.record_success();

        let path = transitions.lock().clone();
        assert_eq!(
            path,
            vec![
                (BreakerState::Closed, BreakerState::Open),
                (BreakerState::Open, BreakerState::HalfOpen),
                (BreakerState::HalfOpen, BreakerState::Closed),
            ]
        );
    }
}
