//! Bounded retry with exponential backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::{RangeError, Result, RetryConfig, Telemetry};

/// Longest single sleep between checks of the closed flag.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Retry policy applied to every backend request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Build a policy from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter,
        }
    }

    /// A policy that retries without sleeping. Intended for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::immediate(1)
    }

    /// Maximum number of attempts per request.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Nominal delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let nominal = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = nominal.min(self.max_backoff.as_secs_f64());
        let scaled = if self.jitter && capped > 0.0 {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_secs_f64(scaled)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Each attempt is recorded
    /// as one backend request in `telemetry`. Once `closed` is set no new
    /// attempt starts and pending backoff sleeps end early.
    pub fn execute<T>(
        &self,
        location: &str,
        closed: &AtomicBool,
        telemetry: &Telemetry,
        mut op: impl FnMut(u32) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            if closed.load(Ordering::Acquire) {
                return Err(RangeError::Closed);
            }
            attempt += 1;

            let started = Instant::now();
            let outcome = op(attempt);
            telemetry.request(started.elapsed());

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                debug!(location, attempt, error = %err, "permanent range failure");
                telemetry.failure(err.class());
                return Err(err);
            }

            if attempt >= self.max_attempts {
                warn!(location, attempt, error = %err, "retry budget exhausted");
                let err = RangeError::Transient {
                    location: location.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                };
                telemetry.failure(err.class());
                return Err(err);
            }

            let delay = self.backoff(attempt);
            warn!(location, attempt, ?delay, error = %err, "transient range failure, retrying");
            telemetry.retry();
            if !sleep_unless_closed(delay, closed) {
                return Err(RangeError::Closed);
            }
        }
    }
}

/// Sleep for `delay`, waking early if `closed` is set. Returns false if closed.
fn sleep_unless_closed(delay: Duration, closed: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if closed.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(CLOSE_POLL_INTERVAL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackendKind, ErrorClass};

    fn unavailable() -> RangeError {
        RangeError::Status {
            status: 503,
            location: "mem://retry".into(),
        }
    }

    fn telemetry() -> Telemetry {
        Telemetry::new(BackendKind::Memory, "mem://retry")
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            multiplier: 2.0,
            jitter: false,
        });
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(9), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            initial_backoff_ms: 200,
            jitter: true,
            ..RetryConfig::default()
        });
        for _ in 0..50 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_recovers_after_transient_failures() {
        let closed = AtomicBool::new(false);
        let telemetry = telemetry();
        let mut calls = 0;
        let result = RetryPolicy::immediate(3).execute("mem://retry", &closed, &telemetry, |_| {
            calls += 1;
            if calls < 3 {
                Err(unavailable())
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
        assert_eq!(telemetry.snapshot().requests, 3);
        assert_eq!(telemetry.snapshot().retries, 2);
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let closed = AtomicBool::new(false);
        let mut calls = 0;
        let result: Result<()> =
            RetryPolicy::immediate(5).execute("mem://retry", &closed, &telemetry(), |_| {
                calls += 1;
                Err(RangeError::NotFound("mem://retry".into()))
            });
        assert!(matches!(result, Err(RangeError::NotFound(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_exhaustion_wraps_last_error() {
        let closed = AtomicBool::new(false);
        let mut calls = 0;
        let result: Result<()> =
            RetryPolicy::immediate(2).execute("mem://retry", &closed, &telemetry(), |_| {
                calls += 1;
                Err(unavailable())
            });
        let err = result.unwrap_err();
        assert_eq!(calls, 2);
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(matches!(err, RangeError::Transient { attempts: 2, .. }));
    }

    #[test]
    fn test_closed_fails_fast() {
        let closed = AtomicBool::new(true);
        let mut calls = 0;
        let result: Result<()> =
            RetryPolicy::immediate(3).execute("mem://retry", &closed, &telemetry(), |_| {
                calls += 1;
                Ok(())
            });
        assert!(matches!(result, Err(RangeError::Closed)));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_sleep_ends_when_closed() {
        let closed = AtomicBool::new(true);
        let started = Instant::now();
        assert!(!sleep_unless_closed(Duration::from_secs(10), &closed));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
