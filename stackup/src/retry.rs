//! Exponential backoff bounded by an overall deadline.
//!
//! Used for the admin connection while PostgreSQL finishes its init restart,
//! for port polling, and by the probes in [`crate::probe`] in place of fixed
//! sleeps.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Backoff schedule with a wall-clock bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap for any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt; values below 1.0 are treated as 1.0.
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in `0.8..1.2`.
    pub use_jitter: bool,
    /// Total time after which polling gives up.
    pub deadline: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            use_jitter: true,
            deadline: Duration::from_secs(30),
        }
    }
}

impl PollPolicy {
    /// Policy with the default schedule and the given deadline.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline,
            ..Self::default()
        }
    }

    /// Schedule for connecting to an engine that is still booting.
    pub const fn connection() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            use_jitter: true,
            deadline: Duration::from_secs(30),
        }
    }

    /// Delay to wait after `attempt` failed attempts. Zero before the first.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };

        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..attempt {
            if delay >= self.max_delay {
                break;
            }
            delay = delay.mul_f64(multiplier).min(self.max_delay);
        }

        if self.use_jitter {
            delay.mul_f64(rand::rng().random_range(0.8..1.2))
        } else {
            delay
        }
    }
}

/// An operation kept failing until the deadline passed.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts made.
    pub attempts: u32,
    /// Time spent.
    pub waited: Duration,
    /// Error from the final attempt.
    pub last_error: E,
}

/// Run `operation` until it succeeds or `policy.deadline` passes.
///
/// The operation always runs at least once. Delays never overshoot the
/// deadline by more than the final attempt's own duration.
pub async fn retry_until_deadline<F, Fut, T, E>(
    policy: &PollPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    let mut attempts = 0_u32;

    loop {
        attempts = attempts.saturating_add(1);
        match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "[retry] operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(error) => {
                let waited = started.elapsed();
                let remaining = policy.deadline.saturating_sub(waited);
                if remaining.is_zero() {
                    warn!(
                        operation = operation_name,
                        attempts,
                        waited = ?waited,
                        error = %error,
                        "[retry] deadline exhausted"
                    );
                    return Err(Exhausted {
                        attempts,
                        waited,
                        last_error: error,
                    });
                }

                let delay = policy.delay_for(attempts).min(remaining);
                debug!(
                    operation = operation_name,
                    attempts,
                    delay = ?delay,
                    error = %error,
                    "[retry] attempt failed, backing off"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use proptest::prelude::*;

    use super::*;

    fn steady(deadline: Duration) -> PollPolicy {
        PollPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            use_jitter: false,
            deadline,
        }
    }

    #[test]
    fn delays_grow_geometrically_up_to_the_cap() {
        let policy = steady(Duration::from_secs(10));

        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[test]
    fn shrinking_multiplier_is_treated_as_constant_backoff() {
        let policy = PollPolicy {
            backoff_multiplier: 0.5,
            ..steady(Duration::from_secs(10))
        };

        assert_eq!(policy.delay_for(3), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_the_operation_recovers() {
        // Given an operation that fails twice
        let calls = AtomicU32::new(0);

        // When retried under a generous deadline
        let result = retry_until_deadline(&steady(Duration::from_secs(5)), "flaky", || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err("not yet")
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        // Then the third attempt's value comes back
        assert_eq!(result.expect("recovers before the deadline"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_the_deadline_with_the_last_error() {
        let exhausted = retry_until_deadline(&steady(Duration::from_secs(2)), "broken", || async {
            Err::<(), _>("refused")
        })
        .await
        .expect_err("never succeeds");

        assert_eq!(exhausted.last_error, "refused");
        assert!(exhausted.attempts > 1);
        assert!(exhausted.waited >= Duration::from_secs(2));
        assert!(exhausted.waited < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn exhaustion_is_logged_with_the_operation_name() {
        let _ = retry_until_deadline(&steady(Duration::from_millis(300)), "admin connect", || async {
            Err::<(), _>("connection refused")
        })
        .await;

        assert!(logs_contain("[retry] deadline exhausted"));
        assert!(logs_contain("admin connect"));
    }

    proptest! {
        #[test]
        fn jittered_delays_stay_within_twenty_percent_of_the_cap(attempt in 1u32..64) {
            let policy = PollPolicy {
                use_jitter: true,
                ..steady(Duration::from_secs(10))
            };

            let delay = policy.delay_for(attempt);

            prop_assert!(delay >= Duration::from_millis(80));
            prop_assert!(delay <= Duration::from_millis(1200));
        }
    }
}
