//! Bounded retries for transient infrastructure errors and the growing
//! delay between scheduler polls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::error::{Result, TaskfoldError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomized in both directions
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ControllerConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.retry_initial_delay,
            max_delay: config.retry_max_delay,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let raw_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        let jittered_ms = if self.jitter > 0.0 && capped_ms > 0.0 {
            let spread = capped_ms * self.jitter;
            rand::thread_rng().gen_range((capped_ms - spread)..=(capped_ms + spread))
        } else {
            capped_ms
        };
        Duration::from_millis(jittered_ms.max(0.0) as u64).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, or exhausts the
/// policy. Exhaustion of transient failures surfaces as
/// [`TaskfoldError::BackendUnavailable`].
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    what: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TaskfoldError::Cancelled);
        }
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    operation = what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(TaskfoldError::Cancelled),
                }
            }
            Err(e) if e.is_transient() => {
                tracing::error!(operation = what, attempt, error = %e, "Giving up");
                return Err(TaskfoldError::BackendUnavailable {
                    attempts: attempt,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

/// Delay between two poll cycles, growing geometrically up to a cap.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl PollBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            current: initial.min(max),
            max,
            multiplier: multiplier.max(1.0),
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(
            config.poll_interval_initial,
            config.poll_interval_max,
            config.poll_backoff_multiplier,
        )
    }

    /// Delay to wait now; the following call returns a longer one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..fast_policy(5)
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_cap() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..fast_policy(5)
        };
        for attempt in 0..10 {
            assert!(policy.delay_for_attempt(attempt) <= policy.max_delay);
        }
    }

    #[test]
    fn poll_backoff_increases_to_max() {
        let mut backoff =
            PollBackoff::new(Duration::from_millis(10), Duration::from_millis(25), 2.0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(25));
        assert_eq!(backoff.next_delay(), Duration::from_millis(25));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(&fast_policy(3), "test", &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TaskfoldError::Channel("reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_backend_unavailable() {
        let result: Result<()> =
            retry_transient(&fast_policy(2), "test", &CancellationToken::new(), || async {
                Err(TaskfoldError::Channel("down".into()))
            })
            .await;
        assert!(matches!(
            result,
            Err(TaskfoldError::BackendUnavailable { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> =
            retry_transient(&fast_policy(5), "test", &CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TaskfoldError::Config("bad".into())) }
            })
            .await;
        assert!(matches!(result, Err(TaskfoldError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> =
            retry_transient(&fast_policy(5), "test", &cancel, || async { Ok(()) }).await;
        assert!(matches!(result, Err(TaskfoldError::Cancelled)));
    }
}
