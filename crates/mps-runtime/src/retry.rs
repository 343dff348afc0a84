use std::future::Future;
use std::time::Duration;

use mps_config::RetryConfig;

/// Bounded exponential backoff.
///
/// `max_attempts` counts the first call, so `1` means "no retries".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms.max(c.base_delay_ms)),
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// `true` if another attempt is allowed after `attempts_made` failures.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    ///
    /// `classify` returns `None` for a permanent error, or the minimum wait
    /// the error asks for (a rate limit's `Retry-After`). The actual wait is
    /// the larger of that and the backoff delay.
    pub async fn run<T, E, F, Fut, C>(&self, label: &str, mut op: F, classify: C) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Option<Duration>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            let e = match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            let Some(min_wait) = classify(&e).filter(|_| self.allows_another(attempt)) else {
                return Err(e);
            };
            let delay = self.delay_for(attempt).max(min_wait);
            tracing::warn!(
                op = label,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(500));
        assert_eq!(p.delay_for(60), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, String> = fast(3)
            .run(
                "test",
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err("flaky".to_string())
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |_| Some(Duration::ZERO),
            )
            .await;
        assert_eq!(out, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget_and_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = fast(2)
            .run(
                "test",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("down".to_string()) }
                },
                |_| Some(Duration::ZERO),
            )
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let calls = AtomicU32::new(0);
        let _: Result<(), String> = fast(5)
            .run(
                "test",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("bad request".to_string()) }
                },
                |_| None,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waits_at_least_the_hinted_delay() {
        let started = std::time::Instant::now();
        let out: Result<u32, String> = fast(2)
            .run(
                "test",
                |attempt| async move {
                    if attempt == 1 {
                        Err("rate limited".to_string())
                    } else {
                        Ok(attempt)
                    }
                },
                |_| Some(Duration::from_millis(60)),
            )
            .await;
        assert_eq!(out, Ok(2));
        // backoff alone would be 1ms
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
