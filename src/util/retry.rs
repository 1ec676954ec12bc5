use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Classify, ErrorKind};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY_MS: u64 = 5_000;
const DEFAULT_RATE_LIMIT_BASE_DELAY_MS: u64 = 30_000;
const DEFAULT_MAX_DELAY_MS: u64 = 900_000;
const DEFAULT_JITTER: f64 = 0.5;

/// One backoff policy for every retryable call, parameterized per error kind:
/// rate-limit responses start from a longer base than transient failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub rate_limit_base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fractional spread around the computed delay, 0.5 => [0.5x, 1.5x].
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            rate_limit_base_delay_ms: DEFAULT_RATE_LIMIT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, kind: ErrorKind, attempt: u32) -> Duration {
        let base = match kind {
            ErrorKind::RateLimited => self.rate_limit_base_delay_ms,
            _ => self.base_delay_ms,
        };
        let exp = attempt.saturating_sub(1).min(20);
        let raw = base.saturating_mul(1u64 << exp).min(self.max_delay_ms) as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let ms = (raw * factor).min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(ms as u64)
    }
}

/// Last error of a retried call plus how it ended.
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    /// True when the error was retryable but the attempt budget ran out.
    pub exhausted: bool,
    pub last: E,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or uses up
/// `policy.max_attempts`. `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, RetryError<E>>
where
    E: Classify + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(err) if !err.is_retryable() => {
                return Err(RetryError { attempts: attempt, exhausted: false, last: err });
            }
            Err(err) if attempt >= max => {
                warn!(call = label, attempts = attempt, kind = %err.kind(), "retries exhausted: {}", err);
                return Err(RetryError { attempts: attempt, exhausted: true, last: err });
            }
            Err(err) => {
                let mut delay = policy.delay_for(err.kind(), attempt);
                if let Some(hint) = err.retry_after() { delay = delay.max(hint); }
                warn!(call = label, attempt, max, kind = %err.kind(), delay_ms = delay.as_millis() as u64, "retrying after: {}", err);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy { max_attempts, base_delay_ms: 1, rate_limit_base_delay_ms: 2, max_delay_ms: 5, jitter: 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(ErrorKind);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "flaky {}", self.0) }
    }

    impl Classify for Flaky {
        fn kind(&self) -> ErrorKind { self.0 }
        fn is_retryable(&self) -> bool { matches!(self.0, ErrorKind::RateLimited | ErrorKind::Transient) }
    }

    #[test]
    fn delays_grow_and_cap() {
        let p = RetryPolicy { max_attempts: 5, base_delay_ms: 100, rate_limit_base_delay_ms: 1_000, max_delay_ms: 1_500, jitter: 0.0 };
        assert_eq!(p.delay_for(ErrorKind::Transient, 1), Duration::from_millis(100));
        assert_eq!(p.delay_for(ErrorKind::Transient, 3), Duration::from_millis(400));
        assert_eq!(p.delay_for(ErrorKind::RateLimited, 1), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(ErrorKind::RateLimited, 2), Duration::from_millis(1_500));
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = RetryPolicy { max_attempts: 5, base_delay_ms: 1_000, rate_limit_base_delay_ms: 1_000, max_delay_ms: 10_000, jitter: 0.5 };
        for _ in 0..50 {
            let d = p.delay_for(ErrorKind::Transient, 1).as_millis();
            assert!((500..=1_500).contains(&d), "delay {d} out of band");
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = retry(&fast_policy(4), "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 3 { Err(Flaky(ErrorKind::RateLimited)) } else { Ok(n) } }
        })
        .await
        .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn stops_at_budget_and_marks_exhausted() {
        let calls = AtomicU32::new(0);
        let err = retry(&fast_policy(3), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Flaky(ErrorKind::Transient)) }
        })
        .await
        .unwrap_err();
        assert!(err.exhausted);
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry(&fast_policy(5), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Flaky(ErrorKind::Permanent)) }
        })
        .await
        .unwrap_err();
        assert!(!err.exhausted);
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
