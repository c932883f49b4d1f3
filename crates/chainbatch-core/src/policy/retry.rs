//! Exponential backoff retry policy and executor.
//!
//! Delay before attempt `k` (k ≥ 1) is
//! `min(base_delay * multiplier^(k-1), max_delay)`; attempt 0 runs immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::clamp_secs;
use crate::error::{BoxError, ExecError};

/// Error-message fragments treated as transient by default (case-insensitive).
pub const DEFAULT_RETRYABLE_KEYWORDS: &[&str] = &[
    "timeout",
    "connection refused",
    "network unreachable",
    "temporary failure",
    "rate limit",
    "too many requests",
    "service unavailable",
    "internal server error",
];

/// Caller-supplied retryability check.
pub type RetryPredicate =
    Arc<dyn Fn(&(dyn std::error::Error + Send + Sync + 'static)) -> bool + Send + Sync>;

/// Backoff schedule and error classification for [`RetryExecutor`].
#[derive(Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt; 0 runs the task once.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay on each retry.
    pub multiplier: f64,
    /// Add up to ±`jitter_fraction * delay` random jitter (0.0 = no jitter).
    pub jitter_fraction: f64,
    /// Keywords matched against the lowercased error message.
    pub retryable_keywords: Vec<String>,
    /// Overrides keyword matching when set.
    pub predicate: Option<RetryPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_fraction: 0.0,
            retryable_keywords: DEFAULT_RETRYABLE_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            predicate: None,
        }
    }
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter_fraction", &self.jitter_fraction)
            .field("retryable_keywords", &self.retryable_keywords)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Stateless retry policy: delay schedule plus retryability classification.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before retry number `attempt` (the first retry is 1), or `None`
    /// when `attempt` is 0 or past `max_retries`.
    ///
    /// Never exceeds `max_delay`, jitter included. Out-of-range multipliers
    /// or jitter fractions cannot panic: a non-positive product is no delay.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let max = self.config.max_delay;
        let growth = self.config.multiplier.powi((attempt - 1) as i32);
        let capped = clamp_secs(self.config.base_delay.as_secs_f64() * growth, max);

        let jitter = self.config.jitter_fraction.clamp(0.0, 1.0);
        if !(jitter > 0.0) || capped.is_zero() {
            return Some(capped);
        }
        let spread = capped.as_secs_f64() * jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Some(clamp_secs(capped.as_secs_f64() + offset, max))
    }

    /// Classify `err` as transient (retry) or permanent (stop).
    pub fn is_retryable(&self, err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
        if let Some(predicate) = &self.config.predicate {
            return predicate(err);
        }
        matches_keywords(err, &self.config.retryable_keywords)
    }
}

/// Returns `true` if the error message contains any of `keywords`, ignoring case.
pub fn matches_keywords<K: AsRef<str>>(
    err: &(dyn std::error::Error + Send + Sync + 'static),
    keywords: &[K],
) -> bool {
    let message = err.to_string().to_lowercase();
    keywords
        .iter()
        .any(|keyword| message.contains(&keyword.as_ref().to_lowercase()))
}

/// Re-invokes a fallible async function according to a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            policy: RetryPolicy::new(config),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` with retries and no external cancellation.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, ExecError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.execute_with_cancel(&CancellationToken::new(), f).await
    }

    /// Run `f` up to `max_retries + 1` times.
    ///
    /// Stops early on success, on a non-retryable error, or when `cancel`
    /// fires (before an attempt or during a delay), which yields
    /// [`ExecError::Cancelled`].
    pub async fn execute_with_cancel<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, ExecError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ExecError::Cancelled);
            }

            let err: BoxError = match f().await {
                Ok(value) => return Ok(value),
                Err(e) => e.into(),
            };
            attempt += 1;

            // A failure caused by shutdown is not a task failure.
            if cancel.is_cancelled() {
                return Err(ExecError::Cancelled);
            }

            if !self.policy.is_retryable(err.as_ref()) {
                tracing::debug!(attempt, error = %err, "non-retryable error, giving up");
                return Err(ExecError::RetriesExhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let Some(delay) = self.policy.next_delay(attempt) else {
                tracing::error!(attempt, error = %err, "max retries exceeded");
                return Err(ExecError::RetriesExhausted {
                    attempts: attempt,
                    source: err,
                });
            };

            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    fn config(max_retries: u32, base_ms: u64) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn delay_schedule() {
        let policy = RetryPolicy::new(config(3, 100));
        assert!(policy.next_delay(0).is_none());
        assert_eq!(policy.next_delay(1).unwrap().as_millis(), 100);
        assert_eq!(policy.next_delay(2).unwrap().as_millis(), 200);
        assert_eq!(policy.next_delay(3).unwrap().as_millis(), 400);
        assert!(policy.next_delay(4).is_none());
    }

    #[test]
    fn growth_stops_at_ceiling() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 10.0,
            ..Default::default()
        });
        assert_eq!(policy.next_delay(5).unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn odd_multipliers_do_not_panic() {
        for multiplier in [-3.0, 0.0, f64::NAN, f64::INFINITY] {
            let policy = RetryPolicy::new(RetryConfig {
                multiplier,
                jitter_fraction: 0.5,
                ..config(4, 100)
            });
            for attempt in 1..=4 {
                let d = policy.next_delay(attempt).unwrap();
                assert!(d <= Duration::from_secs(30), "{multiplier}: {d:?}");
            }
        }
        let policy = RetryPolicy::new(RetryConfig {
            multiplier: -2.0,
            ..config(2, 100)
        });
        assert_eq!(policy.next_delay(2), Some(Duration::ZERO));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter_fraction: 0.2,
            ..config(3, 1000)
        });
        for _ in 0..50 {
            let d = policy.next_delay(1).unwrap();
            assert!(d >= Duration::from_millis(799) && d <= Duration::from_millis(1201), "{d:?}");
        }
    }

    #[test]
    fn keyword_classification_is_case_insensitive() {
        let policy = RetryPolicy::new(RetryConfig::default());
        let transient: BoxError = "HTTP 503: Service Unavailable".into();
        let permanent: BoxError = "insufficient funds for gas".into();
        assert!(policy.is_retryable(transient.as_ref()));
        assert!(!policy.is_retryable(permanent.as_ref()));
    }

    #[test]
    fn predicate_overrides_keywords() {
        let policy = RetryPolicy::new(RetryConfig {
            predicate: Some(Arc::new(|e: &(dyn std::error::Error + Send + Sync + 'static)| {
                e.to_string().contains("nonce")
            })),
            ..Default::default()
        });
        let nonce: BoxError = "nonce too low".into();
        let timeout: BoxError = "timeout".into();
        assert!(policy.is_retryable(nonce.as_ref()));
        assert!(!policy.is_retryable(timeout.as_ref()));
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds() {
        let exec = RetryExecutor::new(config(2, 100));
        let calls = Mutex::new(Vec::new());
        let start = Instant::now();

        let out = exec
            .execute(|| {
                let mut calls = calls.lock().unwrap();
                calls.push(start.elapsed());
                let n = calls.len();
                async move {
                    if n < 3 {
                        Err("request timeout")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 3);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let gap1 = calls[1] - calls[0];
        let gap2 = calls[2] - calls[1];
        assert!(gap1 >= Duration::from_millis(100) && gap1 < Duration::from_millis(180), "{gap1:?}");
        assert!(gap2 >= Duration::from_millis(200) && gap2 < Duration::from_millis(300), "{gap2:?}");
    }

    #[tokio::test]
    async fn non_retryable_stops_after_one_attempt() {
        let exec = RetryExecutor::new(config(5, 10));
        let calls = AtomicU32::new(0);
        let err = exec
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("execution reverted") }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match err {
            ExecError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 1);
                assert_eq!(source.to_string(), "execution reverted");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn exhausts_after_max_retries() {
        let exec = RetryExecutor::new(config(2, 5));
        let calls = AtomicU32::new(0);
        let err = exec
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("connection refused") }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn cancel_during_delay_returns_immediately() {
        let exec = RetryExecutor::new(config(3, 10_000));
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c.cancel();
        });

        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let err = exec
            .execute_with_cancel(&cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("timeout") }
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let exec = RetryExecutor::new(config(3, 10));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let err = exec
            .execute_with_cancel(&cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, BoxError>(()) }
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
