//! Retry executor.
//!
//! Semantics:
//! - `max_attempts` counts total attempts: the initial call plus retries.
//! - Only [`PolicyError::Inner`] failures are candidates for retry; rejection
//!   variants from other policy layers return immediately.
//! - `should_retry` classifies an inner failure as retryable or fatal; a
//!   fatal failure propagates at once with no further attempts.
//! - Exhaustion returns [`PolicyError::RetriesExhausted`] tagged with the
//!   attempt count and a bounded window of the observed failures.
//! - The delay between attempts comes from [`Backoff`] and [`Jitter`] and is
//!   awaited through the [`Sleeper`] seam, so backoff never blocks a shared
//!   worker thread and tests run without real time.

use crate::error::{PolicyError, MAX_RETRY_FAILURES};
use crate::config::{ConfigError, RetryConfig};
use crate::{Backoff, Jitter, Sleeper, TokioSleeper};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry policy combining backoff, jitter, a retryability predicate, and a sleeper.
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

// Clones share the predicate and sleeper; `E` itself need not be `Clone`.
impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            jitter: self.jitter,
            should_retry: self.should_retry.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

/// Per-call overrides that never touch the shared policy.
#[derive(Debug, Clone, Default)]
pub struct RetryOverrides {
    pub max_attempts: Option<usize>,
    pub backoff: Option<Backoff>,
    pub jitter: Option<Jitter>,
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Build a policy straight from the configuration surface.
    pub fn from_config(config: &RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            max_attempts: config.max_attempts,
            backoff: Backoff::try_from(config)?,
            jitter: Jitter::from_flag(config.jitter),
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Execute an operation with retry semantics.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.run(None, self.max_attempts, &self.backoff, self.jitter, operation).await
    }

    /// Execute with a policy key attached to diagnostics.
    pub async fn execute_keyed<T, Fut, Op>(
        &self,
        key: &str,
        operation: Op,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.run(Some(key), self.max_attempts, &self.backoff, self.jitter, operation).await
    }

    /// Execute with per-call overrides, leaving the shared policy untouched.
    pub async fn execute_with<T, Fut, Op>(
        &self,
        overrides: RetryOverrides,
        operation: Op,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let max_attempts = overrides.max_attempts.unwrap_or(self.max_attempts).max(1);
        let backoff = overrides.backoff.unwrap_or_else(|| self.backoff.clone());
        let jitter = overrides.jitter.unwrap_or(self.jitter);
        self.run(None, max_attempts, &backoff, jitter, operation).await
    }

    async fn run<T, Fut, Op>(
        &self,
        key: Option<&str>,
        max_attempts: usize,
        backoff: &Backoff,
        jitter: Jitter,
        mut operation: Op,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures: VecDeque<E> = VecDeque::new();

        for attempt in 0..max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(PolicyError::Inner(e)) => {
                    if !(self.should_retry)(&e) {
                        tracing::debug!(key, attempt = attempt + 1, "failure classified fatal; not retrying");
                        return Err(PolicyError::Inner(e));
                    }

                    failures.push_back(e);
                    while failures.len() > MAX_RETRY_FAILURES {
                        failures.pop_front();
                    }

                    if attempt + 1 >= max_attempts {
                        tracing::warn!(key, attempts = max_attempts, "retries exhausted");
                        return Err(PolicyError::retries_exhausted(
                            max_attempts,
                            failures.into_iter().collect(),
                        ));
                    }

                    // Retries are 1-indexed in the schedule: the first retry
                    // sleeps for delay(1).
                    let delay = jitter.apply(backoff.delay(attempt + 1));
                    tracing::debug!(key, attempt = attempt + 1, ?delay, "retrying after backoff");
                    self.sleeper.sleep(delay).await;
                }
                // Rejections from other policy layers are not retryable here.
                Err(e) => return Err(e),
            }
        }

        // The loop always returns: success, fatal failure, pass-through, or
        // exhaustion on the final attempt.
        unreachable!("retry loop must return within max_attempts iterations")
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(100)),
            jitter: Jitter::Full,
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempts (initial call + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Predicate deciding whether an inner failure is retryable.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Inject a sleeper (tests use [`crate::InstantSleeper`] or
    /// [`crate::RecordingSleeper`]).
    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstantSleeper, RecordingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn policy(max_attempts: usize) -> RetryPolicy<TestError> {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .backoff(Backoff::fixed(Duration::from_millis(10)))
            .jitter(Jitter::None)
            .sleeper(InstantSleeper)
            .build()
            .expect("valid policy")
    }

    #[tokio::test]
    async fn first_attempt_success_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = policy(3)
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, PolicyError<TestError>>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = policy(5)
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PolicyError::Inner(TestError("transient".into())))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count_and_last_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = policy(3)
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PolicyError::Inner(TestError(format!("attempt {n}"))))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert_eq!(err.exhaustion_info(), Some((3, 3)));
        assert_eq!(err.last_failure().unwrap().0, "attempt 2");
    }

    #[tokio::test]
    async fn backoff_schedule_is_ten_then_twenty_millis() {
        // max_attempts=3, base=10ms, multiplier=2, no jitter: delays 10ms, 20ms.
        let sleeper = RecordingSleeper::new();
        let policy: RetryPolicy<TestError> = RetryPolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::new(Duration::from_millis(10), 2.0, Duration::from_secs(1)).unwrap())
            .jitter(Jitter::None)
            .sleeper(sleeper.clone())
            .build()
            .unwrap();

        let result = policy
            .execute(|| async { Err::<(), _>(PolicyError::Inner(TestError("always".into()))) })
            .await;

        assert!(result.unwrap_err().is_retries_exhausted());
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[tokio::test]
    async fn fatal_failures_skip_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let policy: RetryPolicy<TestError> = RetryPolicy::builder()
            .max_attempts(5)
            .backoff(Backoff::fixed(Duration::from_millis(1)))
            .jitter(Jitter::None)
            .should_retry(|e: &TestError| e.0.contains("transient"))
            .sleeper(InstantSleeper)
            .build()
            .unwrap();

        let result = policy
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PolicyError::Inner(TestError("fatal: bad request".into())))
                }
            })
            .await;

        assert!(matches!(result, Err(PolicyError::Inner(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn policy_rejections_pass_through_untouched() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = policy(5)
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), PolicyError<TestError>>(PolicyError::Timeout {
                        elapsed: Duration::from_secs(1),
                        limit: Duration::from_millis(500),
                    })
                }
            })
            .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "timeouts are not retried here");
    }

    #[tokio::test]
    async fn overrides_apply_per_call_only() {
        let sleeper = RecordingSleeper::new();
        let policy: RetryPolicy<TestError> = RetryPolicy::builder()
            .max_attempts(2)
            .backoff(Backoff::fixed(Duration::from_millis(50)))
            .jitter(Jitter::None)
            .sleeper(sleeper.clone())
            .build()
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let overrides = RetryOverrides {
            max_attempts: Some(4),
            backoff: Some(Backoff::fixed(Duration::from_millis(5))),
            jitter: None,
        };
        let result = policy
            .execute_with(overrides, || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PolicyError::Inner(TestError("x".into())))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().exhaustion_info(), Some((4, 4)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(sleeper.recorded(), vec![Duration::from_millis(5); 3]);

        // the shared policy still uses its own attempt budget
        calls.store(0, Ordering::SeqCst);
        let calls_clone = calls.clone();
        let result = policy
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PolicyError::Inner(TestError("x".into())))
                }
            })
            .await;
        assert_eq!(result.unwrap_err().exhaustion_info(), Some((2, 2)));
    }

    #[tokio::test]
    async fn full_jitter_never_exceeds_the_computed_delay() {
        let sleeper = RecordingSleeper::new();
        let policy: RetryPolicy<TestError> = RetryPolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::fixed(Duration::from_millis(100)))
            .jitter(Jitter::Full)
            .sleeper(sleeper.clone())
            .build()
            .unwrap();

        let _ = policy
            .execute(|| async { Err::<(), _>(PolicyError::Inner(TestError("x".into()))) })
            .await;

        assert_eq!(sleeper.count(), 2);
        for delay in sleeper.recorded() {
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn clones_work_with_non_cloneable_error_types() {
        #[derive(Debug)]
        struct OpaqueError;

        impl std::fmt::Display for OpaqueError {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "opaque")
            }
        }

        impl std::error::Error for OpaqueError {}

        let policy: RetryPolicy<OpaqueError> = RetryPolicy::builder()
            .max_attempts(2)
            .sleeper(InstantSleeper)
            .build()
            .expect("valid policy");

        let copy = policy.clone();
        let result = copy.execute(|| async { Ok::<_, PolicyError<OpaqueError>>(5) }).await;
        assert_eq!(result.unwrap(), 5);
    }

    #[tokio::test]
    async fn builder_rejects_zero_attempts() {
        let err = RetryPolicy::<TestError>::builder().max_attempts(0).build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroMaxAttempts);
    }

    #[tokio::test]
    async fn from_config_honors_the_surface() {
        let config = RetryConfig {
            max_attempts: 2,
            backoff_base: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(1),
            jitter: false,
        };
        let policy = RetryPolicy::<TestError>::from_config(&config).unwrap();
        let result = policy
            .execute(|| async { Err::<(), _>(PolicyError::Inner(TestError("x".into()))) })
            .await;
        assert_eq!(result.unwrap_err().exhaustion_info(), Some((2, 2)));
    }
}
