use breakwater::{
    Backoff, BulkheadConfig, CircuitBreakerConfig, CircuitState, InstantSleeper, Jitter,
    KeyedConfig, PolicyError, RateLimiterConfig, ResilienceStack, RetryPolicy, TimeoutConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestError;

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test error")
    }
}

impl std::error::Error for TestError {}

fn fast_retry(max_attempts: usize) -> RetryPolicy<TestError> {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .backoff(Backoff::fixed(Duration::from_millis(1)))
        .jitter(Jitter::None)
        .sleeper(InstantSleeper)
        .build()
        .unwrap()
}

#[tokio::test]
async fn retry_retries_inner_errors_then_succeeds() {
    let stack: ResilienceStack<TestError> =
        ResilienceStack::builder().retry(fast_retry(3)).build().unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();

    let result = stack
        .execute("svc", move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(PolicyError::Inner(TestError))
                } else {
                    Ok::<_, PolicyError<TestError>>(())
                }
            }
        })
        .await;

    assert!(result.is_ok());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn circuit_recovers_through_a_full_open_probe_close_cycle() {
    let stack: ResilienceStack<TestError> = ResilienceStack::builder()
        .circuit_breaker(KeyedConfig::new(CircuitBreakerConfig {
            failure_threshold: 1,
            break_duration: Duration::from_millis(50),
        }))
        .build()
        .unwrap();

    // fail once: the circuit opens
    let _ = stack.execute("svc", || async { Err::<(), _>(PolicyError::Inner(TestError)) }).await;
    let rejected = stack.execute("svc", || async { Ok::<_, PolicyError<TestError>>(()) }).await;
    assert!(matches!(rejected, Err(e) if e.is_short_circuited()));

    // after the break, a successful probe closes it again
    tokio::time::sleep(Duration::from_millis(80)).await;
    let probed = stack.execute("svc", || async { Ok::<_, PolicyError<TestError>>(7) }).await;
    assert_eq!(probed.unwrap(), 7);
    assert_eq!(
        stack.circuit_breaker().state("svc").unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn saturated_bulkhead_queues_one_and_rejects_the_rest() {
    let stack: ResilienceStack<TestError> = ResilienceStack::builder()
        .bulkhead(KeyedConfig::new(BulkheadConfig {
            max_concurrency: 2,
            queue_capacity: 1,
            queue_timeout: Duration::from_secs(5),
        }))
        .build()
        .unwrap();

    let barrier = Arc::new(tokio::sync::Barrier::new(3));
    let mut holders = vec![];
    for _ in 0..2 {
        let stack = stack.clone();
        let barrier = barrier.clone();
        holders.push(tokio::spawn(async move {
            stack
                .execute("svc", || {
                    let barrier = barrier.clone();
                    async move {
                        barrier.wait().await;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, PolicyError<TestError>>(0)
                    }
                })
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let queued = {
        let stack = stack.clone();
        tokio::spawn(async move {
            stack.execute("svc", || async { Ok::<_, PolicyError<TestError>>(3) }).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let rejected = stack.execute("svc", || async { Ok::<_, PolicyError<TestError>>(4) }).await;
    assert!(matches!(rejected, Err(e) if e.is_bulkhead_rejected()));

    barrier.wait().await;
    for holder in holders {
        assert!(holder.await.unwrap().is_ok());
    }
    assert_eq!(queued.await.unwrap().unwrap(), 3, "the queued caller eventually ran");
}

#[tokio::test]
async fn timeout_triggers_on_slow_operation() {
    let stack: ResilienceStack<TestError> = ResilienceStack::builder()
        .timeout(KeyedConfig::new(TimeoutConfig { duration: Duration::from_millis(50) }))
        .build()
        .unwrap();

    let result = stack
        .execute("svc", || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, PolicyError<TestError>>(())
        })
        .await;

    assert!(matches!(result, Err(e) if e.is_timeout()));
}

#[tokio::test]
async fn rate_limiter_refills_and_admits_again() {
    let stack: ResilienceStack<TestError> = ResilienceStack::builder()
        .rate_limiter(KeyedConfig::new(RateLimiterConfig { capacity: 1.0, refill_rate: 50.0 }))
        .build()
        .unwrap();

    assert!(stack.execute("svc", || async { Ok::<_, PolicyError<TestError>>(1) }).await.is_ok());
    let denied = stack.execute("svc", || async { Ok::<_, PolicyError<TestError>>(2) }).await;
    assert!(matches!(denied, Err(e) if e.is_rate_limited()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(stack.execute("svc", || async { Ok::<_, PolicyError<TestError>>(3) }).await.is_ok());
}

#[tokio::test]
async fn isolate_blocks_traffic_until_reset_through_the_stack() {
    let stack: ResilienceStack<TestError> = ResilienceStack::builder()
        .circuit_breaker(KeyedConfig::new(CircuitBreakerConfig {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
        }))
        .build()
        .unwrap();

    assert!(stack.execute("svc", || async { Ok::<_, PolicyError<TestError>>(1) }).await.is_ok());

    stack.circuit_breaker().isolate("svc");
    let blocked = stack.execute("svc", || async { Ok::<_, PolicyError<TestError>>(2) }).await;
    assert!(matches!(blocked, Err(e) if e.is_short_circuited()));

    stack.circuit_breaker().reset("svc");
    assert!(stack.execute("svc", || async { Ok::<_, PolicyError<TestError>>(3) }).await.is_ok());
}

#[tokio::test]
async fn retries_exhausted_reports_the_whole_sequence() {
    let stack: ResilienceStack<TestError> = ResilienceStack::builder()
        .retry(fast_retry(4))
        .build()
        .unwrap();

    let result = stack
        .execute("svc", || async { Err::<(), _>(PolicyError::Inner(TestError)) })
        .await;

    let err = result.unwrap_err();
    assert!(err.is_retries_exhausted());
    assert_eq!(err.exhaustion_info(), Some((4, 4)));
    assert_eq!(err.last_failure(), Some(&TestError));
}

#[tokio::test]
async fn monitor_scores_degrade_and_recommend_under_load() {
    let stack: ResilienceStack<TestError> = ResilienceStack::builder()
        .circuit_breaker(KeyedConfig::new(CircuitBreakerConfig {
            failure_threshold: 1,
            break_duration: Duration::from_secs(60),
        }))
        .rate_limiter(KeyedConfig::new(RateLimiterConfig { capacity: 1.0, refill_rate: 0.001 }))
        .build()
        .unwrap();
    let monitor = stack.monitor();

    // healthy baseline
    assert!(stack.execute("good", || async { Ok::<_, PolicyError<TestError>>(1) }).await.is_ok());
    let healthy = monitor.score(&monitor.report());

    // break one dependency and exhaust its budget
    let _ = stack.execute("bad", || async { Err::<(), _>(PolicyError::Inner(TestError)) }).await;
    for _ in 0..5 {
        let _ = stack.execute("bad", || async { Ok::<_, PolicyError<TestError>>(1) }).await;
    }

    let report = monitor.report();
    let degraded = monitor.score(&report);
    assert!(degraded < healthy, "expected {degraded} < {healthy}");

    stack.circuit_breaker().isolate("bad");
    let recs = monitor.recommendations(&monitor.report());
    assert!(recs.iter().any(|r| r.contains("'bad'")), "got {recs:?}");
}
