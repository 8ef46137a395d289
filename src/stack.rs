//! Composition of all five policies into one execution path.
//!
//! Layer order, outermost first:
//!
//! ```text
//! rate limiter → bulkhead → retry → circuit breaker → timeout → operation
//! ```
//!
//! The cheap gates run first: a rate-limited or bulkhead-rejected call never
//! consumes a retry attempt. Retry sits outside the circuit breaker so every
//! attempt passes through admission and updates circuit health; a circuit
//! that opens mid-sequence short-circuits the remaining attempts, since
//! breaker rejections are not retryable. The timeout bounds each individual
//! attempt, and a timed-out attempt counts as a circuit failure.

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{
    BulkheadConfig, CircuitBreakerConfig, ConfigError, EngineConfig, KeyedConfig,
    RateLimiterConfig, TimeoutConfig, DEFAULT_KEY,
};
use crate::error::PolicyError;
use crate::events::PolicyEvent;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutEnforcer;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// All five policies behind one keyed entry point.
///
/// Clones share every policy's per-key state.
pub struct ResilienceStack<E> {
    rate_limiter: RateLimiter,
    bulkhead: Bulkhead,
    retry: RetryPolicy<E>,
    circuit_breaker: CircuitBreaker,
    timeout: TimeoutEnforcer,
}

// Clones share every layer's state; `E` itself need not be `Clone`.
impl<E> Clone for ResilienceStack<E> {
    fn clone(&self) -> Self {
        Self {
            rate_limiter: self.rate_limiter.clone(),
            bulkhead: self.bulkhead.clone(),
            retry: self.retry.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            timeout: self.timeout.clone(),
        }
    }
}

impl<E> ResilienceStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> ResilienceStackBuilder<E> {
        ResilienceStackBuilder::new()
    }

    /// Build every layer from one configuration surface. The retry policy is
    /// fixed per stack and uses the `"default"` retry entry.
    pub fn from_engine_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            rate_limiter: RateLimiter::new(config.rate_limiter.clone())?,
            bulkhead: Bulkhead::new(config.bulkhead.clone())?,
            retry: RetryPolicy::from_config(config.retry.resolve(DEFAULT_KEY))?,
            circuit_breaker: CircuitBreaker::new(config.circuit_breaker.clone())?,
            timeout: TimeoutEnforcer::new(config.timeout.clone())?,
        })
    }

    /// Execute `operation` for `key` through every layer.
    pub async fn execute<T, Fut, Op>(&self, key: &str, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.run(key, operation, None).await
    }

    /// Like [`execute`](Self::execute), but a fired `cancel` token abandons
    /// any bulkhead queue wait.
    pub async fn execute_cancellable<T, Fut, Op>(
        &self,
        key: &str,
        operation: Op,
        cancel: &CancellationToken,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.run(key, operation, Some(cancel.clone())).await
    }

    /// The circuit breaker layer, for admin operations and monitoring.
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn timeout(&self) -> &TimeoutEnforcer {
        &self.timeout
    }

    /// A read-side monitor over this stack's policies.
    pub fn monitor(&self) -> crate::monitor::Monitor {
        crate::monitor::Monitor::new(
            self.circuit_breaker.clone(),
            self.bulkhead.clone(),
            self.rate_limiter.clone(),
            self.timeout.clone(),
        )
    }

    async fn run<T, Fut, Op>(
        &self,
        key: &str,
        operation: Op,
        cancel: Option<CancellationToken>,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        // The operation is shared across retry attempts through a mutex; the
        // guard is released before the produced future is awaited.
        let op_cell = Arc::new(Mutex::new(operation));

        let attempt_layers = || {
            let op_cell = op_cell.clone();
            let retry = self.retry.clone();
            let circuit_breaker = self.circuit_breaker.clone();
            let timeout = self.timeout.clone();
            let key = key.to_string();

            async move {
                retry
                    .execute_keyed(&key, || {
                        let op_cell = op_cell.clone();
                        let circuit_breaker = circuit_breaker.clone();
                        let timeout = timeout.clone();
                        let key = key.clone();
                        async move {
                            circuit_breaker
                                .execute(&key, || {
                                    let op_cell = op_cell.clone();
                                    let timeout = timeout.clone();
                                    let key = key.clone();
                                    async move {
                                        timeout
                                            .execute(&key, || {
                                                let mut op = op_cell
                                                    .lock()
                                                    .expect("operation lock poisoned");
                                                op()
                                            })
                                            .await
                                    }
                                })
                                .await
                        }
                    })
                    .await
            }
        };

        self.rate_limiter
            .execute(key, || {
                let bulkhead = self.bulkhead.clone();
                let cancel = cancel.clone();
                let key = key.to_string();
                async move {
                    match cancel {
                        Some(token) => {
                            bulkhead.execute_cancellable(&key, attempt_layers, &token).await
                        }
                        None => bulkhead.execute(&key, attempt_layers).await,
                    }
                }
            })
            .await
    }
}

/// Builder for [`ResilienceStack`]. Unset layers default to pass-through.
pub struct ResilienceStackBuilder<E> {
    rate_limiter: Option<KeyedConfig<RateLimiterConfig>>,
    bulkhead: Option<KeyedConfig<BulkheadConfig>>,
    retry: Option<RetryPolicy<E>>,
    circuit_breaker: Option<KeyedConfig<CircuitBreakerConfig>>,
    timeout: Option<KeyedConfig<TimeoutConfig>>,
    events: Option<UnboundedSender<PolicyEvent>>,
}

impl<E> ResilienceStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            rate_limiter: None,
            bulkhead: None,
            retry: None,
            circuit_breaker: None,
            timeout: None,
            events: None,
        }
    }

    pub fn rate_limiter(mut self, config: KeyedConfig<RateLimiterConfig>) -> Self {
        self.rate_limiter = Some(config);
        self
    }

    pub fn bulkhead(mut self, config: KeyedConfig<BulkheadConfig>) -> Self {
        self.bulkhead = Some(config);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn circuit_breaker(mut self, config: KeyedConfig<CircuitBreakerConfig>) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn timeout(mut self, config: KeyedConfig<TimeoutConfig>) -> Self {
        self.timeout = Some(config);
        self
    }

    /// Publish every layer's admissions, rejections, circuit transitions,
    /// and deadline hits on `sender`. Sends never block.
    pub fn events(mut self, sender: UnboundedSender<PolicyEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn build(self) -> Result<ResilienceStack<E>, ConfigError> {
        let retry = match self.retry {
            Some(policy) => policy,
            // single attempt: retry becomes a pass-through
            None => RetryPolicy::builder().max_attempts(1).build()?,
        };
        let mut rate_limiter = RateLimiter::new(
            self.rate_limiter.unwrap_or_else(|| KeyedConfig::new(RateLimiterConfig::unlimited())),
        )?;
        let mut bulkhead = Bulkhead::new(
            self.bulkhead.unwrap_or_else(|| KeyedConfig::new(BulkheadConfig::unlimited())),
        )?;
        let mut circuit_breaker = CircuitBreaker::new(
            self.circuit_breaker
                .unwrap_or_else(|| KeyedConfig::new(CircuitBreakerConfig::disabled())),
        )?;
        let mut timeout = TimeoutEnforcer::new(self.timeout.unwrap_or_default())?;

        if let Some(sender) = self.events {
            rate_limiter = rate_limiter.with_events(sender.clone());
            bulkhead = bulkhead.with_events(sender.clone());
            circuit_breaker = circuit_breaker.with_events(sender.clone());
            timeout = timeout.with_events(sender);
        }

        Ok(ResilienceStack { rate_limiter, bulkhead, retry, circuit_breaker, timeout })
    }
}

impl<E> Default for ResilienceStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
