//! Participant Adapter: the uniform client-side wrapper over each external
//! collaborator, composing retry/backoff, per-attempt timeout, circuit
//! breaking and a bulkhead around a raw `ParticipantClient`.

mod bulkhead;
mod circuit_breaker;

pub use bulkhead::{Bulkhead, BulkheadFullError};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitOpenError, CircuitState};

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::config::AdapterConfig;
use crate::types::{
    AdapterCallError, AdapterError, ErrorKind, IdempotencyKey, ParticipantIdempotencyKey, RetryPolicy, StepDefinition,
};

/// The value a `ParticipantAdapter` call returns on success, alongside how
/// many attempts the retry middleware made to get there.
#[derive(Debug, Clone)]
pub struct AdapterOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

/// The raw, unretried client for one participant. Implementations speak
/// whatever transport the participant actually exposes; everything above
/// this trait (retry, timeout, breaker, bulkhead) is transport-agnostic.
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    /// Invoke `target` (a step's `invoke_target`) with `payload`, returning
    /// an opaque handle on success. MUST be idempotent on `idempotency_key`.
    async fn invoke(
        &self,
        target: &str,
        idempotency_key: &ParticipantIdempotencyKey,
        payload: &[u8],
    ) -> Result<String, AdapterError>;

    /// Compensate a previous `invoke` at `target` (a step's
    /// `compensate_target`) given the handle it returned. MUST be
    /// idempotent on `idempotency_key`.
    async fn compensate(
        &self,
        target: &str,
        idempotency_key: &ParticipantIdempotencyKey,
        handle: &str,
    ) -> Result<(), AdapterError>;
}

/// What the Saga Coordinator calls: retry/timeout/breaker/bulkhead already
/// applied, so a `Result::Err` here is always the adapter's final word.
#[async_trait]
pub trait ParticipantAdapter: Send + Sync {
    async fn invoke(
        &self,
        step: &StepDefinition,
        idempotency_key: IdempotencyKey,
        payload: &[u8],
    ) -> Result<AdapterOutcome<String>, AdapterCallError>;

    async fn compensate(
        &self,
        step: &StepDefinition,
        idempotency_key: IdempotencyKey,
        handle: &str,
    ) -> Result<AdapterOutcome<()>, AdapterCallError>;
}

#[async_trait]
impl<T: ParticipantClient + ?Sized> ParticipantClient for std::sync::Arc<T> {
    async fn invoke(
        &self,
        target: &str,
        idempotency_key: &ParticipantIdempotencyKey,
        payload: &[u8],
    ) -> Result<String, AdapterError> {
        (**self).invoke(target, idempotency_key, payload).await
    }

    async fn compensate(
        &self,
        target: &str,
        idempotency_key: &ParticipantIdempotencyKey,
        handle: &str,
    ) -> Result<(), AdapterError> {
        (**self).compensate(target, idempotency_key, handle).await
    }
}

/// The standard `ParticipantAdapter`: wraps a `ParticipantClient` with the
/// retry/timeout/breaker/bulkhead middleware stack.
pub struct RetryingAdapter<C> {
    client: C,
    breakers: CircuitBreakerRegistry,
    bulkhead: Bulkhead,
    /// Retry policy a step falls back to when its own `StepDefinition`
    /// doesn't specify one, built from `adapter.retry.*` config.
    default_retry_policy: RetryPolicy,
}

impl<C: ParticipantClient> RetryingAdapter<C> {
    pub fn new(client: C, config: &AdapterConfig) -> Self {
        Self {
            client,
            breakers: CircuitBreakerRegistry::new(CircuitBreakerConfig::from(config)),
            bulkhead: Bulkhead::new(config.bulkhead_max_concurrent),
            default_retry_policy: RetryPolicy::from(config),
        }
    }

    /// Build around a client that's already behind an `Arc`, e.g. one shared
    /// with a test harness's call log. `Arc<C>` implements `ParticipantClient`
    /// itself, so this is just `new` with a friendlier name at the call site.
    pub fn new_from_arc(client: std::sync::Arc<C>, config: &AdapterConfig) -> RetryingAdapter<std::sync::Arc<C>> {
        RetryingAdapter::new(client, config)
    }

    async fn call<F, Fut, T>(
        &self,
        target: &str,
        timeout: Duration,
        retry_policy: &RetryPolicy,
        retryable_error_kinds: &std::collections::HashSet<ErrorKind>,
        mut attempt_fn: F,
    ) -> Result<AdapterOutcome<T>, AdapterCallError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AdapterError>>,
    {
        self.breakers.check(target).await.map_err(|e| AdapterCallError {
            source: AdapterError::Unavailable {
                target: target.to_string(),
                reason: e.to_string(),
            },
            attempts: 0,
        })?;

        let _permit = self.bulkhead.try_acquire(target).map_err(|_| AdapterCallError {
            source: AdapterError::Unavailable {
                target: target.to_string(),
                reason: "bulkhead at capacity".to_string(),
            },
            attempts: 0,
        })?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = std::time::Instant::now();
            let outcome = match tokio::time::timeout(timeout, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout {
                    target: target.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }),
            };

            match outcome {
                Ok(value) => {
                    self.breakers.record_success(target).await;
                    return Ok(AdapterOutcome { value, attempts: attempt });
                }
                Err(err) => {
                    let kind = err.kind();
                    if matches!(kind, ErrorKind::Transient | ErrorKind::Unavailable | ErrorKind::Timeout) {
                        self.breakers.record_failure(target).await;
                    }

                    let can_retry = retryable_error_kinds.contains(&kind) && attempt < retry_policy.max_attempts;
                    if !can_retry {
                        tracing::warn!(target, attempt, %err, "participant call failed, not retrying");
                        return Err(AdapterCallError { source: err, attempts: attempt });
                    }

                    let delay = backoff_with_jitter(retry_policy, attempt);
                    tracing::debug!(target, attempt, ?delay, %err, "participant call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Exponential backoff with full jitter: a random delay in `[0, cap(base *
/// factor^(attempt-1))]`.
fn backoff_with_jitter(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.factor.powi((attempt - 1) as i32);
    let raw = policy.base.mul_f64(exp).min(policy.cap);
    let jittered_millis = rand::thread_rng().gen_range(0..=raw.as_millis().max(1) as u64);
    Duration::from_millis(jittered_millis)
}

#[async_trait]
impl<C: ParticipantClient + Send + Sync> ParticipantAdapter for RetryingAdapter<C> {
    async fn invoke(
        &self,
        step: &StepDefinition,
        idempotency_key: IdempotencyKey,
        payload: &[u8],
    ) -> Result<AdapterOutcome<String>, AdapterCallError> {
        let target = step.invoke_target.clone();
        let retry_policy = step.retry_policy.as_ref().unwrap_or(&self.default_retry_policy);
        self.call(
            &target,
            step.timeout,
            retry_policy,
            &step.retryable_error_kinds,
            || {
                let key = idempotency_key.clone();
                let target = target.clone();
                let payload = payload.to_vec();
                async move { self.client.invoke(&target, &key, &payload).await }
            },
        )
        .await
    }

    async fn compensate(
        &self,
        step: &StepDefinition,
        idempotency_key: IdempotencyKey,
        handle: &str,
    ) -> Result<AdapterOutcome<()>, AdapterCallError> {
        let Some(target) = step.compensate_target.clone() else {
            return Err(AdapterCallError {
                source: AdapterError::FatalInternal {
                    target: step.name.clone(),
                    message: "compensate called on a step with no compensator".to_string(),
                },
                attempts: 0,
            });
        };
        let retry_policy = step.retry_policy.as_ref().unwrap_or(&self.default_retry_policy);
        self.call(
            &target,
            step.timeout,
            retry_policy,
            &step.retryable_error_kinds,
            || {
                let key = idempotency_key.clone();
                let target = target.clone();
                let handle = handle.to_string();
                async move { self.client.compensate(&target, &key, &handle).await }
            },
        )
        .await
    }
}
