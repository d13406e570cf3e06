//! Per-participant circuit breaker: the standard Closed -> Open -> HalfOpen
//! state machine, tripped when the failure rate over a rolling window of
//! the `min_samples` most recent outcomes crosses `failure_rate`, so a
//! single failure on a fresh breaker never opens it outright and stale
//! failures age out of the window rather than accumulating forever.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::config::AdapterConfig;

/// Circuit breaker state for one participant target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Fraction of failures within the window, in `[0.0, 1.0]`, that trips
    /// the breaker open.
    pub failure_rate: f64,
    /// Samples the rolling window holds, and the minimum that must have
    /// accrued before the failure rate is trusted.
    pub min_samples: u32,
    pub open_duration: Duration,
    pub half_open_max_calls: u32,
}

impl From<&AdapterConfig> for CircuitBreakerConfig {
    fn from(cfg: &AdapterConfig) -> Self {
        Self {
            failure_rate: cfg.breaker_failure_rate,
            min_samples: cfg.breaker_min_samples,
            open_duration: cfg.breaker_open_duration,
            half_open_max_calls: cfg.breaker_half_open_max_calls,
        }
    }
}

/// Returned when a breaker is open (or its half-open probe budget is spent)
/// and a call should fail fast with `UNAVAILABLE` without touching the wire.
#[derive(Debug, thiserror::Error)]
#[error("circuit open for participant '{target}': failure rate {failure_rate:.2} over window, recovery in {recovery_remaining:?}")]
pub struct CircuitOpenError {
    pub target: String,
    pub failure_rate: f64,
    pub recovery_remaining: Duration,
}

#[derive(Debug)]
struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    /// Most recent outcomes, oldest first, bounded to `config.min_samples`
    /// entries; `true` is a success.
    window: VecDeque<bool>,
    half_open_calls: u32,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            window: VecDeque::new(),
            half_open_calls: 0,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn record_outcome(&mut self, success: bool) {
        self.window.push_back(success);
        while self.window.len() > self.config.min_samples as usize {
            self.window.pop_front();
        }
    }

    fn check(&mut self, target: &str) -> Result<(), CircuitOpenError> {
        match &self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.open_duration {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_calls = 1;
                    tracing::info!(target, "circuit breaker transitioning to half-open");
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        target: target.to_string(),
                        failure_rate: self.failure_rate(),
                        recovery_remaining: self.config.open_duration - opened_at.elapsed(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        target: target.to_string(),
                        failure_rate: self.failure_rate(),
                        recovery_remaining: Duration::ZERO,
                    })
                }
            }
        }
    }

    fn record_success(&mut self, target: &str) {
        self.record_outcome(true);
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            self.half_open_calls = 0;
            self.window.clear();
            tracing::info!(target, "circuit breaker recovered, now closed");
        }
    }

    fn record_failure(&mut self, target: &str) {
        self.record_outcome(false);
        match self.state {
            CircuitState::Closed => {
                let samples = self.window.len() as u32;
                if samples >= self.config.min_samples && self.failure_rate() >= self.config.failure_rate {
                    self.state = CircuitState::Open { opened_at: Instant::now() };
                    tracing::warn!(target, failure_rate = self.failure_rate(), samples, "circuit breaker tripped open");
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open { opened_at: Instant::now() };
                self.half_open_calls = 0;
                tracing::warn!(target, "circuit breaker probe failed, back to open");
            }
            CircuitState::Open { .. } => {}
        }
    }
}

/// One circuit breaker per participant target, created lazily on first use.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    pub async fn check(&self, target: &str) -> Result<(), CircuitOpenError> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(target.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()));
        breaker.check(target)
    }

    pub async fn record_success(&self, target: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(target) {
            breaker.record_success(target);
        }
    }

    pub async fn record_failure(&self, target: &str) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(target.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()));
        breaker.record_failure(target);
    }
}
