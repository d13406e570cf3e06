//! Configuration for the saga runtime: coordinator leasing, adapter
//! retry/circuit-breaker/bulkhead policy, and outbox relay cadence.
//!
//! Mirrors the `coordinator.*` / `adapter.*` / `outbox.*` configuration keys;
//! every field has the default named there. `AdapterConfig`'s `retry_*`
//! fields become the `RetryPolicy` a `StepDefinition` inherits when it
//! doesn't specify its own (see `RetryingAdapter::new`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Root configuration for a `SagaRuntime`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    pub coordinator: CoordinatorConfig,
    pub adapter: AdapterConfig,
    pub outbox: OutboxConfig,
}

impl RuntimeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&contents)
    }
}

/// `coordinator.*` configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat: Duration,
    #[serde(with = "humantime_serde")]
    pub recovery_scan_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            heartbeat: Duration::from_secs(10),
            recovery_scan_interval: Duration::from_secs(30),
        }
    }
}

/// `adapter.*` configuration keys: retry backoff, circuit breaker, bulkhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    #[serde(with = "humantime_serde")]
    pub retry_base: Duration,
    pub retry_factor: f64,
    #[serde(with = "humantime_serde")]
    pub retry_cap: Duration,
    pub retry_max_attempts: u32,
    /// Fraction of failures, in `[0.0, 1.0]`, within the `breaker_min_samples`-sized
    /// rolling window that trips the breaker open.
    pub breaker_failure_rate: f64,
    pub breaker_min_samples: u32,
    #[serde(with = "humantime_serde")]
    pub breaker_open_duration: Duration,
    pub breaker_half_open_max_calls: u32,
    pub bulkhead_max_concurrent: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_millis(50),
            retry_factor: 2.0,
            retry_cap: Duration::from_secs(2),
            retry_max_attempts: 4,
            breaker_failure_rate: 0.5,
            breaker_min_samples: 5,
            breaker_open_duration: Duration::from_secs(30),
            breaker_half_open_max_calls: 1,
            bulkhead_max_concurrent: 16,
        }
    }
}

impl From<&AdapterConfig> for RetryPolicy {
    /// The default retry policy a step inherits when its own `StepDefinition`
    /// doesn't specify one (see `StepDefinition::retry_policy`).
    fn from(cfg: &AdapterConfig) -> Self {
        Self {
            base: cfg.retry_base,
            factor: cfg.retry_factor,
            cap: cfg.retry_cap,
            max_attempts: cfg.retry_max_attempts,
        }
    }
}

/// `outbox.*` configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub dead_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            dead_attempts: 50,
        }
    }
}
