//! Transfer run configuration.

use std::str::FromStr;
use std::time::Duration;

use chainbatch_core::policy::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};
use chainbatch_core::WorkerPoolConfig;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// Topology rule mapping source wallets to target wallets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferMode {
    /// `w[i] → w[i+1]`
    OneToOne,
    /// `w[0] → w[i]`, i ≥ 1
    OneToMany,
    /// `w[i] → w[n-1]`, i < n-1
    ManyToOne,
    /// `w[i] → w[(i+1) mod n]`, a full ring
    ManyToMany,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneToOne => "one-to-one",
            Self::OneToMany => "one-to-many",
            Self::ManyToOne => "many-to-one",
            Self::ManyToMany => "many-to-many",
        }
    }
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferMode {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one-to-one" => Ok(Self::OneToOne),
            "one-to-many" => Ok(Self::OneToMany),
            "many-to-one" => Ok(Self::ManyToOne),
            "many-to-many" => Ok(Self::ManyToMany),
            other => Err(TransferError::UnknownMode(other.to_string())),
        }
    }
}

/// How much each transfer moves, in wei.
///
/// `fixed` wins when set; otherwise `min`/`max` describe a uniform range
/// `[min, max)`. With neither, [`crate::generator::DEFAULT_AMOUNT_WEI`] applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u128>,
}

impl AmountPolicy {
    pub fn fixed(amount: u128) -> Self {
        Self {
            fixed: Some(amount),
            ..Default::default()
        }
    }

    pub fn range(min: u128, max: u128) -> Self {
        Self {
            fixed: None,
            min: Some(min),
            max: Some(max),
        }
    }

    /// Reject a half-specified or inverted range.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.fixed.is_some() {
            return Ok(());
        }
        match (self.min, self.max) {
            (Some(min), Some(max)) if min > max => Err(TransferError::InvalidAmount(format!(
                "range minimum {min} exceeds maximum {max}"
            ))),
            (Some(_), None) | (None, Some(_)) => Err(TransferError::InvalidAmount(
                "amount range needs both min and max".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Slowest accepted request rate: one request every 1000 seconds.
pub const MIN_RATE_LIMIT: f64 = 0.001;

/// Declarative description of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub mode: TransferMode,
    /// Receive-only identities appended after the signer's wallets.
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub amount: AmountPolicy,
    /// Gas price in wei, used unless `auto_gas` is set.
    #[serde(default = "default_gas_price")]
    pub gas_price: u128,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Ask the chain for gas price and limit per transfer.
    #[serde(default)]
    pub auto_gas: bool,
    /// Calldata attached to every transfer.
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Task queue size; defaults to twice the worker count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    /// Requests per second across all workers.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: f64,
    /// When set, switch to a token bucket of this capacity refilling at `rate_limit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_burst: Option<f64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Random jitter as a fraction of each delay (0.0 = none).
    #[serde(default)]
    pub retry_jitter: f64,
    #[serde(default = "default_breaker_failures")]
    pub breaker_failures: u32,
    #[serde(default = "default_breaker_reset_secs")]
    pub breaker_reset_secs: u64,
    /// Confirmations to wait for after sending (0 = don't wait).
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    /// Upper bound for the whole run.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_gas_price() -> u128 { 20_000_000_000 }
fn default_gas_limit() -> u64 { 21_000 }
fn default_workers() -> usize { 10 }
fn default_rate_limit() -> f64 { 10.0 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 1_000 }
fn default_max_retry_delay_ms() -> u64 { 300_000 }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_breaker_failures() -> u32 { 10 }
fn default_breaker_reset_secs() -> u64 { 300 }
fn default_confirmations() -> u64 { 1 }
fn default_timeout_secs() -> u64 { 300 }

impl TransferConfig {
    /// A config for `mode` with every other field at its default.
    pub fn new(mode: TransferMode) -> Self {
        Self {
            mode,
            recipients: vec![],
            amount: AmountPolicy::default(),
            gas_price: default_gas_price(),
            gas_limit: default_gas_limit(),
            auto_gas: false,
            data: vec![],
            workers: default_workers(),
            queue_capacity: None,
            rate_limit: default_rate_limit(),
            rate_limit_burst: None,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            backoff_factor: default_backoff_factor(),
            retry_jitter: 0.0,
            breaker_failures: default_breaker_failures(),
            breaker_reset_secs: default_breaker_reset_secs(),
            confirmations: default_confirmations(),
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Fail fast on values that would make the run meaningless.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.workers == 0 {
            return Err(TransferError::InvalidConfig("workers must be > 0".into()));
        }
        if self.queue_capacity == Some(0) {
            return Err(TransferError::InvalidConfig("queue_capacity must be > 0".into()));
        }
        if !(self.rate_limit >= MIN_RATE_LIMIT && self.rate_limit.is_finite()) {
            return Err(TransferError::InvalidConfig(format!(
                "rate_limit must be finite and >= {MIN_RATE_LIMIT}"
            )));
        }
        if matches!(self.rate_limit_burst, Some(b) if !(b >= 1.0)) {
            return Err(TransferError::InvalidConfig("rate_limit_burst must be >= 1".into()));
        }
        if !(self.backoff_factor >= 1.0 && self.backoff_factor.is_finite()) {
            return Err(TransferError::InvalidConfig("backoff_factor must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(TransferError::InvalidConfig("retry_jitter must be within [0, 1]".into()));
        }
        if self.breaker_failures == 0 {
            return Err(TransferError::InvalidConfig("breaker_failures must be > 0".into()));
        }
        if self.timeout_secs == 0 {
            return Err(TransferError::InvalidConfig("timeout_secs must be > 0".into()));
        }
        if self.recipients.iter().any(|r| r.trim().is_empty()) {
            return Err(TransferError::InvalidConfig("recipient address is empty".into()));
        }
        self.amount.validate()
    }

    /// Pool sizing for a run of `task_count` tasks. The queue always fits
    /// the whole batch so non-blocking submission cannot fail on capacity.
    pub fn pool_config(&self, task_count: usize) -> WorkerPoolConfig {
        let configured = self.queue_capacity.unwrap_or(self.workers * 2);
        WorkerPoolConfig {
            worker_count: self.workers,
            queue_capacity: configured.max(task_count).max(1),
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        match self.rate_limit_burst {
            Some(capacity) => RateLimiterConfig::TokenBucket {
                capacity,
                refill_rate: self.rate_limit,
            },
            None => RateLimiterConfig::FixedInterval {
                rate: self.rate_limit,
            },
        }
    }

    /// Retry schedule; the retryability predicate is added by the orchestrator.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            multiplier: self.backoff_factor,
            jitter_fraction: self.retry_jitter,
            ..Default::default()
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_failures: self.breaker_failures,
            reset_timeout: Duration::from_secs(self.breaker_reset_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
