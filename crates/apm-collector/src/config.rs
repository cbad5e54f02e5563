// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const BATCH_SIZE: &str = "APM_BATCH_SIZE";
pub const BATCH_TIME: &str = "APM_BATCH_TIME";
pub const BATCH_THREADS: &str = "APM_BATCH_THREADS";
pub const TENANT_ID: &str = "APM_TENANT_ID";
pub const DELIVERY_TIMEOUT: &str = "APM_DELIVERY_TIMEOUT_MS";
pub const DELIVERY_RETRIES: &str = "APM_DELIVERY_RETRIES";
pub const DELIVERY_RETRY_BACKOFF: &str = "APM_DELIVERY_RETRY_BACKOFF_MS";
pub const CORRELATION_TTL: &str = "APM_CORRELATION_TTL_MS";
pub const CORRELATION_SWEEP: &str = "APM_CORRELATION_SWEEP_MS";
pub const CORRELATION_MAX_PENDING: &str = "APM_CORRELATION_MAX_PENDING";

const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_BATCH_TIME_MS: u64 = 500;
const DEFAULT_BATCH_THREADS: usize = 5;
const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CORRELATION_TTL_MS: u64 = 60_000;
const DEFAULT_CORRELATION_SWEEP_MS: u64 = 5_000;
const DEFAULT_CORRELATION_MAX_PENDING: usize = 100_000;

/// Where configuration values come from. Keys are the `APM_*` constants in this module.
pub trait ConfigSource {
    fn property(&self, key: &str) -> Option<String>;
}

/// Reads configuration from process environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn property(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

impl ConfigSource for HashMap<String, String> {
    fn property(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

fn parse<T: FromStr>(source: &dyn ConfigSource, key: &'static str) -> Result<Option<T>, ConfigError> {
    match source.property(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

/// What the delivery executor does with a batch the collector did not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// Log the batch and drop it: at-most-once delivery.
    #[default]
    Drop,
    /// Resend up to `n` more times without waiting.
    Immediate(u64),
    /// Resend up to `n` more times, waiting `attempt * delay_ms` before each retry.
    LinearBackoff(u64, u64),
}

impl RetryStrategy {
    pub fn retries(&self) -> u64 {
        match self {
            Self::Drop => 0,
            Self::Immediate(retries) | Self::LinearBackoff(retries, _) => *retries,
        }
    }

    /// Pause before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u64) -> Duration {
        match self {
            Self::LinearBackoff(_, delay_ms) => Duration::from_millis(delay_ms.saturating_mul(attempt)),
            Self::Drop | Self::Immediate(_) => Duration::ZERO,
        }
    }

    fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let retries = parse::<u64>(source, DELIVERY_RETRIES)?.unwrap_or(0);
        let backoff = parse::<u64>(source, DELIVERY_RETRY_BACKOFF)?.unwrap_or(0);
        Ok(match (retries, backoff) {
            (0, _) => Self::Drop,
            (retries, 0) => Self::Immediate(retries),
            (retries, backoff) => Self::LinearBackoff(retries, backoff),
        })
    }
}

/// Settings of the batching reporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReporterConfig {
    /// Number of buffered fragments that forces a flush.
    pub batch_size: usize,
    /// Interval of the timer-driven flush.
    pub batch_time: Duration,
    /// Tenant every batch is stored under.
    pub tenant_id: Option<String>,
    /// Maximum number of batches delivered concurrently.
    pub batch_threads: usize,
    /// Upper bound on a single collector call.
    pub delivery_timeout: Duration,
    pub retry_strategy: RetryStrategy,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_time: Duration::from_millis(DEFAULT_BATCH_TIME_MS),
            tenant_id: env::var(TENANT_ID).ok(),
            batch_threads: DEFAULT_BATCH_THREADS,
            delivery_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            retry_strategy: RetryStrategy::Drop,
        }
    }
}

impl ReporterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&EnvSource)
    }

    /// Starts from the defaults and overrides every key `source` provides. A source
    /// without a tenant keeps the process-wide default tenant.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            batch_size: parse(source, BATCH_SIZE)?.unwrap_or(defaults.batch_size),
            batch_time: parse(source, BATCH_TIME)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_time),
            tenant_id: source.property(TENANT_ID).or(defaults.tenant_id),
            batch_threads: parse(source, BATCH_THREADS)?.unwrap_or(defaults.batch_threads),
            delivery_timeout: parse(source, DELIVERY_TIMEOUT)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.delivery_timeout),
            retry_strategy: RetryStrategy::from_source(source)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch size must be greater than 0".to_string()));
        }
        if self.batch_time.is_zero() {
            return Err(ConfigError::Invalid("batch time must be greater than 0".to_string()));
        }
        if self.batch_threads == 0 {
            return Err(ConfigError::Invalid(
                "batch thread pool size must be greater than 0".to_string(),
            ));
        }
        if self.delivery_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "delivery timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of the correlation index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationConfig {
    /// How long an unmatched source record stays available.
    pub ttl: Duration,
    /// Interval of the background expiry sweep.
    pub sweep_interval: Duration,
    /// Registrations beyond this many pending records are refused.
    pub max_pending: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(DEFAULT_CORRELATION_TTL_MS),
            sweep_interval: Duration::from_millis(DEFAULT_CORRELATION_SWEEP_MS),
            max_pending: DEFAULT_CORRELATION_MAX_PENDING,
        }
    }
}

impl CorrelationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&EnvSource)
    }

    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            ttl: parse(source, CORRELATION_TTL)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.ttl),
            sweep_interval: parse(source, CORRELATION_SWEEP)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            max_pending: parse(source, CORRELATION_MAX_PENDING)?.unwrap_or(defaults.max_pending),
        };

        if config.ttl.is_zero() || config.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "correlation ttl and sweep interval must be greater than 0".to_string(),
            ));
        }
        Ok(config)
    }
}
