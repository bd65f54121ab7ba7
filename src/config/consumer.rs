//! Per-endpoint consumer configuration (spec §6 "Configuration surface").

use crate::retry::RetryStrategy;
use serde::Deserialize;

/// Delayed-redelivery options (level 2, spec §4.2 step 8).
#[derive(Debug, Clone, Deserialize)]
pub struct RedeliveryConfig {
    pub strategy: RetryStrategySpec,
}

/// Per-endpoint options: prefetch, level-1 retry, level-2 redelivery, purge.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerEndpointConfig {
    pub prefetch_count: u16,
    pub retry: Option<RetryStrategySpec>,
    pub redelivery: Option<RetryStrategySpec>,
    pub purge_on_startup: bool,
}

impl Default for ConsumerEndpointConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 16,
            retry: None,
            redelivery: None,
            purge_on_startup: false,
        }
    }
}

impl ConsumerEndpointConfig {
    pub fn retry_strategy(&self) -> Option<RetryStrategy> {
        self.retry.as_ref().map(RetryStrategySpec::to_strategy)
    }

    pub fn redelivery_strategy(&self) -> Option<RetryStrategy> {
        self.redelivery.as_ref().map(RetryStrategySpec::to_strategy)
    }
}

/// Serializable form of `RetryStrategy`, since the runtime enum carries
/// `Duration`s that aren't directly `Deserialize`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategySpec {
    Immediate { retries: u32 },
    Interval { retries: u32, delay_ms: u64 },
    Intervals { delays_ms: Vec<u64> },
    Exponential {
        retries: u32,
        initial_ms: u64,
        factor: f64,
    },
}

impl RetryStrategySpec {
    pub fn to_strategy(&self) -> RetryStrategy {
        use std::time::Duration;
        match self {
            RetryStrategySpec::Immediate { retries } => RetryStrategy::Immediate {
                retries: *retries,
            },
            RetryStrategySpec::Interval { retries, delay_ms } => RetryStrategy::Interval {
                retries: *retries,
                delay: Duration::from_millis(*delay_ms),
            },
            RetryStrategySpec::Intervals { delays_ms } => RetryStrategy::Intervals {
                delays: delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            },
            RetryStrategySpec::Exponential {
                retries,
                initial_ms,
                factor,
            } => RetryStrategy::Exponential {
                retries: *retries,
                initial: Duration::from_millis(*initial_ms),
                factor: *factor,
            },
        }
    }
}
