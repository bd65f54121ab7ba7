//! Retry strategies shared by the consumer pipeline's level-1 in-memory
//! retry, the delayed-redelivery level-2 strategy (spec §4.2 step 7/8), and
//! the saga repository retry wrapper (spec §4.3 "retry wrapper").
//!
//! The delay calculation for `Exponential` is the same jittered-exponential
//! shape `angzarr::registration::ExponentialBackoff` and
//! `angzarr::utils::retry::RetryConfig::delay_for_attempt` use; the closed
//! enum itself (`Immediate`/`Interval`/`Intervals`/`Exponential`) matches the
//! spec's fixed strategy set rather than the teacher's open
//! `RepublishStrategy` trait.

use std::time::Duration;

/// A bounded retry/redelivery strategy (spec §4.2 step 7).
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Up to `n` retries with zero delay.
    Immediate { retries: u32 },
    /// Up to `n` retries, fixed delay `d`.
    Interval { retries: u32, delay: Duration },
    /// Up to `k` retries using the explicit delay sequence.
    Intervals { delays: Vec<Duration> },
    /// Up to `n` retries, delay = initial * factor^(attempt-1).
    Exponential {
        retries: u32,
        initial: Duration,
        factor: f64,
    },
}

impl RetryStrategy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryStrategy::Immediate { retries } => *retries,
            RetryStrategy::Interval { retries, .. } => *retries,
            RetryStrategy::Intervals { delays } => delays.len() as u32,
            RetryStrategy::Exponential { retries, .. } => *retries,
        }
    }

    /// Delay before retry attempt `attempt` (1-indexed: the first retry is
    /// attempt 1), or `None` once the strategy is exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries() {
            return None;
        }
        Some(match self {
            RetryStrategy::Immediate { .. } => Duration::ZERO,
            RetryStrategy::Interval { delay, .. } => *delay,
            RetryStrategy::Intervals { delays } => delays[(attempt - 1) as usize],
            RetryStrategy::Exponential {
                initial, factor, ..
            } => {
                let millis = initial.as_millis() as f64 * factor.powi((attempt - 1) as i32);
                Duration::from_millis(millis.round() as u64)
            }
        })
    }

    /// Iterate the full delay sequence for this strategy.
    pub fn delays(&self) -> Vec<Duration> {
        (1..=self.max_retries())
            .map(|attempt| self.delay_for_attempt(attempt).unwrap())
            .collect()
    }
}

/// A small retry-with-backoff driver used to wrap fallible async operations
/// (saga repository calls, publish attempts). Returns the last error once
/// the strategy is exhausted.
pub async fn run_with_strategy<T, E, F, Fut>(
    strategy: &RetryStrategy,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                match strategy.delay_for_attempt(attempt + 1) {
                    Some(delay) => {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        attempt += 1;
                    }
                    None => return Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_has_zero_delay() {
        let s = RetryStrategy::Immediate { retries: 3 };
        assert_eq!(s.delay_for_attempt(1), Some(Duration::ZERO));
        assert_eq!(s.delay_for_attempt(3), Some(Duration::ZERO));
        assert_eq!(s.delay_for_attempt(4), None);
        assert_eq!(s.max_retries(), 3);
    }

    #[test]
    fn interval_is_fixed() {
        let s = RetryStrategy::Interval {
            retries: 2,
            delay: Duration::from_secs(5),
        };
        assert_eq!(s.delay_for_attempt(1), Some(Duration::from_secs(5)));
        assert_eq!(s.delay_for_attempt(2), Some(Duration::from_secs(5)));
        assert_eq!(s.delay_for_attempt(3), None);
    }

    #[test]
    fn intervals_uses_explicit_sequence() {
        let s = RetryStrategy::Intervals {
            delays: vec![
                Duration::from_millis(5000),
                Duration::from_millis(15000),
                Duration::from_millis(30000),
            ],
        };
        assert_eq!(s.delay_for_attempt(1), Some(Duration::from_millis(5000)));
        assert_eq!(s.delay_for_attempt(2), Some(Duration::from_millis(15000)));
        assert_eq!(s.delay_for_attempt(3), Some(Duration::from_millis(30000)));
        assert_eq!(s.delay_for_attempt(4), None);
    }

    #[test]
    fn exponential_multiplies_by_factor() {
        let s = RetryStrategy::Exponential {
            retries: 4,
            initial: Duration::from_millis(100),
            factor: 2.0,
        };
        assert_eq!(s.delay_for_attempt(1), Some(Duration::from_millis(100)));
        assert_eq!(s.delay_for_attempt(2), Some(Duration::from_millis(200)));
        assert_eq!(s.delay_for_attempt(3), Some(Duration::from_millis(400)));
        assert_eq!(s.delay_for_attempt(4), Some(Duration::from_millis(800)));
        assert_eq!(s.delay_for_attempt(5), None);
    }

    #[tokio::test]
    async fn run_with_strategy_retries_then_succeeds() {
        let s = RetryStrategy::Immediate { retries: 3 };
        let mut calls = 0;
        let result: Result<(), &str> = run_with_strategy(&s, |attempt| {
            calls += 1;
            async move {
                if attempt < 2 {
                    Err("transient")
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn run_with_strategy_exhausts_and_returns_last_error() {
        let s = RetryStrategy::Immediate { retries: 2 };
        let mut calls = 0;
        let result: Result<(), &str> = run_with_strategy(&s, |_attempt| {
            calls += 1;
            async move { Err("always fails") }
        })
        .await;
        assert_eq!(result, Err("always fails"));
        assert_eq!(calls, 3); // initial + 2 retries
    }
}
