//! A retry-decorator over any `SagaRepository`, grounded in the
//! `backon::ExponentialBuilder` idiom used throughout the teacher's
//! reconnect loops (`bus::amqp::consume_with_reconnect`).
//!
//! Every operation is retried according to the configured strategy, with
//! one deliberate exception: `RepositoryError::VersionConflict` is never
//! retried here. Retrying a stale write without first reloading the
//! current version can never succeed — that reload-and-replay has to
//! happen one layer up, in the saga handler that knows how to recompute
//! the write from the fresh instance. Blindly retrying at this layer would
//! just repeat the same conflicting write until the strategy gives up.

use super::{RepositoryError, SagaQuery, SagaRepository};
use crate::retry::RetryStrategy;
use crate::saga::SagaInstance;
use async_trait::async_trait;
use std::sync::Arc;

pub struct RetryingSagaRepository<R: SagaRepository> {
    inner: Arc<R>,
    strategy: RetryStrategy,
}

impl<R: SagaRepository> RetryingSagaRepository<R> {
    pub fn new(inner: Arc<R>, strategy: RetryStrategy) -> Self {
        Self { inner, strategy }
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, RepositoryError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RepositoryError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(RepositoryError::VersionConflict { correlation_id, expected, found }) => {
                    return Err(RepositoryError::VersionConflict { correlation_id, expected, found });
                }
                Err(err) => {
                    attempt += 1;
                    match self.strategy.delay_for_attempt(attempt) {
                        Some(delay) => {
                            tracing::warn!(attempt, error = %err, "repository operation failed, retrying");
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            continue;
                        }
                        None => return Err(err),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<R: SagaRepository> SagaRepository for RetryingSagaRepository<R> {
    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<SagaInstance>, RepositoryError> {
        self.with_retry(|| self.inner.find_by_correlation_id(correlation_id))
            .await
    }

    async fn save(&self, instance: &SagaInstance) -> Result<i64, RepositoryError> {
        self.with_retry(|| self.inner.save(instance)).await
    }

    async fn archive(&self, correlation_id: &str) -> Result<(), RepositoryError> {
        self.with_retry(|| self.inner.archive(correlation_id)).await
    }

    async fn delete(&self, correlation_id: &str) -> Result<(), RepositoryError> {
        self.with_retry(|| self.inner.delete(correlation_id)).await
    }

    async fn list(&self, query: &SagaQuery) -> Result<Vec<SagaInstance>, RepositoryError> {
        self.with_retry(|| self.inner.list(query)).await
    }

    async fn archive_expired(&self, ttl: std::time::Duration) -> Result<u64, RepositoryError> {
        self.with_retry(|| self.inner.archive_expired(ttl)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::repository::InMemorySagaRepository;

    #[tokio::test]
    async fn version_conflict_is_not_retried() {
        let inner = Arc::new(InMemorySagaRepository::new());
        inner.save(&SagaInstance::new("order-1")).await.unwrap();
        let repo = RetryingSagaRepository::new(inner, RetryStrategy::Immediate { retries: 3 });

        // instance.version is 0 but the stored row is now at version 1: a
        // conflict that must surface immediately, not after 3 retries.
        let err = repo.save(&SagaInstance::new("order-1")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn backend_errors_are_retried_until_strategy_gives_up() {
        let inner = Arc::new(InMemorySagaRepository::new());
        inner.set_fail_on_find(true).await;
        let repo = RetryingSagaRepository::new(inner, RetryStrategy::Immediate { retries: 2 });

        let err = repo.find_by_correlation_id("order-1").await.unwrap_err();
        assert!(matches!(err, RepositoryError::Backend(_)));
    }
}
