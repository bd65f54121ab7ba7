//! The `SagaRepository` port (spec §4.3 step 8, §6 persistence): load/save
//! by correlation id with optimistic concurrency on `version`.
//!
//! Grounded in `angzarr::storage::EventStore`'s port/adapter split: one
//! trait, one in-memory adapter for tests, one SQL adapter for production,
//! and a retry-decorator wrapping either.

pub mod memory;
pub mod retrying;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub mod sql;

pub use memory::InMemorySagaRepository;
pub use retrying::RetryingSagaRepository;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub use sql::SqlSagaRepository;

use super::SagaInstance;
use async_trait::async_trait;

/// Errors a `SagaRepository` can raise (spec §7 kind 3).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    /// The write's expected `version` didn't match the stored row: someone
    /// else updated this instance first. Transient at the consumer-pipeline
    /// level (reload and replay), but deliberately NOT retried by
    /// `RetryingSagaRepository` itself — see that module's doc comment.
    #[error("version conflict for {correlation_id}: expected {expected}, found {found}")]
    VersionConflict {
        correlation_id: String,
        expected: i64,
        found: i64,
    },
    #[error("no saga instance found for {0}")]
    NotFound(String),
    #[error("repository backend error: {0}")]
    Backend(String),
}

/// Optional filters for bulk lookups (used by admin/inspection tooling,
/// not by the hot path).
#[derive(Debug, Clone, Default)]
pub struct SagaQuery {
    pub state: Option<String>,
    pub include_archived: bool,
}

/// Persistence port for saga instances (spec §4.3 step 8 / §6).
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Look up an instance by correlation id, regardless of state.
    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<SagaInstance>, RepositoryError>;

    /// Insert or update an instance, enforcing optimistic concurrency: the
    /// write succeeds only if the stored row's version matches
    /// `instance.version` (or the row doesn't exist yet and
    /// `instance.version == 0`). Returns the new version on success.
    async fn save(&self, instance: &SagaInstance) -> Result<i64, RepositoryError>;

    /// Soft-delete: mark `archived_at` and retain the row.
    async fn archive(&self, correlation_id: &str) -> Result<(), RepositoryError>;

    /// Hard-delete the row.
    async fn delete(&self, correlation_id: &str) -> Result<(), RepositoryError>;

    /// List instances matching `query`, for admin/inspection tooling.
    async fn list(&self, query: &SagaQuery) -> Result<Vec<SagaInstance>, RepositoryError>;

    /// Hard-delete archived instances whose `archived_at` is older than
    /// `ttl` (spec §4.3 "document store" TTL index / §6 "TTL on
    /// archivedAt when archiveTTL configured"). Returns the number of rows
    /// removed. The default no-op suits backends a particular deployment
    /// never archives into.
    async fn archive_expired(&self, ttl: std::time::Duration) -> Result<u64, RepositoryError> {
        let _ = ttl;
        Ok(0)
    }
}

/// Periodically sweep archived instances past their configured TTL, driving
/// [`SagaRepository::archive_expired`] on a fixed tick. Spawned once per
/// saga by the host application from that saga's
/// `config::SagaConfig::archive_ttl()`; callers with no TTL configured
/// simply don't spawn this.
pub fn spawn_archive_sweep(
    repository: std::sync::Arc<dyn SagaRepository>,
    ttl: std::time::Duration,
    check_interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(check_interval);
        loop {
            interval.tick().await;
            match repository.archive_expired(ttl).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "swept expired archived saga instances"),
                Err(error) => tracing::warn!(%error, "archive sweep failed"),
            }
        }
    })
}
