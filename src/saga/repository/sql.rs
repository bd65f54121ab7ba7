//! SQL-backed `SagaRepository` implementations, grounded in
//! `storage::sqlite::SqliteEventStore` and `storage::postgres::PostgresEventStore`:
//! one concrete adapter per backend (sea-query builds the SQL string, sqlx
//! executes it), rather than one generic type, matching how the teacher
//! keeps a `sqlite/` and a `postgres/` module side by side instead of
//! parameterizing `EventStore` over `sqlx::Database`.

use super::{RepositoryError, SagaQuery, SagaRepository};
use crate::saga::SagaInstance;
use async_trait::async_trait;
use sea_query::{Expr, Iden, Order, Query};

#[derive(Iden)]
enum Sagas {
    Table,
    CorrelationId,
    CurrentState,
    Version,
    Data,
    ArchivedAt,
}

/// The JSONB/TEXT blob stored in the `data` column: the user data bag plus
/// the fields `SagaInstance` needs that don't get their own column (spec
/// §6 "Repository storage schemas").
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct StoredPayload {
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    compensation_activities: Vec<crate::saga::CompensationActivity>,
    #[serde(default)]
    compensating: bool,
}

fn row_to_instance(
    correlation_id: String,
    current_state: String,
    version: i64,
    data: String,
    archived_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<SagaInstance, RepositoryError> {
    let payload: StoredPayload =
        serde_json::from_str(&data).map_err(|e| RepositoryError::Backend(e.to_string()))?;
    Ok(SagaInstance {
        correlation_id,
        current_state,
        version,
        data: payload.data,
        compensation_activities: payload.compensation_activities,
        compensating: payload.compensating,
        archived_at,
    })
}

fn encode_instance(instance: &SagaInstance) -> Result<String, RepositoryError> {
    serde_json::to_string(&StoredPayload {
        data: instance.data.clone(),
        compensation_activities: instance.compensation_activities.clone(),
        compensating: instance.compensating,
    })
    .map_err(|e| RepositoryError::Backend(e.to_string()))
}

macro_rules! sql_saga_repository {
    ($name:ident, $pool:ty, $builder:expr) => {
        /// One pooled connection, matching `storage::$name`'s adapter shape.
        pub struct $name {
            pool: $pool,
        }

        impl $name {
            pub fn new(pool: $pool) -> Self {
                Self { pool }
            }
        }

        #[async_trait]
        impl SagaRepository for $name {
            async fn find_by_correlation_id(
                &self,
                correlation_id: &str,
            ) -> Result<Option<SagaInstance>, RepositoryError> {
                let sql = Query::select()
                    .columns([
                        Sagas::CorrelationId,
                        Sagas::CurrentState,
                        Sagas::Version,
                        Sagas::Data,
                        Sagas::ArchivedAt,
                    ])
                    .from(Sagas::Table)
                    .and_where(Expr::col(Sagas::CorrelationId).eq(correlation_id))
                    .and_where(Expr::col(Sagas::ArchivedAt).is_null())
                    .to_string($builder);

                let row = sqlx::query(&sql)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| RepositoryError::Backend(e.to_string()))?;

                let Some(row) = row else { return Ok(None) };
                use sqlx::Row;
                Ok(Some(row_to_instance(
                    row.get("correlation_id"),
                    row.get("current_state"),
                    row.get("version"),
                    row.get("data"),
                    row.get("archived_at"),
                )?))
            }

            async fn save(&self, instance: &SagaInstance) -> Result<i64, RepositoryError> {
                let data = encode_instance(instance)?;
                let new_version = instance.version + 1;

                // Optimistic concurrency: the UPDATE branch only matches rows
                // whose stored version equals the instance's expected version.
                let update_sql = Query::update()
                    .table(Sagas::Table)
                    .values([
                        (Sagas::CurrentState, instance.current_state.clone().into()),
                        (Sagas::Version, new_version.into()),
                        (Sagas::Data, data.clone().into()),
                    ])
                    .and_where(Expr::col(Sagas::CorrelationId).eq(instance.correlation_id.clone()))
                    .and_where(Expr::col(Sagas::Version).eq(instance.version))
                    .to_string($builder);

                let result = sqlx::query(&update_sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| RepositoryError::Backend(e.to_string()))?;

                if result.rows_affected() > 0 {
                    return Ok(new_version);
                }

                // No row updated: either it doesn't exist yet, or the version
                // didn't match. Distinguish by re-reading the current row.
                match self.find_by_correlation_id(&instance.correlation_id).await? {
                    Some(existing) => Err(RepositoryError::VersionConflict {
                        correlation_id: instance.correlation_id.clone(),
                        expected: instance.version,
                        found: existing.version,
                    }),
                    None => {
                        if instance.version != 0 {
                            return Err(RepositoryError::VersionConflict {
                                correlation_id: instance.correlation_id.clone(),
                                expected: instance.version,
                                found: 0,
                            });
                        }
                        let insert_sql = Query::insert()
                            .into_table(Sagas::Table)
                            .columns([
                                Sagas::CorrelationId,
                                Sagas::CurrentState,
                                Sagas::Version,
                                Sagas::Data,
                            ])
                            .values_panic([
                                instance.correlation_id.clone().into(),
                                instance.current_state.clone().into(),
                                1i64.into(),
                                data.into(),
                            ])
                            .to_string($builder);
                        sqlx::query(&insert_sql)
                            .execute(&self.pool)
                            .await
                            .map_err(|e| RepositoryError::Backend(e.to_string()))?;
                        Ok(1)
                    }
                }
            }

            async fn archive(&self, correlation_id: &str) -> Result<(), RepositoryError> {
                let sql = Query::update()
                    .table(Sagas::Table)
                    .value(Sagas::ArchivedAt, chrono::Utc::now())
                    .and_where(Expr::col(Sagas::CorrelationId).eq(correlation_id))
                    .to_string($builder);
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| RepositoryError::Backend(e.to_string()))?;
                Ok(())
            }

            async fn delete(&self, correlation_id: &str) -> Result<(), RepositoryError> {
                let sql = Query::delete()
                    .from_table(Sagas::Table)
                    .and_where(Expr::col(Sagas::CorrelationId).eq(correlation_id))
                    .to_string($builder);
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| RepositoryError::Backend(e.to_string()))?;
                Ok(())
            }

            async fn list(&self, query: &SagaQuery) -> Result<Vec<SagaInstance>, RepositoryError> {
                let mut select = Query::select();
                select
                    .columns([
                        Sagas::CorrelationId,
                        Sagas::CurrentState,
                        Sagas::Version,
                        Sagas::Data,
                        Sagas::ArchivedAt,
                    ])
                    .from(Sagas::Table)
                    .order_by(Sagas::CorrelationId, Order::Asc);

                if !query.include_archived {
                    select.and_where(Expr::col(Sagas::ArchivedAt).is_null());
                }
                if let Some(state) = &query.state {
                    select.and_where(Expr::col(Sagas::CurrentState).eq(state.clone()));
                }

                let sql = select.to_string($builder);
                let rows = sqlx::query(&sql)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| RepositoryError::Backend(e.to_string()))?;

                use sqlx::Row;
                rows.into_iter()
                    .map(|row| {
                        row_to_instance(
                            row.get("correlation_id"),
                            row.get("current_state"),
                            row.get("version"),
                            row.get("data"),
                            row.get("archived_at"),
                        )
                    })
                    .collect()
            }

            async fn archive_expired(&self, ttl: std::time::Duration) -> Result<u64, RepositoryError> {
                let ttl = chrono::Duration::from_std(ttl)
                    .map_err(|e| RepositoryError::Backend(e.to_string()))?;
                let cutoff = chrono::Utc::now() - ttl;
                let sql = Query::delete()
                    .from_table(Sagas::Table)
                    .and_where(Expr::col(Sagas::ArchivedAt).is_not_null())
                    .and_where(Expr::col(Sagas::ArchivedAt).lt(cutoff))
                    .to_string($builder);
                let result = sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| RepositoryError::Backend(e.to_string()))?;
                Ok(result.rows_affected())
            }
        }
    };
}

#[cfg(feature = "sqlite")]
sql_saga_repository!(SqliteSagaRepository, sqlx::SqlitePool, sea_query::SqliteQueryBuilder);

#[cfg(feature = "postgres")]
sql_saga_repository!(PostgresSagaRepository, sqlx::PgPool, sea_query::PostgresQueryBuilder);

#[cfg(feature = "sqlite")]
pub use SqliteSagaRepository as SqlSagaRepository;
#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub use PostgresSagaRepository as SqlSagaRepository;
