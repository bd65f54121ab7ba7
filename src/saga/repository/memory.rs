//! In-memory `SagaRepository`, grounded in `MockEventStore`'s shape: a
//! `RwLock<HashMap<..>>` plus fail-injection toggles so pipeline tests can
//! exercise `RepositoryError` paths without a database.

use super::{RepositoryError, SagaQuery, SagaRepository};
use crate::saga::SagaInstance;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemorySagaRepository {
    instances: RwLock<HashMap<String, SagaInstance>>,
    fail_on_save: RwLock<bool>,
    fail_on_find: RwLock<bool>,
}

impl InMemorySagaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_save(&self, fail: bool) {
        *self.fail_on_save.write().await = fail;
    }

    pub async fn set_fail_on_find(&self, fail: bool) {
        *self.fail_on_find.write().await = fail;
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<SagaInstance>, RepositoryError> {
        if *self.fail_on_find.read().await {
            return Err(RepositoryError::Backend("injected find failure".to_string()));
        }
        Ok(self
            .instances
            .read()
            .await
            .get(correlation_id)
            .filter(|i| i.archived_at.is_none())
            .cloned())
    }

    async fn save(&self, instance: &SagaInstance) -> Result<i64, RepositoryError> {
        if *self.fail_on_save.read().await {
            return Err(RepositoryError::Backend("injected save failure".to_string()));
        }
        let mut instances = self.instances.write().await;
        match instances.get(&instance.correlation_id) {
            Some(existing) if existing.version != instance.version => {
                return Err(RepositoryError::VersionConflict {
                    correlation_id: instance.correlation_id.clone(),
                    expected: instance.version,
                    found: existing.version,
                });
            }
            _ => {}
        }
        let mut saved = instance.clone();
        saved.version += 1;
        let new_version = saved.version;
        instances.insert(instance.correlation_id.clone(), saved);
        Ok(new_version)
    }

    async fn archive(&self, correlation_id: &str) -> Result<(), RepositoryError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(correlation_id)
            .ok_or_else(|| RepositoryError::NotFound(correlation_id.to_string()))?;
        instance.archived_at = Some(Utc::now());
        Ok(())
    }

    async fn delete(&self, correlation_id: &str) -> Result<(), RepositoryError> {
        self.instances.write().await.remove(correlation_id);
        Ok(())
    }

    async fn list(&self, query: &SagaQuery) -> Result<Vec<SagaInstance>, RepositoryError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| query.include_archived || i.archived_at.is_none())
            .filter(|i| match &query.state {
                Some(s) => *s == i.current_state,
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn archive_expired(&self, ttl: std::time::Duration) -> Result<u64, RepositoryError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| RepositoryError::Backend(e.to_string()))?;
        let cutoff = Utc::now() - ttl;
        let mut instances = self.instances.write().await;
        let before = instances.len();
        instances.retain(|_, instance| !matches!(instance.archived_at, Some(at) if at < cutoff));
        Ok((before - instances.len()) as u64)
    }
}
