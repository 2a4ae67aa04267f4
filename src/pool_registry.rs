//! C1 - Resource Pool Registry: CRUD over pools (spec.md §4.1).

use chrono::Utc;
use scc::HashMap as ConcurrentHashMap;
use thiserror::Error;

use crate::model::{PoolId, PoolStatus, Quotas, ResourcePool};

#[derive(Debug, Error)]
pub enum PoolRegistryError {
    #[error("pool not found: {0}")]
    NotFound(PoolId),
    #[error("pool not found by name: {0}")]
    NotFoundByName(String),
    #[error("pool name already in use: {0}")]
    Conflict(String),
    #[error("pool {0} has {1} live worker(s) and cannot be deleted")]
    BusyPool(PoolId, usize),
}

pub struct PoolRegistry {
    by_id: ConcurrentHashMap<PoolId, ResourcePool>,
    name_index: ConcurrentHashMap<String, PoolId>,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            by_id: ConcurrentHashMap::new(),
            name_index: ConcurrentHashMap::new(),
        }
    }

    pub async fn create(
        &self,
        id: PoolId,
        name: String,
        pool_type: String,
        quotas: Quotas,
    ) -> Result<ResourcePool, PoolRegistryError> {
        if self.name_index.contains_async(&name).await {
            return Err(PoolRegistryError::Conflict(name));
        }

        let pool = ResourcePool {
            id: id.clone(),
            name: name.clone(),
            pool_type,
            status: PoolStatus::Active,
            quotas,
            labels: Default::default(),
            annotations: Default::default(),
            created_at: Utc::now(),
        };

        self.name_index
            .insert_async(name, id.clone())
            .await
            .map_err(|_| PoolRegistryError::Conflict(pool.name.clone()))?;
        self.by_id
            .insert_async(id, pool.clone())
            .await
            .map_err(|(id, _)| PoolRegistryError::Conflict(id.to_string()))?;

        Ok(pool)
    }

    pub async fn get(&self, id: &PoolId) -> Result<ResourcePool, PoolRegistryError> {
        self.by_id
            .read_async(id, |_, v| v.clone())
            .await
            .ok_or_else(|| PoolRegistryError::NotFound(id.clone()))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<ResourcePool, PoolRegistryError> {
        let id = self
            .name_index
            .read_async(name, |_, v| v.clone())
            .await
            .ok_or_else(|| PoolRegistryError::NotFoundByName(name.to_string()))?;
        self.get(&id).await
    }

    pub async fn list(&self) -> Vec<ResourcePool> {
        let mut pools = Vec::new();
        self.by_id
            .scan_async(|_, v| pools.push(v.clone()))
            .await;
        pools
    }

    pub async fn list_active(&self) -> Vec<ResourcePool> {
        self.list()
            .await
            .into_iter()
            .filter(|p| p.status == PoolStatus::Active)
            .collect()
    }

    pub async fn update(
        &self,
        id: &PoolId,
        mutate: impl FnOnce(&mut ResourcePool),
    ) -> Result<ResourcePool, PoolRegistryError> {
        let mut updated = None;
        self.by_id
            .update_async(id, |_, pool| {
                mutate(pool);
                updated = Some(pool.clone());
            })
            .await
            .ok_or_else(|| PoolRegistryError::NotFound(id.clone()))?;
        updated.ok_or_else(|| PoolRegistryError::NotFound(id.clone()))
    }

    /// Two-phase delete: mark TERMINATING first, then remove once no
    /// worker still references the pool (spec.md §4.1). `live_worker_count`
    /// is supplied by the caller (the Worker Registry, C3) to avoid a
    /// circular dependency between the two registries.
    pub async fn mark_terminating(&self, id: &PoolId) -> Result<ResourcePool, PoolRegistryError> {
        self.update(id, |pool| pool.status = PoolStatus::Terminating)
            .await
    }

    pub async fn delete(&self, id: &PoolId, live_worker_count: usize) -> Result<(), PoolRegistryError> {
        if live_worker_count > 0 {
            return Err(PoolRegistryError::BusyPool(id.clone(), live_worker_count));
        }

        let pool = self.get(id).await?;
        self.by_id.remove_async(id).await;
        self.name_index.remove_async(&pool.name).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quotas() -> Quotas {
        Quotas {
            max_workers: 10,
            max_jobs: 100,
            max_concurrent_jobs: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let registry = PoolRegistry::new();
        let id = PoolId::new("p1").unwrap();
        registry
            .create(id.clone(), "pool-one".to_string(), "static".to_string(), quotas())
            .await
            .unwrap();

        let fetched = registry.get(&id).await.unwrap();
        assert_eq!(fetched.name, "pool-one");
        let by_name = registry.get_by_name("pool-one").await.unwrap();
        assert_eq!(by_name.id, id);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let registry = PoolRegistry::new();
        registry
            .create(PoolId::new("p1").unwrap(), "dup".to_string(), "static".to_string(), quotas())
            .await
            .unwrap();

        let result = registry
            .create(PoolId::new("p2").unwrap(), "dup".to_string(), "static".to_string(), quotas())
            .await;
        assert!(matches!(result, Err(PoolRegistryError::Conflict(_))));
    }

    #[tokio::test]
    async fn delete_with_live_workers_is_rejected() {
        let registry = PoolRegistry::new();
        let id = PoolId::new("p1").unwrap();
        registry
            .create(id.clone(), "pool-one".to_string(), "static".to_string(), quotas())
            .await
            .unwrap();

        let result = registry.delete(&id, 2).await;
        assert!(matches!(result, Err(PoolRegistryError::BusyPool(_, 2))));
    }

    #[tokio::test]
    async fn delete_is_two_phase() {
        let registry = PoolRegistry::new();
        let id = PoolId::new("p1").unwrap();
        registry
            .create(id.clone(), "pool-one".to_string(), "static".to_string(), quotas())
            .await
            .unwrap();

        registry.mark_terminating(&id).await.unwrap();
        assert_eq!(registry.get(&id).await.unwrap().status, PoolStatus::Terminating);

        registry.delete(&id, 0).await.unwrap();
        assert!(matches!(registry.get(&id).await, Err(PoolRegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_active_filters_non_active() {
        let registry = PoolRegistry::new();
        let id = PoolId::new("p1").unwrap();
        registry
            .create(id.clone(), "pool-one".to_string(), "static".to_string(), quotas())
            .await
            .unwrap();
        registry.mark_terminating(&id).await.unwrap();

        assert!(registry.list_active().await.is_empty());
        assert_eq!(registry.list().await.len(), 1);
    }
}
