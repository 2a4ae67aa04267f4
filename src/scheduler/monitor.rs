//! Resource monitors, keyed by `pool.type`, supplying live utilization
//! numbers to the Scheduler Service (spec.md §4.6). Out-of-scope pool
//! types (kubernetes, docker) are stubbed per SPEC_FULL.md §11.4: the
//! engine never talks to a real orchestrator here, only the static
//! monitor backed by the Quota/Usage Ledger is implemented.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::ledger::QuotaLedger;
use crate::model::{ResourcePool, ResourcePoolUtilization};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("no resource monitor registered for pool type: {0}")]
    UnknownPoolType(String),
    #[error("resource monitor failed: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    async fn utilization(&self, pool: &ResourcePool) -> Result<ResourcePoolUtilization, MonitorError>;
}

/// Derives utilization entirely from the Quota/Usage Ledger's live
/// reservation counters, for pools whose capacity is declared via
/// quotas rather than discovered from an external orchestrator.
pub struct StaticLedgerMonitor {
    ledger: std::sync::Arc<QuotaLedger>,
}

impl StaticLedgerMonitor {
    pub fn new(ledger: std::sync::Arc<QuotaLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ResourceMonitor for StaticLedgerMonitor {
    async fn utilization(&self, pool: &ResourcePool) -> Result<ResourcePoolUtilization, MonitorError> {
        let usage = self.ledger.usage(&pool.id).await;
        Ok(ResourcePoolUtilization {
            total_cpu_millicores: pool.quotas.cpu.limits,
            used_cpu_millicores: usage.cpu_used_millicores,
            total_memory_bytes: pool.quotas.memory.limits,
            used_memory_bytes: usage.memory_used_bytes,
            total_disk_bytes: pool.quotas.storage.limits,
            used_disk_bytes: usage.storage_used_bytes,
            running_jobs: usage.running_jobs,
            queued_jobs: 0,
            timestamp: Utc::now(),
        })
    }
}

/// A monitor for externally-orchestrated pool types that this crate
/// does not integrate with (container-runtime adapters are out of
/// scope, spec.md §1 Non-goals). Always reports unavailable so the
/// Scheduler Service skips these pools with a warning rather than
/// crashing.
pub struct UnavailableMonitor {
    pool_type: String,
}

impl UnavailableMonitor {
    pub fn new(pool_type: impl Into<String>) -> Self {
        Self {
            pool_type: pool_type.into(),
        }
    }
}

#[async_trait]
impl ResourceMonitor for UnavailableMonitor {
    async fn utilization(&self, _pool: &ResourcePool) -> Result<ResourcePoolUtilization, MonitorError> {
        Err(MonitorError::Unavailable(format!(
            "no live monitor wired for pool type '{}'",
            self.pool_type
        )))
    }
}

pub struct MonitorRegistry {
    monitors: scc::HashMap<String, std::sync::Arc<dyn ResourceMonitor>>,
}

impl MonitorRegistry {
    pub fn new(ledger: std::sync::Arc<QuotaLedger>) -> Self {
        let registry = Self {
            monitors: scc::HashMap::new(),
        };
        let _ = registry
            .monitors
            .insert("static".to_string(), std::sync::Arc::new(StaticLedgerMonitor::new(ledger)));
        let _ = registry.monitors.insert(
            "kubernetes".to_string(),
            std::sync::Arc::new(UnavailableMonitor::new("kubernetes")),
        );
        let _ = registry.monitors.insert(
            "docker".to_string(),
            std::sync::Arc::new(UnavailableMonitor::new("docker")),
        );
        registry
    }

    pub async fn for_pool_type(&self, pool_type: &str) -> Result<std::sync::Arc<dyn ResourceMonitor>, MonitorError> {
        self.monitors
            .read_async(pool_type, |_, v| v.clone())
            .await
            .ok_or_else(|| MonitorError::UnknownPoolType(pool_type.to_string()))
    }

    pub async fn utilization_for(&self, pool: &ResourcePool) -> Result<ResourcePoolUtilization, MonitorError> {
        self.for_pool_type(&pool.pool_type).await?.utilization(pool).await
    }
}
