//! C3 - Worker Registry: tracks connected workers and their lifecycle
//! (spec.md §4.3).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scc::HashMap as ConcurrentHashMap;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::model::{ExecutionId, PoolId, Worker, WorkerCapabilities, WorkerId, WorkerStatus};

#[derive(Debug, Error)]
pub enum WorkerRegistryError {
    #[error("worker not found: {0}")]
    NotFound(WorkerId),
    #[error("worker {0} is not idle (status: {1:?})")]
    NotIdle(WorkerId, WorkerStatus),
    #[error("worker {0} is not busy (status: {1:?})")]
    NotBusy(WorkerId, WorkerStatus),
    #[error("timed out waiting for a worker matching the requirements")]
    WaitTimeout,
}

/// Outcome of evicting a worker from the reaper loop, so C8 (the
/// execution engine) can react to a mid-flight `WORKER_LOST` failure.
#[derive(Debug, Clone)]
pub struct EvictedWorker {
    pub worker_id: WorkerId,
    pub active_execution_id: Option<ExecutionId>,
}

pub struct WorkerRegistry {
    workers: ConcurrentHashMap<WorkerId, Worker>,
    /// Notified every time a new worker becomes IDLE or is registered, so
    /// `wait_for_registration` can re-check candidates instead of polling
    /// on a fixed interval.
    arrival: Arc<Notify>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: ConcurrentHashMap::new(),
            arrival: Arc::new(Notify::new()),
        }
    }

    /// Registers a worker, idempotently: re-registering an existing id
    /// refreshes its capabilities/session token rather than erroring.
    pub async fn register(
        &self,
        id: WorkerId,
        pool_id: PoolId,
        capabilities: WorkerCapabilities,
        session_token: String,
    ) -> Worker {
        let now = Utc::now();
        let worker = Worker::new(id.clone(), pool_id, capabilities, session_token, now);
        self.workers.upsert_async(id, worker.clone()).await;
        self.arrival.notify_waiters();
        info!(worker_id = %worker.id, pool_id = %worker.pool_id, "worker registered");
        worker
    }

    pub async fn get(&self, id: &WorkerId) -> Result<Worker, WorkerRegistryError> {
        self.workers
            .read_async(id, |_, v| v.clone())
            .await
            .ok_or_else(|| WorkerRegistryError::NotFound(id.clone()))
    }

    pub async fn list(&self) -> Vec<Worker> {
        let mut workers = Vec::new();
        self.workers.scan_async(|_, v| workers.push(v.clone())).await;
        workers
    }

    /// A worker transitions OFFLINE -> IDLE on heartbeat; any other status
    /// just has its `last_heartbeat` refreshed.
    pub async fn heartbeat(&self, id: &WorkerId) -> Result<(), WorkerRegistryError> {
        let now = Utc::now();
        self.workers
            .update_async(id, |_, worker| {
                worker.last_heartbeat = now;
                if worker.status == WorkerStatus::Offline {
                    worker.status = WorkerStatus::Idle;
                }
            })
            .await
            .ok_or_else(|| WorkerRegistryError::NotFound(id.clone()))?;
        self.arrival.notify_waiters();
        Ok(())
    }

    /// Atomic IDLE -> BUSY transition, failing if the worker is in any
    /// other state.
    pub async fn assign(
        &self,
        id: &WorkerId,
        execution_id: ExecutionId,
    ) -> Result<(), WorkerRegistryError> {
        let mut outcome = None;
        self.workers
            .update_async(id, |_, worker| {
                if worker.status == WorkerStatus::Idle {
                    worker.status = WorkerStatus::Busy;
                    worker.active_execution_id = Some(execution_id.clone());
                    outcome = Some(Ok(()));
                } else {
                    outcome = Some(Err(WorkerRegistryError::NotIdle(id.clone(), worker.status)));
                }
            })
            .await
            .ok_or_else(|| WorkerRegistryError::NotFound(id.clone()))?;
        outcome.expect("update_async closure always sets outcome")
    }

    /// Atomic BUSY -> IDLE transition.
    pub async fn release(&self, id: &WorkerId) -> Result<(), WorkerRegistryError> {
        let mut outcome = None;
        self.workers
            .update_async(id, |_, worker| {
                if worker.status == WorkerStatus::Busy {
                    worker.status = WorkerStatus::Idle;
                    worker.active_execution_id = None;
                    outcome = Some(Ok(()));
                } else {
                    outcome = Some(Err(WorkerRegistryError::NotBusy(id.clone(), worker.status)));
                }
            })
            .await
            .ok_or_else(|| WorkerRegistryError::NotFound(id.clone()))?;
        self.arrival.notify_waiters();
        outcome.expect("update_async closure always sets outcome")
    }

    pub async fn mark_offline(&self, id: &WorkerId) -> Result<(), WorkerRegistryError> {
        self.workers
            .update_async(id, |_, worker| worker.status = WorkerStatus::Offline)
            .await
            .ok_or_else(|| WorkerRegistryError::NotFound(id.clone()))?;
        Ok(())
    }

    /// First IDLE worker in `pool_id` whose capabilities satisfy
    /// `requirements`, tie-broken by earliest `created_at` (spec.md §4.3).
    pub async fn find_available(
        &self,
        pool_id: &PoolId,
        requirements: &std::collections::HashMap<String, String>,
    ) -> Option<Worker> {
        let mut candidates = Vec::new();
        self.workers.scan_async(|_, worker| {
            if &worker.pool_id == pool_id
                && worker.status == WorkerStatus::Idle
                && worker.capabilities.satisfies(requirements)
            {
                candidates.push(worker.clone());
            }
        }).await;
        candidates.sort_by_key(|w| w.created_at);
        candidates.into_iter().next()
    }

    /// Suspends until a worker matching `requirements` becomes available
    /// in `pool_id`, or `wait_timeout` elapses (spec.md §4.3).
    pub async fn wait_for_registration(
        &self,
        pool_id: &PoolId,
        requirements: &std::collections::HashMap<String, String>,
        wait_timeout: Duration,
    ) -> Result<Worker, WorkerRegistryError> {
        timeout(wait_timeout, async {
            loop {
                if let Some(worker) = self.find_available(pool_id, requirements).await {
                    return worker;
                }
                self.arrival.notified().await;
            }
        })
        .await
        .map_err(|_| WorkerRegistryError::WaitTimeout)
    }

    pub async fn count_live_in_pool(&self, pool_id: &PoolId) -> usize {
        let mut count = 0;
        self.workers.scan_async(|_, worker| {
            if &worker.pool_id == pool_id && worker.status != WorkerStatus::Offline {
                count += 1;
            }
        }).await;
        count
    }

    /// Evicts every worker whose `last_heartbeat` predates
    /// `now - heartbeat_timeout - eviction_grace`, after first marking
    /// workers past only `heartbeat_timeout` as OFFLINE. Returns the
    /// workers actually removed, so the caller (the heartbeat reaper
    /// task) can fail their active executions with `WORKER_LOST`.
    pub async fn reap(
        &self,
        heartbeat_timeout: Duration,
        eviction_grace: Duration,
    ) -> Vec<EvictedWorker> {
        let now = Utc::now();
        let offline_cutoff = now - chrono::Duration::from_std(heartbeat_timeout).unwrap_or_default();
        let evict_cutoff = offline_cutoff
            - chrono::Duration::from_std(eviction_grace).unwrap_or_default();

        let mut to_mark_offline = Vec::new();
        let mut to_evict = Vec::new();
        self.workers.scan_async(|id, worker| {
            if worker.status != WorkerStatus::Offline && worker.last_heartbeat < offline_cutoff {
                to_mark_offline.push(id.clone());
            } else if worker.status == WorkerStatus::Offline && worker.last_heartbeat < evict_cutoff {
                to_evict.push(id.clone());
            }
        }).await;

        for id in &to_mark_offline {
            if let Err(err) = self.mark_offline(id).await {
                warn!(worker_id = %id, %err, "failed to mark worker offline during reap");
            }
        }

        let mut evicted = Vec::new();
        for id in &to_evict {
            if let Some((_, worker)) = self.workers.remove_async(id).await {
                warn!(worker_id = %id, "evicted unresponsive worker");
                evicted.push(EvictedWorker {
                    worker_id: worker.id,
                    active_execution_id: worker.active_execution_id,
                });
            }
        }
        evicted
    }
}
