//! C6 - Scheduler Service: ties the pool registry, quota ledger,
//! resource monitors, and placement strategies together into
//! `find_placement` (spec.md §4.6).

pub mod monitor;
pub mod strategy;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::ledger::QuotaLedger;
use crate::model::{Job, PoolId};
use crate::pool_registry::PoolRegistry;
use monitor::MonitorRegistry;
use strategy::{Candidate, StrategyRegistry};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no active resource pools")]
    NoActivePools,
    #[error("no candidate pool admits this job's requirements")]
    NoAdmittingPool,
    #[error("{0}")]
    Strategy(#[from] strategy::StrategyError),
    #[error("unknown placement strategy: {0}")]
    UnknownStrategy(String),
}

pub struct Scheduler {
    pool_registry: Arc<PoolRegistry>,
    ledger: Arc<QuotaLedger>,
    monitors: Arc<MonitorRegistry>,
    strategies: Arc<StrategyRegistry>,
}

impl Scheduler {
    pub fn new(
        pool_registry: Arc<PoolRegistry>,
        ledger: Arc<QuotaLedger>,
        monitors: Arc<MonitorRegistry>,
        strategies: Arc<StrategyRegistry>,
    ) -> Self {
        Self {
            pool_registry,
            ledger,
            monitors,
            strategies,
        }
    }

    /// `findPlacement(job, strategyName?) -> pool | error` (spec.md
    /// §4.6), run as 5 steps: fetch active pools, fetch utilization per
    /// candidate (skipping unmonitorable pools with a warning), filter
    /// by admission, run the strategy, return the winner.
    pub async fn find_placement(
        &self,
        job: &Job,
        strategy_name: Option<&str>,
    ) -> Result<PoolId, SchedulerError> {
        let pools = self.pool_registry.list_active().await;
        if pools.is_empty() {
            return Err(SchedulerError::NoActivePools);
        }

        let mut candidates = Vec::new();
        for pool in &pools {
            match self.monitors.utilization_for(pool).await {
                Ok(utilization) => candidates.push((pool.clone(), utilization)),
                Err(err) => warn!(pool_id = %pool.id, %err, "resource monitor unavailable, skipping pool"),
            }
        }

        let mut admitted = Vec::new();
        for (pool, utilization) in candidates {
            let admission = self
                .ledger
                .check(
                    &pool.quotas,
                    &pool.id,
                    &job.resource_requirements,
                    1,
                )
                .await;
            if matches!(admission, crate::ledger::Admission::Available) {
                admitted.push(Candidate {
                    pool_id: pool.id.clone(),
                    utilization,
                    max_jobs: Some(pool.quotas.max_jobs),
                });
            }
        }

        if admitted.is_empty() {
            return Err(SchedulerError::NoAdmittingPool);
        }

        let strategy = self
            .strategies
            .get(strategy_name)
            .await
            .ok_or_else(|| SchedulerError::UnknownStrategy(strategy_name.unwrap_or("leastloaded").to_string()))?;

        Ok(strategy.select(job, &admitted)?)
    }
}
