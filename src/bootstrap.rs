//! Composition root, modeled on `cloud-service::bootstrap::Services`:
//! one struct holding every subsystem as a shared handle, built in
//! dependency order by a single `new`. Unlike the teacher there is no
//! database and no per-service trait-object indirection - each field
//! is the concrete type, since this crate has exactly one
//! implementation of each subsystem.

use std::sync::Arc;

use crate::config::{OrchestratorConfig, TimeoutsConfig};
use crate::execution::engine::Engine;
use crate::execution::ExecutionDirectory;
use crate::fanout::Fanout;
use crate::ledger::QuotaLedger;
use crate::pool_registry::PoolRegistry;
use crate::protocol::connection::ConnectionRegistry;
use crate::scheduler::monitor::MonitorRegistry;
use crate::scheduler::strategy::StrategyRegistry;
use crate::scheduler::Scheduler;
use crate::worker_registry::WorkerRegistry;

/// The composition root. `protocol_handler` is deliberately not stored
/// here - the server binary builds it fresh from these fields, the way
/// `cloud-service::grpcapi` builds each `XxxGrpcApi` from `services.xxx`
/// fields at server-start time rather than keeping it pre-built.
#[derive(Clone)]
pub struct Services {
    pub pool_registry: Arc<PoolRegistry>,
    pub ledger: Arc<QuotaLedger>,
    pub worker_registry: Arc<WorkerRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub executions: Arc<ExecutionDirectory>,
    pub connections: Arc<ConnectionRegistry>,
    pub fanout: Arc<Fanout>,
    pub engine: Arc<Engine>,
    pub timeouts: TimeoutsConfig,
}

impl Services {
    /// Wires every subsystem from an `OrchestratorConfig`, in the order
    /// each depends on the last: ledger and pool registry have no
    /// dependencies, the scheduler needs both plus the strategy and
    /// monitor registries, and the engine needs the scheduler plus the
    /// worker registry, connection registry, and fanout it dispatches
    /// through.
    pub fn new(config: &OrchestratorConfig) -> Self {
        let pool_registry = Arc::new(PoolRegistry::new());
        let ledger = Arc::new(QuotaLedger::new());
        let worker_registry = Arc::new(WorkerRegistry::new());
        let executions = Arc::new(ExecutionDirectory::new());
        let connections = Arc::new(ConnectionRegistry::new());
        let fanout = Arc::new(Fanout::new(config.fanout.subscriber_buffer_size));

        let monitors = Arc::new(MonitorRegistry::new(ledger.clone()));
        let strategies = Arc::new(StrategyRegistry::with_builtins());
        let scheduler = Arc::new(Scheduler::new(
            pool_registry.clone(),
            ledger.clone(),
            monitors,
            strategies,
        ));

        let engine = Engine::new(
            executions.clone(),
            scheduler.clone(),
            ledger.clone(),
            pool_registry.clone(),
            worker_registry.clone(),
            connections.clone(),
            fanout.clone(),
            config.timeouts.clone(),
            config.fanout.execution_history_capacity,
        );

        Self {
            pool_registry,
            ledger,
            worker_registry,
            scheduler,
            executions,
            connections,
            fanout,
            engine,
            timeouts: config.timeouts.clone(),
        }
    }

    /// Computes a point-in-time health snapshot from C1/C3/C8 state, for
    /// an (out-of-scope) HTTP façade to mount under `/health` - this
    /// crate exposes only the plain function, per SPEC_FULL.md §11.2.
    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let pools = self.pool_registry.list_active().await;
        let workers = self.worker_registry.list().await;
        HealthSnapshot {
            active_pool_count: pools.len(),
            live_worker_count: workers
                .iter()
                .filter(|w| w.status != crate::model::WorkerStatus::Offline)
                .count(),
            active_execution_count: self.engine.active_executions().await.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub active_pool_count: usize,
    pub live_worker_count: usize,
    pub active_execution_count: usize,
}
