//! C8 - Execution Engine: the dispatch loop tying C2/C3/C4/C6/C7/C9
//! together (spec.md §4.8).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scc::HashMap as ConcurrentHashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::TimeoutsConfig;
use crate::fanout::Fanout;
use crate::ledger::QuotaLedger;
use crate::model::{
    Execution, ExecutionId, ExecutionStatus, ExecutionUpdate, FailureCategory, Job, JobDefinition,
    JobId, PoolId, StatusChangeUpdate, WorkerId,
};
use crate::pool_registry::PoolRegistry;
use crate::protocol::connection::ConnectionRegistry;
use crate::protocol::proto;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::worker_registry::WorkerRegistry;

use super::state_machine::ExecutionStateMachine;
use super::{ExecutionContext, ExecutionDirectory};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("execution not found: {0}")]
    NotFound(ExecutionId),
    #[error("execution {0} is already in a terminal state")]
    AlreadyTerminal(ExecutionId),
}

struct ActiveExecution {
    job_id: JobId,
    machine: Arc<ExecutionStateMachine>,
    worker_id: Mutex<Option<WorkerId>>,
    cancel_requested: AtomicBool,
}

pub struct Engine {
    jobs: ConcurrentHashMap<JobId, Job>,
    active: ConcurrentHashMap<ExecutionId, Arc<ActiveExecution>>,
    history: Mutex<VecDeque<ExecutionContext>>,
    history_capacity: usize,
    executions: Arc<ExecutionDirectory>,
    scheduler: Arc<Scheduler>,
    ledger: Arc<QuotaLedger>,
    pool_registry: Arc<PoolRegistry>,
    worker_registry: Arc<WorkerRegistry>,
    connections: Arc<ConnectionRegistry>,
    fanout: Arc<Fanout>,
    timeouts: TimeoutsConfig,
}

impl Engine {
    pub fn new(
        executions: Arc<ExecutionDirectory>,
        scheduler: Arc<Scheduler>,
        ledger: Arc<QuotaLedger>,
        pool_registry: Arc<PoolRegistry>,
        worker_registry: Arc<WorkerRegistry>,
        connections: Arc<ConnectionRegistry>,
        fanout: Arc<Fanout>,
        timeouts: TimeoutsConfig,
        history_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs: ConcurrentHashMap::new(),
            active: ConcurrentHashMap::new(),
            history: Mutex::new(VecDeque::new()),
            history_capacity,
            executions,
            scheduler,
            ledger,
            pool_registry,
            worker_registry,
            connections,
            fanout,
            timeouts,
        })
    }

    /// `submit(job) -> executionId` (spec.md §4.8): persists the job and
    /// a fresh `Execution{status=CREATED}`, then spawns the dispatch
    /// loop for it.
    pub async fn submit(self: &Arc<Self>, mut job: Job) -> ExecutionId {
        let execution_id = ExecutionId::generate();
        job.transition_to_queued(Utc::now()).ok();
        job.latest_execution_id = Some(execution_id.clone());
        let job_id = job.id.clone();
        self.jobs.upsert_async(job_id.clone(), job).await;

        let execution = Execution::new(
            execution_id.clone(),
            job_id.clone(),
            PoolId::new("unassigned").expect("literal is non-empty"),
            self.job_requirements(&job_id).await,
        );
        let machine = Arc::new(ExecutionStateMachine::new(execution));
        self.executions.insert(execution_id.clone(), machine.clone()).await;

        let active = Arc::new(ActiveExecution {
            job_id: job_id.clone(),
            machine,
            worker_id: Mutex::new(None),
            cancel_requested: AtomicBool::new(false),
        });
        self.active.upsert_async(execution_id.clone(), active).await;

        let engine = self.clone();
        let execution_id_for_task = execution_id.clone();
        tokio::spawn(async move {
            engine.dispatch(execution_id_for_task).await;
        });

        execution_id
    }

    async fn job_requirements(&self, job_id: &JobId) -> std::collections::HashMap<String, String> {
        self.jobs
            .read_async(job_id, |_, job| job.resource_requirements.clone())
            .await
            .unwrap_or_default()
    }

    /// `cancel(executionId, reason) -> ok | notFound | alreadyTerminal`
    /// (spec.md §4.8), idempotent (spec.md §5).
    pub async fn cancel(self: &Arc<Self>, execution_id: ExecutionId, reason: String) -> Result<(), EngineError> {
        let Some(active) = self.active.read_async(&execution_id, |_, v| v.clone()).await else {
            return Err(EngineError::NotFound(execution_id));
        };

        let current = active.machine.current().await;
        if current.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(execution_id));
        }

        active.cancel_requested.store(true, Ordering::SeqCst);
        active.machine.mark_cancel_requested();

        if let Some(worker_id) = active.worker_id.lock().await.clone() {
            self.connections
                .send(
                    &worker_id,
                    proto::OrchestratorMessage {
                        payload: Some(proto::orchestrator_message::Payload::CancelSignal(
                            proto::CancelSignal { reason },
                        )),
                    },
                )
                .await;
        }

        let grace = self.timeouts.cancel_grace_period;
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            engine.force_cancel_if_still_pending(&execution_id).await;
        });

        Ok(())
    }

    async fn force_cancel_if_still_pending(&self, execution_id: &ExecutionId) {
        let Some(active) = self.active.read_async(execution_id, |_, v| v.clone()).await else {
            return;
        };
        if active.machine.current().await.status.is_terminal() {
            return;
        }
        let _ = active
            .machine
            .transition_with(ExecutionStatus::Cancelled, None, |execution| {
                execution.error_message = Some("cancel grace period elapsed".to_string());
            })
            .await;

        if let Some(worker_id) = active.worker_id.lock().await.clone() {
            if let Err(err) = self.worker_registry.mark_offline(&worker_id).await {
                warn!(%worker_id, %err, "failed to mark worker offline after forced cancel");
            }
        }
    }

    pub async fn active_executions(&self) -> Vec<ExecutionContext> {
        let mut contexts = Vec::new();
        let mut ids = Vec::new();
        self.active.scan_async(|id, _| ids.push(id.clone())).await;
        for id in ids {
            if let Some(context) = self.context_for(&id).await {
                contexts.push(context);
            }
        }
        contexts
    }

    async fn context_for(&self, execution_id: &ExecutionId) -> Option<ExecutionContext> {
        let active = self.active.read_async(execution_id, |_, v| v.clone()).await?;
        let execution = active.machine.current().await;
        let job = self.jobs.read_async(&active.job_id, |_, j| j.clone()).await?;
        Some(ExecutionContext { execution, job })
    }

    fn build_task_definition(job: &Job) -> proto::TaskDefinition {
        match &job.definition {
            JobDefinition::Inline { spec } => {
                let command = spec
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let workdir = spec
                    .get("workdir")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let env = spec
                    .get("env")
                    .and_then(|v| v.as_object())
                    .map(|map| {
                        map.iter()
                            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                proto::TaskDefinition {
                    task: Some(proto::task_definition::Task::Shell(proto::ShellTask {
                        command,
                        env,
                        workdir,
                    })),
                }
            }
            JobDefinition::Template { template_id, version } => proto::TaskDefinition {
                task: Some(proto::task_definition::Task::Shell(proto::ShellTask {
                    command: format!("run-template:{template_id}@{version}"),
                    env: Default::default(),
                    workdir: String::new(),
                })),
            },
        }
    }

    async fn dispatch(self: Arc<Self>, execution_id: ExecutionId) {
        let Some(active) = self.active.read_async(&execution_id, |_, v| v.clone()).await else {
            return;
        };

        let Some(pool_id) = self.reserve_placement(&execution_id, &active).await else {
            return;
        };

        let Some(job) = self.jobs.read_async(&active.job_id, |_, j| j.clone()).await else {
            return;
        };

        let worker = match self
            .worker_registry
            .find_available(&pool_id, &job.resource_requirements)
            .await
        {
            Some(worker) => worker,
            None => match self
                .worker_registry
                .wait_for_registration(&pool_id, &job.resource_requirements, self.timeouts.worker_wait_timeout)
                .await
            {
                Ok(worker) => worker,
                Err(_) => {
                    self.ledger.release(&pool_id, &reservation_key(&execution_id)).await;
                    self.apply_job_outcome(&active.job_id, FailureCategory::InsufficientResources).await;
                    self.abandon_pre_assignment(&execution_id).await;
                    return;
                }
            },
        };

        if self.worker_registry.assign(&worker.id, execution_id.clone()).await.is_err() {
            self.ledger.release(&pool_id, &reservation_key(&execution_id)).await;
            self.apply_job_outcome(&active.job_id, FailureCategory::InsufficientResources).await;
            self.abandon_pre_assignment(&execution_id).await;
            return;
        }
        *active.worker_id.lock().await = Some(worker.id.clone());

        if active
            .machine
            .transition_with(ExecutionStatus::Assigned, None, |execution| {
                execution.worker_id = Some(worker.id.clone());
                execution.pool_id = pool_id.clone();
            })
            .await
            .is_err()
        {
            // Execution was forced into a terminal state (e.g. a cancel
            // grace period elapsed) while we were waiting for a worker.
            // The worker was never actually handed the assignment;
            // `finalize` below still releases its reservation and slot.
            self.finalize(&execution_id, &active, &pool_id).await;
            return;
        }

        let assignment = proto::OrchestratorMessage {
            payload: Some(proto::orchestrator_message::Payload::ExecutionAssignment(
                proto::ExecutionAssignment {
                    execution_id: execution_id.to_string(),
                    definition: Some(Self::build_task_definition(&job)),
                },
            )),
        };
        self.connections.send(&worker.id, assignment).await;

        if !self.await_started(&active).await {
            let _ = active
                .machine
                .transition_with(ExecutionStatus::Timeout, None, |execution| {
                    execution.error_message = Some("worker did not report STARTED in time".to_string());
                })
                .await;
            self.connections
                .send(
                    &worker.id,
                    proto::OrchestratorMessage {
                        payload: Some(proto::orchestrator_message::Payload::CancelSignal(
                            proto::CancelSignal {
                                reason: "start grace timeout".to_string(),
                            },
                        )),
                    },
                )
                .await;
        }

        self.await_terminal(&active).await;
        self.finalize(&execution_id, &active, &pool_id).await;
    }

    /// Step 1-2 of the dispatch loop: find a pool, reserve against it,
    /// retrying with exponential backoff (capped at 60s) while the
    /// ledger reports `Unavailable`. Returns `None` if the job failed
    /// outright (placement error or cancelled mid-retry).
    async fn reserve_placement(&self, execution_id: &ExecutionId, active: &Arc<ActiveExecution>) -> Option<PoolId> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if active.cancel_requested.load(Ordering::SeqCst) {
                let _ = active.machine.transition(ExecutionStatus::Cancelled, None).await;
                self.jobs
                    .update_async(&active.job_id, |_, job| job.transition_to_cancelled(Utc::now()))
                    .await;
                self.publish_and_archive(execution_id, active).await;
                return None;
            }

            let Some(job) = self.jobs.read_async(&active.job_id, |_, j| j.clone()).await else {
                return None;
            };

            match self.scheduler.find_placement(&job, None).await {
                Ok(pool_id) => {
                    let Ok(pool) = self.pool_registry.get(&pool_id).await else {
                        warn!(%execution_id, %pool_id, "placed pool vanished before reservation, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(60));
                        continue;
                    };
                    if let Err(err) = self
                        .ledger
                        .reserve(
                            &pool_id,
                            &reservation_key(execution_id),
                            &pool.quotas,
                            &job.resource_requirements,
                        )
                        .await
                    {
                        warn!(%execution_id, %err, "ledger reservation failed, retrying");
                    } else {
                        return Some(pool_id);
                    }
                }
                Err(SchedulerError::NoActivePools) | Err(SchedulerError::NoAdmittingPool) => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                    continue;
                }
                Err(err) => {
                    self.fail_job_placement(&active.job_id, &err.to_string()).await;
                    self.abandon_pre_assignment(execution_id).await;
                    return None;
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(60));
        }
    }

    async fn fail_job_placement(&self, job_id: &JobId, reason: &str) {
        self.jobs
            .update_async(job_id, |_, job| {
                let _ = job.transition_to_failed(FailureCategory::PlacementFailed, Utc::now());
            })
            .await;
        warn!(%job_id, reason, "job failed: placement");
    }

    /// Abandons an execution that never left CREATED (placement failure,
    /// `NO_WORKER`, or an assignment race) - CREATED has no FAILED
    /// transition (spec.md §4.7), so the Job failure alone carries the
    /// outcome and the Execution is simply dropped from bookkeeping.
    async fn abandon_pre_assignment(&self, execution_id: &ExecutionId) {
        self.active.remove_async(execution_id).await;
        self.executions.remove(execution_id).await;
        self.fanout.retire(execution_id).await;
        info!(%execution_id, "execution abandoned before assignment");
    }

    /// Waits for the worker to report STARTED, or any terminal status,
    /// within `startGraceTimeout`. Returns `false` on timeout.
    async fn await_started(&self, active: &Arc<ActiveExecution>) -> bool {
        let mut rx = active.machine.subscribe();
        let wait = async {
            loop {
                let status = *rx.borrow();
                if status == ExecutionStatus::Started || status.is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(self.timeouts.start_grace_timeout, wait).await.is_ok()
    }

    async fn await_terminal(&self, active: &Arc<ActiveExecution>) {
        let mut rx = active.machine.subscribe();
        loop {
            if rx.borrow().is_terminal() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn finalize(&self, execution_id: &ExecutionId, active: &Arc<ActiveExecution>, pool_id: &PoolId) {
        self.ledger.release(pool_id, &reservation_key(execution_id)).await;
        if let Some(worker_id) = active.worker_id.lock().await.clone() {
            let _ = self.worker_registry.release(&worker_id).await;
        }

        let execution = active.machine.current().await;
        match execution.status {
            ExecutionStatus::Completed => {
                self.jobs
                    .update_async(&active.job_id, |_, job| job.transition_to_completed(Utc::now()))
                    .await;
            }
            ExecutionStatus::Cancelled => {
                self.jobs
                    .update_async(&active.job_id, |_, job| job.transition_to_cancelled(Utc::now()))
                    .await;
            }
            _ => {
                let category = execution
                    .error_message
                    .as_deref()
                    .map(category_for_reason)
                    .unwrap_or(FailureCategory::Other);
                self.apply_job_outcome(&active.job_id, category).await;
            }
        }

        self.publish_and_archive(execution_id, active).await;
    }

    async fn apply_job_outcome(&self, job_id: &JobId, category: FailureCategory) {
        self.jobs
            .update_async(job_id, |_, job| {
                let _ = job.transition_to_failed(category, Utc::now());
            })
            .await;
    }

    async fn publish_and_archive(&self, execution_id: &ExecutionId, active: &Arc<ActiveExecution>) {
        let execution = active.machine.current().await;
        self.fanout
            .publish(ExecutionUpdate::Status(StatusChangeUpdate {
                execution_id: execution_id.clone(),
                status: execution.status,
                timestamp: Utc::now(),
            }))
            .await;

        if let Some(job) = self.jobs.read_async(&active.job_id, |_, j| j.clone()).await {
            let mut history = self.history.lock().await;
            if history.len() >= self.history_capacity {
                history.pop_front();
            }
            history.push_back(ExecutionContext { execution, job });
        }

        self.active.remove_async(execution_id).await;
        self.executions.remove(execution_id).await;
        self.fanout.retire(execution_id).await;
        info!(%execution_id, "execution finalized");
    }

    pub async fn history(&self) -> Vec<ExecutionContext> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Forces `WORKER_LOST` onto an execution whose worker the
    /// heartbeat reaper just evicted (spec.md §4.3's `reap` outcome).
    /// The transition alone is enough: the owning `dispatch` task is
    /// blocked in `await_terminal` on this same state machine and will
    /// observe it and run `finalize` itself, so this does not duplicate
    /// that cleanup.
    pub async fn fail_for_worker_loss(&self, execution_id: &ExecutionId) {
        let Some(machine) = self.executions.get(execution_id).await else {
            return;
        };
        let _ = machine
            .transition_with(ExecutionStatus::Failed, None, |execution| {
                execution.error_message = Some("WORKER_LOST".to_string());
            })
            .await;
    }
}

fn reservation_key(execution_id: &ExecutionId) -> WorkerId {
    WorkerId::new(execution_id.as_str()).expect("execution ids are non-empty")
}

/// Recovers a `FailureCategory` from the canonical reason strings this
/// engine stamps into `Execution::error_message` (e.g. `NO_WORKER`,
/// `WORKER_DISCONNECTED` from a stream close, `WORKER_LOST` from a
/// heartbeat-reaper eviction). Free-form worker-reported failure details
/// fall back to `Other`.
fn category_for_reason(reason: &str) -> FailureCategory {
    match reason {
        "NO_WORKER" => FailureCategory::InsufficientResources,
        "WORKER_DISCONNECTED" => FailureCategory::WorkerLost,
        "WORKER_LOST" => FailureCategory::WorkerLost,
        "worker did not report STARTED in time" => FailureCategory::Timeout,
        "cancel grace period elapsed" => FailureCategory::Other,
        _ => FailureCategory::Other,
    }
}
