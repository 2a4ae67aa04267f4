//! End-to-end coverage of spec.md §8's six literal scenarios, driven
//! directly against the library's public API rather than a live gRPC
//! round-trip - the wire protocol itself is `protocol::connection`'s
//! concern and isn't duplicated here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pipeline_orchestrator::execution::ExecutionContext;
use pipeline_orchestrator::ledger::QuotaLedger;
use pipeline_orchestrator::model::{
    ExecutionId, ExecutionStatus, Job, JobDefinition, JobStatus, PoolId, Priority, Quotas,
    ResourceBound, ResourcePoolUtilization, WorkerCapabilities, WorkerId, WorkerStatus,
};
use pipeline_orchestrator::pool_registry::PoolRegistry;
use pipeline_orchestrator::scheduler::monitor::MonitorRegistry;
use pipeline_orchestrator::scheduler::strategy::{BinPackingFirstFit, Candidate, PlacementStrategy, StrategyRegistry};
use pipeline_orchestrator::scheduler::Scheduler;
use pipeline_orchestrator::{OrchestratorConfig, Services};

const GI: u64 = 1024 * 1024 * 1024;

fn quotas(cpu_limit: u64, memory_limit: u64) -> Quotas {
    Quotas {
        cpu: ResourceBound {
            requests: 0,
            limits: cpu_limit,
        },
        memory: ResourceBound {
            requests: 0,
            limits: memory_limit,
        },
        storage: ResourceBound::default(),
        // Zeroed so admission depends only on the cpu/memory requirement
        // checks a scenario cares about, not on worker/job slot counts.
        max_workers: 0,
        max_jobs: 100,
        max_concurrent_jobs: 0,
        custom_limits: HashMap::new(),
    }
}

fn cpu_only(value: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("cpu".to_string(), value.to_string());
    map
}

fn cpu_and_memory(cpu: &str, memory: &str) -> HashMap<String, String> {
    let mut map = cpu_only(cpu);
    map.insert("memory".to_string(), memory.to_string());
    map
}

fn job_with(id: &str, requirements: HashMap<String, String>, max_retries: u32) -> Job {
    Job::new(
        pipeline_orchestrator::model::JobId::new(id).unwrap(),
        "scenario-job",
        Priority::Normal,
        JobDefinition::Inline {
            spec: serde_json::json!({}),
        },
        requirements,
        max_retries,
    )
}

// ---------------------------------------------------------------------
// S1 - round-robin distributes across three equally-loaded pools.
// ---------------------------------------------------------------------

#[tokio::test]
async fn s1_round_robin_cycles_across_three_equally_loaded_pools() {
    let pool_registry = Arc::new(PoolRegistry::new());
    let ledger = Arc::new(QuotaLedger::new());
    let monitors = Arc::new(MonitorRegistry::new(ledger.clone()));
    let strategies = Arc::new(StrategyRegistry::with_builtins());

    for name in ["p1", "p2", "p3"] {
        pool_registry
            .create(PoolId::new(name).unwrap(), name.to_string(), "static".to_string(), quotas(10_000, 8 * GI))
            .await
            .unwrap();
    }

    let scheduler = Scheduler::new(pool_registry, ledger, monitors, strategies);
    let job = job_with("job-s1", HashMap::new(), 0);

    let mut order = Vec::new();
    for _ in 0..6 {
        let pool = scheduler.find_placement(&job, Some("roundrobin")).await.unwrap();
        order.push(pool.to_string());
    }
    assert_eq!(order, vec!["p1", "p2", "p3", "p1", "p2", "p3"]);
}

// ---------------------------------------------------------------------
// S2 - GreedyBestFit picks the medium pool among small/medium/large.
// ---------------------------------------------------------------------

#[tokio::test]
async fn s2_greedy_best_fit_picks_the_medium_pool() {
    let pool_registry = Arc::new(PoolRegistry::new());
    let ledger = Arc::new(QuotaLedger::new());
    let monitors = Arc::new(MonitorRegistry::new(ledger.clone()));
    let strategies = Arc::new(StrategyRegistry::with_builtins());

    pool_registry
        .create(PoolId::new("small").unwrap(), "small".to_string(), "static".to_string(), quotas(5_000, 8 * GI))
        .await
        .unwrap();
    pool_registry
        .create(PoolId::new("medium").unwrap(), "medium".to_string(), "static".to_string(), quotas(10_000, 8 * GI))
        .await
        .unwrap();
    pool_registry
        .create(PoolId::new("large").unwrap(), "large".to_string(), "static".to_string(), quotas(20_000, 8 * GI))
        .await
        .unwrap();

    // small: 4500/5000 = 0.90, medium: 2000/10000 = 0.20, large: 10000/20000 = 0.50.
    ledger
        .reserve(
            &PoolId::new("small").unwrap(),
            &WorkerId::new("r-small").unwrap(),
            &quotas(5_000, 8 * GI),
            &cpu_only("4500m"),
        )
        .await
        .unwrap();
    ledger
        .reserve(
            &PoolId::new("medium").unwrap(),
            &WorkerId::new("r-medium").unwrap(),
            &quotas(10_000, 8 * GI),
            &cpu_only("2000m"),
        )
        .await
        .unwrap();
    ledger
        .reserve(
            &PoolId::new("large").unwrap(),
            &WorkerId::new("r-large").unwrap(),
            &quotas(20_000, 8 * GI),
            &cpu_only("10000m"),
        )
        .await
        .unwrap();

    let scheduler = Scheduler::new(pool_registry, ledger, monitors, strategies);
    let job = job_with("job-s2", HashMap::new(), 0);

    let pool = scheduler.find_placement(&job, Some("greedybestfit")).await.unwrap();
    assert_eq!(pool.as_str(), "medium");
}

// ---------------------------------------------------------------------
// S3 - BinPackingFirstFit avoids both extremes.
// ---------------------------------------------------------------------

#[tokio::test]
async fn s3_binpacking_prefers_mid_utilization_over_near_empty_and_near_full() {
    let pool_registry = Arc::new(PoolRegistry::new());
    let ledger = Arc::new(QuotaLedger::new());
    let monitors = Arc::new(MonitorRegistry::new(ledger.clone()));
    let strategies = Arc::new(StrategyRegistry::with_builtins());

    for name in ["a", "b", "c"] {
        pool_registry
            .create(PoolId::new(name).unwrap(), name.to_string(), "static".to_string(), quotas(1_000, 1_000))
            .await
            .unwrap();
    }

    // a: 0.05 avg utilization, b: 0.50, c: 0.93 - cpu and memory reserved
    // identically so both ratios equal the target and average to it.
    ledger
        .reserve(
            &PoolId::new("a").unwrap(),
            &WorkerId::new("r-a").unwrap(),
            &quotas(1_000, 1_000),
            &cpu_and_memory("50m", "50"),
        )
        .await
        .unwrap();
    ledger
        .reserve(
            &PoolId::new("b").unwrap(),
            &WorkerId::new("r-b").unwrap(),
            &quotas(1_000, 1_000),
            &cpu_and_memory("500m", "500"),
        )
        .await
        .unwrap();
    ledger
        .reserve(
            &PoolId::new("c").unwrap(),
            &WorkerId::new("r-c").unwrap(),
            &quotas(1_000, 1_000),
            &cpu_and_memory("930m", "930"),
        )
        .await
        .unwrap();

    let scheduler = Scheduler::new(pool_registry, ledger, monitors, strategies);
    let job = job_with("job-s3", HashMap::new(), 0);

    let pool = scheduler.find_placement(&job, Some("binpackingfirstfit")).await.unwrap();
    assert_eq!(pool.as_str(), "b", "0.05 and 0.93 must both lose out to the mid-utilization pool");
}

#[test]
fn s3_binpacking_discards_a_pool_past_the_0_85_threshold() {
    let near_full = Candidate {
        pool_id: PoolId::new("c").unwrap(),
        utilization: ResourcePoolUtilization {
            total_cpu_millicores: 1_000,
            used_cpu_millicores: 930,
            total_memory_bytes: 1_000,
            used_memory_bytes: 930,
            total_disk_bytes: 0,
            used_disk_bytes: 0,
            running_jobs: 0,
            queued_jobs: 0,
            timestamp: chrono::Utc::now(),
        },
        max_jobs: None,
    };
    let job = job_with("job-s3b", HashMap::new(), 0);
    let result = BinPackingFirstFit.select(&job, &[near_full]);
    assert!(result.is_err(), "a 0.93-utilized pool must be discarded outright, not merely scored low");
}

// ---------------------------------------------------------------------
// Shared harness for S4-S6, which exercise the Execution Engine end to
// end rather than the Scheduler Service in isolation.
// ---------------------------------------------------------------------

fn harness_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.timeouts.worker_wait_timeout = Duration::from_millis(800);
    config.timeouts.start_grace_timeout = Duration::from_millis(800);
    config.timeouts.heartbeat_timeout = Duration::from_secs(30);
    config.timeouts.worker_eviction_grace = Duration::from_secs(300);
    config.timeouts.cancel_grace_period = Duration::from_millis(200);
    config
}

async fn create_active_pool(services: &Services, id: &str) {
    services
        .pool_registry
        .create(PoolId::new(id).unwrap(), id.to_string(), "static".to_string(), quotas(100_000, 100 * GI))
        .await
        .unwrap();
}

async fn register_worker(services: &Services, id: &str, pool_id: &str) {
    services
        .worker_registry
        .register(
            WorkerId::new(id).unwrap(),
            PoolId::new(pool_id).unwrap(),
            WorkerCapabilities {
                cpu_millicores: 4_000,
                memory_bytes: 8 * GI,
                storage_bytes: 0,
                labels: HashMap::new(),
                tools: Vec::new(),
            },
            "session-token".to_string(),
        )
        .await;
}

/// Polls the in-flight execution directory for `status`, since the
/// dispatch loop advances on its own background task.
async fn wait_for_status(services: &Services, execution_id: &ExecutionId, status: ExecutionStatus) -> bool {
    for _ in 0..100 {
        if let Some(machine) = services.executions.get(execution_id).await {
            if machine.current().await.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    false
}

/// Polls execution history for the archived context once the dispatch
/// loop's `finalize` has run.
async fn wait_for_history(services: &Services, execution_id: &ExecutionId) -> Option<ExecutionContext> {
    for _ in 0..150 {
        if let Some(context) = services
            .engine
            .history()
            .await
            .into_iter()
            .find(|context| context.execution.id == *execution_id)
        {
            return Some(context);
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    None
}

// ---------------------------------------------------------------------
// S4 - a worker registers after submission, within workerWaitTimeout.
// ---------------------------------------------------------------------

#[tokio::test]
async fn s4_late_worker_registration_still_gets_assigned_within_wait_timeout() {
    let services = Services::new(&harness_config());
    create_active_pool(&services, "p1").await;

    let job = job_with("job-s4", HashMap::new(), 0);
    let execution_id = services.engine.submit(job).await;

    let initial = services.executions.get(&execution_id).await.unwrap().current().await;
    assert_eq!(initial.status, ExecutionStatus::Created, "no worker is registered yet");

    tokio::time::sleep(Duration::from_millis(60)).await;
    register_worker(&services, "w1", "p1").await;

    assert!(
        wait_for_status(&services, &execution_id, ExecutionStatus::Assigned).await,
        "execution must reach ASSIGNED once a worker registers inside workerWaitTimeout"
    );

    // Simulates the worker's StatusUpdate{EXECUTION_STARTED}.
    let machine = services.executions.get(&execution_id).await.unwrap();
    machine.transition(ExecutionStatus::Started, None).await.unwrap();
    assert!(wait_for_status(&services, &execution_id, ExecutionStatus::Started).await);
}

// ---------------------------------------------------------------------
// S5 - worker disconnect mid-run fails the execution and retries the
// job only while retry budget remains.
// ---------------------------------------------------------------------

#[tokio::test]
async fn s5_worker_loss_mid_run_retries_while_budget_remains() {
    let services = Services::new(&harness_config());
    create_active_pool(&services, "p1").await;
    register_worker(&services, "w1", "p1").await;

    let job = job_with("job-s5", HashMap::new(), 1);
    let execution_id = services.engine.submit(job).await;

    assert!(wait_for_status(&services, &execution_id, ExecutionStatus::Assigned).await);
    services
        .executions
        .get(&execution_id)
        .await
        .unwrap()
        .transition(ExecutionStatus::Started, None)
        .await
        .unwrap();

    services.engine.fail_for_worker_loss(&execution_id).await;

    let context = wait_for_history(&services, &execution_id)
        .await
        .expect("execution must finalize after the worker is declared lost");
    assert_eq!(context.execution.status, ExecutionStatus::Failed);
    assert_eq!(context.execution.error_message.as_deref(), Some("WORKER_LOST"));
    assert_eq!(context.job.status, JobStatus::Queued, "a transient failure within budget must retry");
    assert_eq!(context.job.retry_count, 1);
}

#[tokio::test]
async fn s5_worker_loss_does_not_retry_once_budget_is_exhausted() {
    let services = Services::new(&harness_config());
    create_active_pool(&services, "p1").await;
    register_worker(&services, "w1", "p1").await;

    let job = job_with("job-s5b", HashMap::new(), 0);
    let execution_id = services.engine.submit(job).await;

    assert!(wait_for_status(&services, &execution_id, ExecutionStatus::Assigned).await);
    services
        .executions
        .get(&execution_id)
        .await
        .unwrap()
        .transition(ExecutionStatus::Started, None)
        .await
        .unwrap();

    services.engine.fail_for_worker_loss(&execution_id).await;

    let context = wait_for_history(&services, &execution_id).await.expect("execution must finalize");
    assert_eq!(context.job.status, JobStatus::Failed);
    assert_eq!(context.job.retry_count, 0);
}

// ---------------------------------------------------------------------
// S6 - cancel grace period: an in-time worker ack wins, a silent
// worker gets force-cancelled once the grace period elapses.
// ---------------------------------------------------------------------

#[tokio::test]
async fn s6_cancel_is_honored_by_a_worker_ack_inside_the_grace_period() {
    let services = Services::new(&harness_config());
    create_active_pool(&services, "p1").await;
    register_worker(&services, "w1", "p1").await;

    let job = job_with("job-s6a", HashMap::new(), 2);
    let execution_id = services.engine.submit(job).await;

    assert!(wait_for_status(&services, &execution_id, ExecutionStatus::Assigned).await);
    let machine = services.executions.get(&execution_id).await.unwrap();
    machine.transition(ExecutionStatus::Started, None).await.unwrap();

    services.engine.cancel(execution_id.clone(), "user requested".to_string()).await.unwrap();

    // Simulates what `WorkerProtocolHandler::dispatch_execution_result`
    // does for an `ExecutionResult{success=false}` once the state
    // machine's `cancel_requested` flag is set: the worker's negative
    // result becomes CANCELLED, not FAILED.
    assert!(machine.is_cancel_requested());
    machine
        .transition_with(ExecutionStatus::Cancelled, None, |execution| {
            execution.exit_code = Some(137);
            execution.error_message = Some("terminated by cancel signal".to_string());
        })
        .await
        .unwrap();

    let context = wait_for_history(&services, &execution_id).await.expect("execution must finalize");
    assert_eq!(context.execution.status, ExecutionStatus::Cancelled);
    assert_eq!(context.execution.exit_code, Some(137));
    assert_eq!(context.job.status, JobStatus::Cancelled);
    assert_eq!(context.job.retry_count, 0, "a cancellation must never consume a retry");
}

#[tokio::test]
async fn s6_cancel_is_forced_once_the_grace_period_elapses() {
    let services = Services::new(&harness_config());
    create_active_pool(&services, "p1").await;
    register_worker(&services, "w1", "p1").await;

    let job = job_with("job-s6b", HashMap::new(), 0);
    let execution_id = services.engine.submit(job).await;

    assert!(wait_for_status(&services, &execution_id, ExecutionStatus::Assigned).await);
    services
        .executions
        .get(&execution_id)
        .await
        .unwrap()
        .transition(ExecutionStatus::Started, None)
        .await
        .unwrap();

    services.engine.cancel(execution_id.clone(), "user requested".to_string()).await.unwrap();
    // No ExecutionResult ever arrives - the grace-period task must force it.

    let context = wait_for_history(&services, &execution_id).await.expect("execution must finalize");
    assert_eq!(context.execution.status, ExecutionStatus::Cancelled);
    assert_eq!(context.job.status, JobStatus::Cancelled);

    let worker = services.worker_registry.get(&WorkerId::new("w1").unwrap()).await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Offline, "an unresponsive worker is marked offline on a forced cancel");
}
