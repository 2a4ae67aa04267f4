pub mod engine;
pub mod state_machine;

use std::sync::Arc;

use scc::HashMap as ConcurrentHashMap;

use crate::model::{ExecutionId, Job};
use state_machine::ExecutionStateMachine;

/// A snapshot handed back by `Engine::active_executions` (spec.md §4.8):
/// `{execution, job, workerId, events, logs}` collapsed to what's
/// available from the state machine plus the owning job.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution: crate::model::Execution,
    pub job: Job,
}

/// Concurrent directory of in-flight executions, shared between C8 (the
/// engine, which creates/removes entries) and C4 (the connection
/// handler, which looks an execution up to apply inbound status/result
/// messages).
#[derive(Default)]
pub struct ExecutionDirectory {
    machines: ConcurrentHashMap<ExecutionId, Arc<ExecutionStateMachine>>,
}

impl ExecutionDirectory {
    pub fn new() -> Self {
        Self {
            machines: ConcurrentHashMap::new(),
        }
    }

    pub async fn insert(&self, id: ExecutionId, machine: Arc<ExecutionStateMachine>) {
        self.machines.upsert_async(id, machine).await;
    }

    pub async fn get(&self, id: &ExecutionId) -> Option<Arc<ExecutionStateMachine>> {
        self.machines.read_async(id, |_, v| v.clone()).await
    }

    pub async fn remove(&self, id: &ExecutionId) {
        self.machines.remove_async(id).await;
    }
}
