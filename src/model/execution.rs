use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ExecutionId, JobId, PoolId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Created,
    Assigned,
    Started,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }

    /// Job-status projection per spec.md §4.7.
    pub fn project_job_status(&self) -> super::job::JobStatus {
        use super::job::JobStatus;
        match self {
            ExecutionStatus::Created => JobStatus::Queued,
            ExecutionStatus::Assigned => JobStatus::Pending,
            ExecutionStatus::Started => JobStatus::Running,
            ExecutionStatus::Completed => JobStatus::Completed,
            ExecutionStatus::Failed => JobStatus::Failed,
            ExecutionStatus::Cancelled => JobStatus::Cancelled,
            ExecutionStatus::Timeout => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsageSnapshot {
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub pool_id: PoolId,
    pub worker_id: Option<WorkerId>,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resource_usage: ResourceUsageSnapshot,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub resource_requirements: HashMap<String, String>,
}

impl Execution {
    pub fn new(
        id: ExecutionId,
        job_id: JobId,
        pool_id: PoolId,
        resource_requirements: HashMap<String, String>,
    ) -> Self {
        Self {
            id,
            job_id,
            pool_id,
            worker_id: None,
            status: ExecutionStatus::Created,
            started_at: None,
            completed_at: None,
            resource_usage: ResourceUsageSnapshot::default(),
            exit_code: None,
            error_message: None,
            resource_requirements,
        }
    }

    /// Sets `started_at`/`completed_at` the first time (and only the
    /// first time) the execution reaches RUNNING or a terminal state
    /// (spec.md §3 Execution invariant).
    pub fn record_transition(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        self.status = status;
        if status == ExecutionStatus::Started {
            self.started_at.get_or_insert(now);
        }
        if status.is_terminal() {
            self.completed_at.get_or_insert(now);
        }
    }
}
