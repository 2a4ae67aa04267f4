use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{ExecutionId, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum Priority {
    Low = 1,
    Normal = 5,
    High = 10,
    Critical = 20,
}

impl Priority {
    pub const MEDIUM: Priority = Priority::Normal;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// The category of error that produced a `Failed` transition, recorded so
/// the engine can decide retry eligibility without re-parsing the error
/// message (see SPEC_FULL.md §12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCategory {
    InsufficientResources,
    WorkerLost,
    Timeout,
    Validation,
    ProtocolViolation,
    PlacementFailed,
    Other,
}

impl FailureCategory {
    /// Only these categories are eligible for a retry (spec.md §7).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureCategory::InsufficientResources
                | FailureCategory::WorkerLost
                | FailureCategory::Timeout
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobDefinition {
    Template { template_id: String, version: String },
    Inline { spec: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub priority: Priority,
    pub definition: JobDefinition,
    pub resource_requirements: HashMap<String, String>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_failure_category: Option<FailureCategory>,
    pub latest_execution_id: Option<ExecutionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobTransitionError {
    #[error("invalid job transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("retries exhausted: {retry_count}/{max_retries}")]
    RetriesExhausted { retry_count: u32, max_retries: u32 },
}

impl Job {
    pub fn new(
        id: JobId,
        name: impl Into<String>,
        priority: Priority,
        definition: JobDefinition,
        resource_requirements: HashMap<String, String>,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            priority,
            definition,
            resource_requirements,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries,
            last_failure_category: None,
            latest_execution_id: None,
            created_at: now,
            updated_at: now,
        completed_at: None,
        }
    }

    fn set_status(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at.get_or_insert(now);
        }
    }

    pub fn transition_to_queued(&mut self, now: DateTime<Utc>) -> Result<(), JobTransitionError> {
        match self.status {
            JobStatus::Pending | JobStatus::Queued => {
                self.set_status(JobStatus::Queued, now);
                Ok(())
            }
            JobStatus::Failed => self.retry(now),
            from => Err(JobTransitionError::InvalidTransition {
                from,
                to: JobStatus::Queued,
            }),
        }
    }

    pub fn transition_to_running(&mut self, now: DateTime<Utc>) -> Result<(), JobTransitionError> {
        match self.status {
            JobStatus::Queued | JobStatus::Running => {
                self.set_status(JobStatus::Running, now);
                Ok(())
            }
            from => Err(JobTransitionError::InvalidTransition {
                from,
                to: JobStatus::Running,
            }),
        }
    }

    pub fn transition_to_completed(&mut self, now: DateTime<Utc>) {
        self.set_status(JobStatus::Completed, now);
    }

    pub fn transition_to_failed(
        &mut self,
        category: FailureCategory,
        now: DateTime<Utc>,
    ) -> Result<(), JobTransitionError> {
        self.last_failure_category = Some(category);
        self.set_status(JobStatus::Failed, now);

        if category.is_transient() && self.retry_count < self.max_retries {
            self.retry(now)
        } else {
            Ok(())
        }
    }

    pub fn transition_to_cancelled(&mut self, now: DateTime<Utc>) {
        self.set_status(JobStatus::Cancelled, now);
    }

    fn retry(&mut self, now: DateTime<Utc>) -> Result<(), JobTransitionError> {
        if self.retry_count >= self.max_retries {
            return Err(JobTransitionError::RetriesExhausted {
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        self.retry_count += 1;
        self.set_status(JobStatus::Queued, now);
        Ok(())
    }
}
