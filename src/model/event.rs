use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ExecutionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    StatusUpdate,
    StageStarted,
    StageCompleted,
    StepStarted,
    StepCompleted,
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventUpdate {
    pub execution_id: ExecutionId,
    pub event_type: EventType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogUpdate {
    pub execution_id: ExecutionId,
    pub stream: LogStream,
    pub content: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangeUpdate {
    pub execution_id: ExecutionId,
    pub status: super::execution::ExecutionStatus,
    pub timestamp: DateTime<Utc>,
}

/// `ExecutionUpdate` fanout message (spec.md §3, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionUpdate {
    Event(EventUpdate),
    Log(LogUpdate),
    Status(StatusChangeUpdate),
}

impl ExecutionUpdate {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            ExecutionUpdate::Event(e) => &e.execution_id,
            ExecutionUpdate::Log(l) => &l.execution_id,
            ExecutionUpdate::Status(s) => &s.execution_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ExecutionUpdate::Event(e) => e.timestamp,
            ExecutionUpdate::Log(l) => l.timestamp,
            ExecutionUpdate::Status(s) => s.timestamp,
        }
    }
}
