use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ExecutionId, PoolId, WorkerId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
    pub labels: HashMap<String, String>,
    pub tools: Vec<String>,
}

impl WorkerCapabilities {
    /// Whether these capabilities satisfy a job's resource requirements.
    /// Only `cpu`/`memory` requirement keys are checked against capacity;
    /// any other requirement key is matched against `tools`.
    pub fn satisfies(&self, requirements: &HashMap<String, String>) -> bool {
        for (key, value) in requirements {
            match key.as_str() {
                "cpu" => {
                    let Ok(needed) = super::quantity::parse_cpu_millicores(value) else {
                        return false;
                    };
                    if needed > self.cpu_millicores {
                        return false;
                    }
                }
                "memory" => {
                    let Ok(needed) = super::quantity::parse_memory_bytes(value) else {
                        return false;
                    };
                    if needed > self.memory_bytes {
                        return false;
                    }
                }
                tool => {
                    if !self.tools.iter().any(|t| t == tool) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Provisioning,
    Idle,
    Busy,
    Offline,
    Terminating,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub pool_id: PoolId,
    pub capabilities: WorkerCapabilities,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub active_execution_id: Option<ExecutionId>,
    pub session_token: String,
    pub created_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        pool_id: PoolId,
        capabilities: WorkerCapabilities,
        session_token: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            pool_id,
            capabilities,
            status: WorkerStatus::Idle,
            last_heartbeat: now,
            active_execution_id: None,
            session_token,
            created_at: now,
        }
    }
}
