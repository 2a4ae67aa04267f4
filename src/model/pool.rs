use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::PoolId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatus {
    Active,
    Draining,
    Terminating,
    Suspended,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceBound {
    pub requests: u64,
    pub limits: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quotas {
    pub cpu: ResourceBound,
    pub memory: ResourceBound,
    pub storage: ResourceBound,
    pub max_workers: u32,
    pub max_jobs: u32,
    pub max_concurrent_jobs: u32,
    pub custom_limits: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePool {
    pub id: PoolId,
    pub name: String,
    pub pool_type: String,
    pub status: PoolStatus,
    pub quotas: Quotas,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ResourcePool {
    /// `name` must be a DNS-label: lowercase alphanumeric and hyphens,
    /// not starting or ending with a hyphen (spec.md §3).
    pub fn validate_name(name: &str) -> bool {
        if name.is_empty() || name.starts_with('-') || name.ends_with('-') {
            return false;
        }
        name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcePoolUtilization {
    pub total_cpu_millicores: u64,
    pub used_cpu_millicores: u64,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub total_disk_bytes: u64,
    pub used_disk_bytes: u64,
    pub running_jobs: u32,
    pub queued_jobs: u32,
    pub timestamp: DateTime<Utc>,
}

impl ResourcePoolUtilization {
    pub fn cpu_ratio(&self) -> f64 {
        if self.total_cpu_millicores == 0 {
            0.0
        } else {
            self.used_cpu_millicores as f64 / self.total_cpu_millicores as f64
        }
    }

    pub fn memory_ratio(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            0.0
        } else {
            self.used_memory_bytes as f64 / self.total_memory_bytes as f64
        }
    }

    pub fn available_cpu_millicores(&self) -> u64 {
        self.total_cpu_millicores.saturating_sub(self.used_cpu_millicores)
    }

    pub fn available_memory_bytes(&self) -> u64 {
        self.total_memory_bytes.saturating_sub(self.used_memory_bytes)
    }
}
