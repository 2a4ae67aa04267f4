//! C2 - Quota/Usage Ledger: per-pool live usage tracking and admission
//! (spec.md §4.2).

use std::collections::HashMap;

use scc::HashMap as ConcurrentHashMap;

use crate::model::{quantity, PoolId, Quotas, WorkerId};

#[derive(Debug, Clone, Default)]
pub struct ResourceUsage {
    pub cpu_used_millicores: u64,
    pub memory_used_bytes: u64,
    pub storage_used_bytes: u64,
    pub pods_used: u32,
    pub workers_used: u32,
    pub running_jobs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Available,
    PartiallyAvailable { constraints: Vec<String> },
    Unavailable { limiting_factors: Vec<String> },
}

#[derive(Debug, Clone, Default)]
struct Reservation {
    cpu_millicores: u64,
    memory_bytes: u64,
}

pub struct QuotaLedger {
    usage: ConcurrentHashMap<PoolId, ResourceUsage>,
    reservations: ConcurrentHashMap<(PoolId, WorkerId), Reservation>,
}

impl Default for QuotaLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self {
            usage: ConcurrentHashMap::new(),
            reservations: ConcurrentHashMap::new(),
        }
    }

    pub async fn usage(&self, pool_id: &PoolId) -> ResourceUsage {
        self.usage
            .read_async(pool_id, |_, v| v.clone())
            .await
            .unwrap_or_default()
    }

    /// Admission rule (spec.md §4.2): for every resource key in the
    /// request, `usage + request <= limit`; `workersUsed + count <=
    /// maxWorkers`; `runningJobs + 1 <= maxConcurrentJobs`.
    pub async fn check(
        &self,
        quotas: &Quotas,
        pool_id: &PoolId,
        requirements: &HashMap<String, String>,
        count: u32,
    ) -> Admission {
        let usage = self.usage(pool_id).await;
        let mut limiting = Vec::new();

        if let Some(cpu_str) = requirements.get("cpu") {
            if let Ok(requested) = quantity::parse_cpu_millicores(cpu_str) {
                let needed = requested.saturating_mul(count as u64);
                if usage.cpu_used_millicores + needed > quotas.cpu.limits {
                    limiting.push("cpu".to_string());
                }
            } else {
                limiting.push("cpu (unparseable)".to_string());
            }
        }

        if let Some(mem_str) = requirements.get("memory") {
            if let Ok(requested) = quantity::parse_memory_bytes(mem_str) {
                let needed = requested.saturating_mul(count as u64);
                if usage.memory_used_bytes + needed > quotas.memory.limits {
                    limiting.push("memory".to_string());
                }
            } else {
                limiting.push("memory (unparseable)".to_string());
            }
        }

        if quotas.max_workers > 0 && usage.workers_used + count > quotas.max_workers {
            limiting.push("max_workers".to_string());
        }

        if quotas.max_concurrent_jobs > 0 && usage.running_jobs + 1 > quotas.max_concurrent_jobs {
            limiting.push("max_concurrent_jobs".to_string());
        }

        if limiting.is_empty() {
            Admission::Available
        } else if limiting.len()
            < requirements.len() + 2 /* max_workers, max_concurrent_jobs slots */
        {
            Admission::PartiallyAvailable {
                constraints: limiting,
            }
        } else {
            Admission::Unavailable {
                limiting_factors: limiting,
            }
        }
    }

    /// Atomically records a reservation for `worker_id` in `pool_id` and
    /// bumps the pool's usage counters, re-validating against `quotas`
    /// in the same locked step that applies the increment. `check` alone
    /// only tells a caller the pool looked admissible at the time it was
    /// read; two dispatch tasks can both pass `check` against the same
    /// pool and then both call `reserve`, so the increment-and-compare
    /// has to happen under one lock on the pool's usage entry rather
    /// than being re-derived from a separate `check` call that could
    /// itself be stale by the time it runs.
    pub async fn reserve(
        &self,
        pool_id: &PoolId,
        worker_id: &WorkerId,
        quotas: &Quotas,
        requirements: &HashMap<String, String>,
    ) -> anyhow::Result<()> {
        let cpu_millicores = requirements
            .get("cpu")
            .map(|s| quantity::parse_cpu_millicores(s))
            .transpose()?
            .unwrap_or(0);
        let memory_bytes = requirements
            .get("memory")
            .map(|s| quantity::parse_memory_bytes(s))
            .transpose()?
            .unwrap_or(0);

        self.usage
            .entry_async(pool_id.clone())
            .await
            .or_insert_with(ResourceUsage::default);

        let admitted = self
            .usage
            .update_async(pool_id, |_, usage| {
                let would_cpu = usage.cpu_used_millicores + cpu_millicores;
                let would_memory = usage.memory_used_bytes + memory_bytes;
                let would_workers = usage.workers_used + 1;
                let would_jobs = usage.running_jobs + 1;

                let over_quota = would_cpu > quotas.cpu.limits
                    || would_memory > quotas.memory.limits
                    || (quotas.max_workers > 0 && would_workers > quotas.max_workers)
                    || (quotas.max_concurrent_jobs > 0 && would_jobs > quotas.max_concurrent_jobs);

                if over_quota {
                    false
                } else {
                    usage.cpu_used_millicores = would_cpu;
                    usage.memory_used_bytes = would_memory;
                    usage.workers_used = would_workers;
                    usage.running_jobs = would_jobs;
                    true
                }
            })
            .await
            .unwrap_or(false);

        if !admitted {
            anyhow::bail!("pool {} is at quota, reservation rejected", pool_id);
        }

        self.reservations
            .upsert_async(
                (pool_id.clone(), worker_id.clone()),
                Reservation {
                    cpu_millicores,
                    memory_bytes,
                },
            )
            .await;

        Ok(())
    }

    /// Releases the reservation held for `worker_id` in `pool_id`,
    /// idempotent if no reservation is present.
    pub async fn release(&self, pool_id: &PoolId, worker_id: &WorkerId) {
        let Some(reservation) = self
            .reservations
            .remove_async(&(pool_id.clone(), worker_id.clone()))
            .await
            .map(|(_, v)| v)
        else {
            return;
        };

        self.usage
            .update_async(pool_id, |_, usage| {
                usage.cpu_used_millicores = usage
                    .cpu_used_millicores
                    .saturating_sub(reservation.cpu_millicores);
                usage.memory_used_bytes = usage
                    .memory_used_bytes
                    .saturating_sub(reservation.memory_bytes);
                usage.workers_used = usage.workers_used.saturating_sub(1);
                usage.running_jobs = usage.running_jobs.saturating_sub(1);
            })
            .await;
    }

    /// Returns human-readable violations for a pool, e.g. for the
    /// `GET /pools/{name}/violations` façade endpoint (out of scope here,
    /// but the query itself belongs to the ledger).
    pub async fn violations(&self, pool_id: &PoolId, quotas: &Quotas) -> Vec<String> {
        let usage = self.usage(pool_id).await;
        let mut violations = Vec::new();
        if usage.cpu_used_millicores > quotas.cpu.limits {
            violations.push(format!(
                "cpu usage {} exceeds limit {}",
                usage.cpu_used_millicores, quotas.cpu.limits
            ));
        }
        if usage.memory_used_bytes > quotas.memory.limits {
            violations.push(format!(
                "memory usage {} exceeds limit {}",
                usage.memory_used_bytes, quotas.memory.limits
            ));
        }
        if quotas.max_workers > 0 && usage.workers_used > quotas.max_workers {
            violations.push(format!(
                "workers used {} exceeds max_workers {}",
                usage.workers_used, quotas.max_workers
            ));
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quotas() -> Quotas {
        Quotas {
            cpu: crate::model::ResourceBound {
                requests: 0,
                limits: 10_000,
            },
            memory: crate::model::ResourceBound {
                requests: 0,
                limits: 8 * 1024 * 1024 * 1024,
            },
            max_workers: 5,
            max_jobs: 100,
            max_concurrent_jobs: 5,
            custom_limits: Default::default(),
        }
    }

    fn requirements(cpu: &str, memory: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("cpu".to_string(), cpu.to_string());
        map.insert("memory".to_string(), memory.to_string());
        map
    }

    #[tokio::test]
    async fn admits_when_within_quota() {
        let ledger = QuotaLedger::new();
        let pool_id = PoolId::new("p1").unwrap();
        let admission = ledger
            .check(&quotas(), &pool_id, &requirements("2", "1Gi"), 1)
            .await;
        assert_eq!(admission, Admission::Available);
    }

    #[tokio::test]
    async fn reserve_then_release_is_a_no_op_on_usage() {
        let ledger = QuotaLedger::new();
        let pool_id = PoolId::new("p1").unwrap();
        let worker_id = WorkerId::new("w1").unwrap();
        let reqs = requirements("2", "1Gi");

        ledger.reserve(&pool_id, &worker_id, &quotas(), &reqs).await.unwrap();
        let usage = ledger.usage(&pool_id).await;
        assert_eq!(usage.cpu_used_millicores, 2000);
        assert_eq!(usage.workers_used, 1);

        ledger.release(&pool_id, &worker_id).await;
        let usage = ledger.usage(&pool_id).await;
        assert_eq!(usage.cpu_used_millicores, 0);
        assert_eq!(usage.workers_used, 0);
    }

    #[tokio::test]
    async fn release_without_reservation_is_idempotent() {
        let ledger = QuotaLedger::new();
        let pool_id = PoolId::new("p1").unwrap();
        let worker_id = WorkerId::new("w1").unwrap();
        ledger.release(&pool_id, &worker_id).await;
        ledger.release(&pool_id, &worker_id).await;
    }

    #[tokio::test]
    async fn rejects_when_over_quota() {
        let ledger = QuotaLedger::new();
        let pool_id = PoolId::new("p1").unwrap();
        let worker_id = WorkerId::new("w1").unwrap();
        ledger
            .reserve(&pool_id, &worker_id, &quotas(), &requirements("9", "1Gi"))
            .await
            .unwrap();

        let admission = ledger
            .check(&quotas(), &pool_id, &requirements("2", "1Gi"), 1)
            .await;
        assert_ne!(admission, Admission::Available);
    }

    #[tokio::test]
    async fn reserve_rejects_a_concurrent_overcommit_even_after_check_passed() {
        let ledger = QuotaLedger::new();
        let pool_id = PoolId::new("p1").unwrap();
        let w1 = WorkerId::new("w1").unwrap();
        let w2 = WorkerId::new("w2").unwrap();
        // Quota admits at most one of these two 9-core reservations at once.
        let reqs = requirements("9", "1Gi");

        ledger.reserve(&pool_id, &w1, &quotas(), &reqs).await.unwrap();
        let second = ledger.reserve(&pool_id, &w2, &quotas(), &reqs).await;
        assert!(second.is_err(), "second reservation must be rejected once the pool is at quota");

        let usage = ledger.usage(&pool_id).await;
        assert_eq!(usage.cpu_used_millicores, 9000, "a rejected reservation must not leave a partial increment");
    }
}
