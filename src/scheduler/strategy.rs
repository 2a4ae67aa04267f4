//! C5 - Placement strategies (spec.md §4.5).

use std::collections::HashMap as StdHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use scc::HashMap as ConcurrentHashMap;
use thiserror::Error;

use crate::model::{Job, PoolId, ResourcePoolUtilization};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("no candidates")]
    NoCandidates,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub pool_id: PoolId,
    pub utilization: ResourcePoolUtilization,
    pub max_jobs: Option<u32>,
}

/// `select(job, candidates) -> pool | error("no candidates")` (spec.md
/// §4.5). Strategies are pure and non-suspending.
pub trait PlacementStrategy: Send + Sync {
    fn select(&self, job: &Job, candidates: &[Candidate]) -> Result<PoolId, StrategyError>;
}

fn sorted_by_id(candidates: &[Candidate]) -> Vec<&Candidate> {
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| a.pool_id.as_str().cmp(b.pool_id.as_str()));
    sorted
}

/// Lexicographically sorts by `pool.id`, then walks a process-wide,
/// strategy-instance-scoped counter mod N.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl PlacementStrategy for RoundRobin {
    fn select(&self, _job: &Job, candidates: &[Candidate]) -> Result<PoolId, StrategyError> {
        if candidates.is_empty() {
            return Err(StrategyError::NoCandidates);
        }
        let sorted = sorted_by_id(candidates);
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % sorted.len();
        Ok(sorted[index].pool_id.clone())
    }
}

pub struct GreedyBestFit;

impl GreedyBestFit {
    fn score(candidate: &Candidate) -> f64 {
        (candidate.utilization.cpu_ratio() + candidate.utilization.memory_ratio()) / 2.0
    }
}

impl PlacementStrategy for GreedyBestFit {
    fn select(&self, _job: &Job, candidates: &[Candidate]) -> Result<PoolId, StrategyError> {
        if candidates.is_empty() {
            return Err(StrategyError::NoCandidates);
        }
        let mut sorted = sorted_by_id(candidates);
        sorted.sort_by(|a, b| {
            Self::score(a)
                .partial_cmp(&Self::score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pool_id.as_str().cmp(b.pool_id.as_str()))
        });
        Ok(sorted[0].pool_id.clone())
    }
}

pub struct LeastLoaded;

impl LeastLoaded {
    fn job_util(candidate: &Candidate) -> f64 {
        let running = candidate.utilization.running_jobs as f64;
        match candidate.max_jobs {
            Some(max) if max > 0 => running / max as f64,
            _ => running / (running + 10.0),
        }
    }

    fn queue_util(candidate: &Candidate) -> f64 {
        (candidate.utilization.queued_jobs as f64 / 10.0).min(1.0)
    }

    fn fits(candidate: &Candidate, requirements: &StdHashMap<String, String>) -> bool {
        if let Some(cpu) = requirements.get("cpu") {
            if let Ok(requested) = crate::model::quantity::parse_cpu_millicores(cpu) {
                if requested > candidate.utilization.available_cpu_millicores() {
                    return false;
                }
            }
        }
        if let Some(memory) = requirements.get("memory") {
            if let Ok(requested) = crate::model::quantity::parse_memory_bytes(memory) {
                if requested > candidate.utilization.available_memory_bytes() {
                    return false;
                }
            }
        }
        true
    }

    fn score(candidate: &Candidate) -> f64 {
        0.3 * candidate.utilization.cpu_ratio()
            + 0.3 * candidate.utilization.memory_ratio()
            + 0.2 * Self::job_util(candidate)
            + 0.2 * Self::queue_util(candidate)
    }
}

impl PlacementStrategy for LeastLoaded {
    fn select(&self, job: &Job, candidates: &[Candidate]) -> Result<PoolId, StrategyError> {
        let mut fitting: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| Self::fits(c, &job.resource_requirements))
            .collect();
        if fitting.is_empty() {
            return Err(StrategyError::NoCandidates);
        }
        fitting.sort_by(|a, b| {
            Self::score(a)
                .partial_cmp(&Self::score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pool_id.as_str().cmp(b.pool_id.as_str()))
        });
        Ok(fitting[0].pool_id.clone())
    }
}

pub struct BinPackingFirstFit;

impl BinPackingFirstFit {
    fn utilization(candidate: &Candidate) -> f64 {
        (candidate.utilization.cpu_ratio() + candidate.utilization.memory_ratio()) / 2.0
    }

    /// Returns `None` when the candidate is too full to consider.
    fn score(candidate: &Candidate) -> Option<f64> {
        let u = Self::utilization(candidate);
        if u < 0.1 {
            Some(0.0)
        } else if u < 0.4 {
            Some(2.0 * u)
        } else if u < 0.7 {
            Some(1.0)
        } else if u < 0.85 {
            Some(1.0 - 2.0 * (u - 0.7))
        } else {
            None
        }
    }
}

impl PlacementStrategy for BinPackingFirstFit {
    fn select(&self, _job: &Job, candidates: &[Candidate]) -> Result<PoolId, StrategyError> {
        let mut scored: Vec<(&Candidate, f64)> = candidates
            .iter()
            .filter_map(|c| Self::score(c).map(|s| (c, s)))
            .collect();
        if scored.is_empty() {
            return Err(StrategyError::NoCandidates);
        }
        scored.sort_by(|(a, score_a), (b, score_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pool_id.as_str().cmp(b.pool_id.as_str()))
        });
        Ok(scored[0].0.pool_id.clone())
    }
}

/// Registry of named strategies, matched case-insensitively, allowing
/// registration of custom strategies beyond the four required ones
/// (SPEC_FULL.md §11.3).
pub struct StrategyRegistry {
    strategies: ConcurrentHashMap<String, std::sync::Arc<dyn PlacementStrategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StrategyRegistry {
    pub fn with_builtins() -> Self {
        let registry = Self {
            strategies: ConcurrentHashMap::new(),
        };
        registry.register_sync("roundrobin", std::sync::Arc::new(RoundRobin::new()));
        registry.register_sync("greedybestfit", std::sync::Arc::new(GreedyBestFit));
        registry.register_sync("leastloaded", std::sync::Arc::new(LeastLoaded));
        registry.register_sync(
            "binpackingfirstfit",
            std::sync::Arc::new(BinPackingFirstFit),
        );
        registry
    }

    fn register_sync(&self, name: &str, strategy: std::sync::Arc<dyn PlacementStrategy>) {
        let _ = self
            .strategies
            .insert(name.to_ascii_lowercase(), strategy);
    }

    pub async fn register(&self, name: &str, strategy: std::sync::Arc<dyn PlacementStrategy>) {
        self.strategies
            .upsert_async(name.to_ascii_lowercase(), strategy)
            .await;
    }

    pub async fn get(&self, name: Option<&str>) -> Option<std::sync::Arc<dyn PlacementStrategy>> {
        let key = name.unwrap_or("leastloaded").to_ascii_lowercase();
        self.strategies.read_async(&key, |_, v| v.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn job() -> Job {
        Job::new(
            crate::model::JobId::new("j1").unwrap(),
            "job",
            crate::model::Priority::Normal,
            crate::model::JobDefinition::Inline {
                spec: serde_json::json!({}),
            },
            HashMap::new(),
            0,
        )
    }

    fn candidate(id: &str, used_cpu: u64, total_cpu: u64) -> Candidate {
        Candidate {
            pool_id: PoolId::new(id).unwrap(),
            utilization: ResourcePoolUtilization {
                total_cpu_millicores: total_cpu,
                used_cpu_millicores: used_cpu,
                total_memory_bytes: 1024,
                used_memory_bytes: 0,
                total_disk_bytes: 0,
                used_disk_bytes: 0,
                running_jobs: 0,
                queued_jobs: 0,
                timestamp: chrono::Utc::now(),
            },
            max_jobs: None,
        }
    }

    #[test]
    fn round_robin_cycles_lexicographic_order() {
        let strategy = RoundRobin::new();
        let candidates = vec![candidate("b", 0, 100), candidate("a", 0, 100)];
        let job = job();
        assert_eq!(strategy.select(&job, &candidates).unwrap().as_str(), "a");
        assert_eq!(strategy.select(&job, &candidates).unwrap().as_str(), "b");
        assert_eq!(strategy.select(&job, &candidates).unwrap().as_str(), "a");
    }

    #[test]
    fn round_robin_errors_on_empty_candidates() {
        let strategy = RoundRobin::new();
        assert_eq!(
            strategy.select(&job(), &[]).unwrap_err(),
            StrategyError::NoCandidates
        );
    }

    #[test]
    fn greedy_best_fit_picks_least_utilized() {
        let strategy = GreedyBestFit;
        let candidates = vec![candidate("a", 80, 100), candidate("b", 10, 100)];
        assert_eq!(
            strategy.select(&job(), &candidates).unwrap().as_str(),
            "b"
        );
    }

    #[test]
    fn binpacking_discards_near_full_pools() {
        let strategy = BinPackingFirstFit;
        let candidates = vec![candidate("full", 95, 100)];
        assert_eq!(
            strategy.select(&job(), &candidates).unwrap_err(),
            StrategyError::NoCandidates
        );
    }

    #[test]
    fn binpacking_prefers_mid_utilization_over_near_empty() {
        let strategy = BinPackingFirstFit;
        let candidates = vec![candidate("empty", 1, 100), candidate("mid", 50, 100)];
        assert_eq!(
            strategy.select(&job(), &candidates).unwrap().as_str(),
            "mid"
        );
    }
}
