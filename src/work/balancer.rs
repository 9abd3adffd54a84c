//! Pluggable agent-selection algorithms (SPEC_FULL.md §4.7).

use super::task::AgentLoad;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RoundRobin,
    LeastLoaded,
    Weighted,
    Capacity,
    Adaptive,
}

/// Per-task-type affinity scores an agent advertises, consulted by the
/// adaptive algorithm's task-type term.
#[derive(Default, Clone)]
pub struct TaskTypeAffinity {
    pub scores: HashMap<String, f64>,
}

pub struct LoadBalancer {
    algorithm: Algorithm,
    round_robin_counter: AtomicU64,
}

impl LoadBalancer {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            round_robin_counter: AtomicU64::new(0),
        }
    }

    /// Selects an agent from `candidates` (already capability-filtered by the
    /// caller) for a task of the given type. Returns `None` if `candidates`
    /// is empty.
    pub fn select<'a>(
        &self,
        candidates: &'a [AgentLoad],
        task_type: &str,
        affinities: &HashMap<String, TaskTypeAffinity>,
    ) -> Option<&'a AgentLoad> {
        if candidates.is_empty() {
            return None;
        }
        match self.algorithm {
            Algorithm::RoundRobin => {
                let idx = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) as usize
                    % candidates.len();
                candidates.get(idx)
            }
            Algorithm::LeastLoaded => candidates
                .iter()
                .min_by_key(|a| a.active + a.queued),
            Algorithm::Weighted => {
                let total_weight: f64 = candidates.iter().map(|a| a.weight.max(0.0)).sum();
                if total_weight <= 0.0 {
                    return candidates.first();
                }
                let mut pick = rand::thread_rng().gen_range(0.0..total_weight);
                for agent in candidates {
                    pick -= agent.weight.max(0.0);
                    if pick <= 0.0 {
                        return Some(agent);
                    }
                }
                candidates.last()
            }
            Algorithm::Capacity => candidates.iter().max_by(|a, b| {
                capacity_score(a)
                    .partial_cmp(&capacity_score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            Algorithm::Adaptive => candidates
                .iter()
                .map(|a| (a, adaptive_score(a, task_type, affinities)))
                .max_by(|(a1, s1), (a2, s2)| {
                    s1.partial_cmp(s2)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a2.agent_id.cmp(&a1.agent_id))
                })
                .map(|(a, _)| a),
        }
    }
}

fn capacity_score(agent: &AgentLoad) -> f64 {
    ((1.0 - agent.cpu_util) + (1.0 - agent.mem_util)) / (1.0 + agent.active as f64)
}

/// Linear combination of load (<=40 pts), weight (<=20), recency (<=10), and
/// task-type preference (<=30). Highest score wins; ties broken by
/// lexicographic agent-id (ascending — smallest id wins).
fn adaptive_score(
    agent: &AgentLoad,
    task_type: &str,
    affinities: &HashMap<String, TaskTypeAffinity>,
) -> f64 {
    let total_work = (agent.active + agent.queued) as f64;
    let load_score = 40.0 * (1.0 / (1.0 + total_work));

    let weight_score = 20.0 * (agent.weight.clamp(0.0, 2.0) / 2.0);

    let idle_secs = (chrono::Utc::now() - agent.last_heartbeat).num_seconds().max(0) as f64;
    let recency_score = 10.0 * (1.0 / (1.0 + idle_secs / 10.0));

    let affinity = affinities
        .get(&agent.agent_id)
        .and_then(|a| a.scores.get(task_type))
        .copied()
        .unwrap_or(0.5);
    let task_type_score = 30.0 * affinity.clamp(0.0, 1.0);

    load_score + weight_score + recency_score + task_type_score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, active: u32, queued: u32) -> AgentLoad {
        let mut a = AgentLoad::new(id, vec![]);
        a.active = active;
        a.queued = queued;
        a
    }

    #[test]
    fn least_loaded_picks_minimum_active_plus_queued() {
        let lb = LoadBalancer::new(Algorithm::LeastLoaded);
        let candidates = vec![agent("a", 5, 0), agent("b", 1, 1)];
        let picked = lb.select(&candidates, "build", &HashMap::new()).unwrap();
        assert_eq!(picked.agent_id, "b");
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let lb = LoadBalancer::new(Algorithm::RoundRobin);
        let candidates = vec![agent("a", 0, 0), agent("b", 0, 0)];
        let first = lb.select(&candidates, "build", &HashMap::new()).unwrap().agent_id.clone();
        let second = lb.select(&candidates, "build", &HashMap::new()).unwrap().agent_id.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn capacity_prefers_least_utilized() {
        let lb = LoadBalancer::new(Algorithm::Capacity);
        let mut busy = agent("a", 0, 0);
        busy.cpu_util = 0.9;
        busy.mem_util = 0.9;
        let idle = agent("b", 0, 0);
        let candidates = vec![busy, idle];
        let picked = lb.select(&candidates, "build", &HashMap::new()).unwrap();
        assert_eq!(picked.agent_id, "b");
    }

    #[test]
    fn adaptive_breaks_ties_lexicographically() {
        let lb = LoadBalancer::new(Algorithm::Adaptive);
        let candidates = vec![agent("zzz", 0, 0), agent("aaa", 0, 0)];
        let picked = lb.select(&candidates, "build", &HashMap::new()).unwrap();
        assert_eq!(picked.agent_id, "aaa");
    }

    #[test]
    fn select_on_empty_candidates_is_none() {
        let lb = LoadBalancer::new(Algorithm::Adaptive);
        assert!(lb.select(&[], "build", &HashMap::new()).is_none());
    }
}
