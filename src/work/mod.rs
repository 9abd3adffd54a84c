//! Work distributor (SPEC_FULL.md §4.7): task submission, priority/dependency
//! queue, load balancing, and the assignment/monitoring/rebalancing loops.

pub mod balancer;
pub mod queue;
pub mod task;

pub use balancer::{Algorithm, LoadBalancer, TaskTypeAffinity};
pub use queue::TaskQueue;
pub use task::{AgentLoad, Task, TaskPriority, TaskRequirements, TaskResult, TaskState};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::error::WorkError;
use crate::metrics::Metrics;

/// A task handed to an agent, paired with the attempt number the agent is
/// executing so result callbacks can correlate retries.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub task: Task,
}

struct AgentEntry {
    load: AgentLoad,
    sender: mpsc::Sender<Dispatch>,
}

type ResultCallback = Arc<dyn Fn(TaskResult) + Send + Sync>;

pub struct WorkDistributor {
    queue: Mutex<TaskQueue>,
    agents: Mutex<HashMap<String, AgentEntry>>,
    running: Mutex<HashMap<String, Task>>,
    results: Mutex<HashMap<String, TaskResult>>,
    result_callbacks: Mutex<Vec<ResultCallback>>,
    balancer: LoadBalancer,
    affinities: Mutex<HashMap<String, TaskTypeAffinity>>,
    max_attempts_default: u32,
    metrics: Arc<Metrics>,
}

impl WorkDistributor {
    pub fn new(algorithm: Algorithm, max_attempts_default: u32, metrics: Arc<Metrics>) -> Self {
        Self {
            queue: Mutex::new(TaskQueue::new()),
            agents: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            result_callbacks: Mutex::new(Vec::new()),
            balancer: LoadBalancer::new(algorithm),
            affinities: Mutex::new(HashMap::new()),
            max_attempts_default,
            metrics,
        }
    }

    /// Registers an agent and returns the receiving half of its dispatch
    /// channel — the channel IS the "registered callback" of SPEC_FULL.md
    /// §4.7, kept as a channel rather than a closure to stay suspend-safe.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        capabilities: Vec<String>,
    ) -> mpsc::Receiver<Dispatch> {
        let (tx, rx) = mpsc::channel(256);
        let mut guard = self.agents.lock().await;
        guard.insert(
            agent_id.to_string(),
            AgentEntry {
                load: AgentLoad::new(agent_id, capabilities),
                sender: tx,
            },
        );
        rx
    }

    pub async fn unregister_agent(&self, agent_id: &str) {
        self.agents.lock().await.remove(agent_id);
    }

    pub async fn update_agent_load(
        &self,
        agent_id: &str,
        cpu_util: f64,
        mem_util: f64,
        weight: f64,
    ) {
        let mut guard = self.agents.lock().await;
        if let Some(entry) = guard.get_mut(agent_id) {
            entry.load.cpu_util = cpu_util;
            entry.load.mem_util = mem_util;
            entry.load.weight = weight;
            entry.load.last_heartbeat = Utc::now();
        }
    }

    pub async fn submit_task(
        &self,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        priority: TaskPriority,
        requirements: TaskRequirements,
    ) -> String {
        let task = Task::new(task_type, payload, priority, requirements, self.max_attempts_default);
        let id = task.id.clone();
        self.queue.lock().await.enqueue(task);
        id
    }

    pub async fn submit_batch(
        &self,
        tasks: Vec<(String, serde_json::Value, TaskPriority, TaskRequirements)>,
    ) -> Vec<String> {
        let mut ids = Vec::with_capacity(tasks.len());
        let mut queue = self.queue.lock().await;
        for (task_type, payload, priority, requirements) in tasks {
            let task = Task::new(task_type, payload, priority, requirements, self.max_attempts_default);
            ids.push(task.id.clone());
            queue.enqueue(task);
        }
        ids
    }

    pub async fn subscribe_results(&self, callback: ResultCallback) {
        self.result_callbacks.lock().await.push(callback);
    }

    /// One assignment tick (~100ms, SPEC_FULL.md §4.7). Lock order: queue,
    /// then agent/load-balancer state — never the reverse, per §5 Locking
    /// policy. Agents are offered tasks in ascending current-load order,
    /// which keeps load naturally balanced between explicit rebalances.
    pub async fn assignment_tick(&self) -> Vec<(String, Dispatch)> {
        let mut queue = self.queue.lock().await;
        let mut agents = self.agents.lock().await;

        let mut order: Vec<String> = agents.keys().cloned().collect();
        order.sort_by_key(|id| {
            let a = &agents[id].load;
            a.active + a.queued
        });

        let mut dispatched = Vec::new();
        for agent_id in order {
            let load_snapshot = agents[&agent_id].load.clone();
            let Some(mut task) = queue.dequeue_for_agent(&load_snapshot) else {
                continue;
            };
            task.state = TaskState::Running;
            task.started_at = Some(Utc::now());
            task.attempts += 1;
            task.assigned_agent = Some(agent_id.clone());
            if let Some(entry) = agents.get_mut(&agent_id) {
                entry.load.active += 1;
            }
            dispatched.push((agent_id, Dispatch { task }));
        }
        dispatched
    }

    /// Sends dispatched tasks to their agent's channel and records them as
    /// running for the monitoring loop. If the channel is closed the task is
    /// treated as a synchronous dispatch failure (§4.7 step 3).
    pub async fn deliver(&self, dispatched: Vec<(String, Dispatch)>) {
        for (agent_id, dispatch) in dispatched {
            let task_id = dispatch.task.id.clone();
            let sender = {
                let agents = self.agents.lock().await;
                agents.get(&agent_id).map(|e| e.sender.clone())
            };
            let sent = match sender {
                Some(sender) => sender.send(dispatch.clone()).await.is_ok(),
                None => false,
            };
            if sent {
                self.running.lock().await.insert(task_id, dispatch.task);
            } else {
                warn!(%task_id, %agent_id, "dispatch channel closed — treating as failure");
                self.on_task_result(TaskResult {
                    task_id,
                    agent_id,
                    success: false,
                    result: None,
                    error: Some("dispatch failed: agent channel closed".to_string()),
                })
                .await;
            }
        }
    }

    /// Records a result, applies retry policy on failure, and notifies
    /// subscribers. `attempts` strictly increments and is never reset; once
    /// it reaches `max_attempts` the task terminates as failed (testable
    /// property 10).
    pub async fn on_task_result(&self, result: TaskResult) {
        let mut running = self.running.lock().await;
        let Some(mut task) = running.remove(&result.task_id) else {
            warn!(task_id = %result.task_id, "result for unknown/already-resolved task");
            return;
        };
        drop(running);

        {
            let mut agents = self.agents.lock().await;
            if let Some(entry) = agents.get_mut(&result.agent_id) {
                entry.load.active = entry.load.active.saturating_sub(1);
            }
        }

        if result.success {
            task.state = TaskState::Completed;
            task.completed_at = Some(Utc::now());
            task.result = result.result.clone();
            self.queue.lock().await.mark_completed(&task.id);
            self.metrics.task_completed();
        } else if task.attempts < task.max_attempts {
            task.state = TaskState::Retrying;
            task.error = result.error.clone();
            let mut retry = task.clone();
            retry.state = TaskState::Pending;
            retry.assigned_agent = None;
            retry.started_at = None;
            self.queue.lock().await.requeue_retry(retry);
        } else {
            task.state = TaskState::Failed;
            task.completed_at = Some(Utc::now());
            task.error = result.error.clone();
            self.metrics.task_failed();
        }

        self.results.lock().await.insert(result.task_id.clone(), result.clone());
        let callbacks = self.result_callbacks.lock().await.clone();
        for cb in callbacks {
            cb(result.clone());
        }
    }

    /// Monitoring loop body (every 10s, §4.7): any running task whose
    /// duration exceeds `max_task_duration` is treated as failed with
    /// "task timeout" and routed through the same retry logic.
    pub async fn monitor_tick(&self, max_task_duration: chrono::Duration) {
        let now = Utc::now();
        let timed_out: Vec<(String, String)> = {
            let running = self.running.lock().await;
            running
                .values()
                .filter(|t| {
                    t.started_at
                        .map(|s| now - s > max_task_duration)
                        .unwrap_or(false)
                })
                .map(|t| (t.id.clone(), t.assigned_agent.clone().unwrap_or_else(|| "unknown".to_string())))
                .collect()
        };
        for (task_id, agent_id) in timed_out {
            self.on_task_result(TaskResult {
                task_id,
                agent_id,
                success: false,
                result: None,
                error: Some("task timeout".to_string()),
            })
            .await;
        }
    }

    /// Rebalancing loop body (every 30s, §4.7). Detects imbalance
    /// (max - min queued+active > 5 between any two agents) and nudges
    /// queued tasks matching the least-loaded agent's capabilities to the
    /// front of their priority lanes, so the next assignment ticks (which
    /// already favor ascending load) pick them up sooner. See SPEC_FULL.md
    /// §10.8 for the full resolution of the rebalancer's migration protocol.
    pub async fn rebalance_tick(&self) {
        let loads: Vec<(String, u32, Vec<String>)> = {
            let agents = self.agents.lock().await;
            agents
                .values()
                .map(|e| (e.load.agent_id.clone(), e.load.active + e.load.queued, e.load.capabilities.clone()))
                .collect()
        };
        if loads.len() < 2 {
            return;
        }
        let (min_id, min_load, min_caps) = loads.iter().min_by_key(|(_, l, _)| *l).unwrap().clone();
        let (max_id, max_load, _) = loads.iter().max_by_key(|(_, l, _)| *l).unwrap().clone();
        if max_load <= min_load || max_load - min_load <= 5 {
            return;
        }
        let budget = ((max_load - min_load) / 2).max(1) as usize;
        let migrated = self
            .queue
            .lock()
            .await
            .drain_matching(|t| min_caps.iter().all(|c| t.requirements.capabilities.contains(c) || t.requirements.capabilities.is_empty()), budget);
        let count = migrated.len();
        {
            let mut queue = self.queue.lock().await;
            for task in migrated {
                queue.requeue_retry(task);
            }
        }
        if count > 0 {
            info!(from = %max_id, to = %min_id, count, "rebalanced queued tasks toward least-loaded agent");
        }
    }

    pub async fn stats(&self) -> serde_json::Value {
        let queue_stats = self.queue.lock().await.stats();
        let running = self.running.lock().await.len();
        let completed = self
            .results
            .lock()
            .await
            .values()
            .filter(|r| r.success)
            .count();
        serde_json::json!({
            "queue": queue_stats,
            "running": running,
            "completed": completed,
        })
    }

    pub async fn task_result(&self, task_id: &str) -> Result<TaskResult, WorkError> {
        self.results
            .lock()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| WorkError::TaskNotFound(task_id.to_string()))
    }

    pub async fn spawn_assignment_loop(self: Arc<Self>, tick: std::time::Duration) {
        let mut ticker = tokio::time::interval(tick);
        loop {
            ticker.tick().await;
            let dispatched = self.assignment_tick().await;
            if !dispatched.is_empty() {
                self.deliver(dispatched).await;
            }
        }
    }

    pub async fn spawn_monitor_loop(self: Arc<Self>, tick: std::time::Duration, max_task_duration: std::time::Duration) {
        let mut ticker = tokio::time::interval(tick);
        let max_duration = chrono::Duration::from_std(max_task_duration).unwrap_or(chrono::Duration::seconds(3600));
        loop {
            ticker.tick().await;
            self.monitor_tick(max_duration).await;
        }
    }

    pub async fn spawn_rebalance_loop(self: Arc<Self>, tick: std::time::Duration) {
        let mut ticker = tokio::time::interval(tick);
        loop {
            ticker.tick().await;
            self.rebalance_tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assignment_tick_dispatches_to_registered_agent() {
        let wd = WorkDistributor::new(Algorithm::Adaptive, 3, Arc::new(Metrics::default()));
        let mut rx = wd.register_agent("agent-1", vec![]).await;
        wd.submit_task("build", serde_json::json!({}), TaskPriority::Normal, TaskRequirements::default())
            .await;
        let dispatched = wd.assignment_tick().await;
        assert_eq!(dispatched.len(), 1);
        wd.deliver(dispatched).await;
        let received = rx.try_recv().unwrap();
        assert_eq!(received.task.state, TaskState::Running);
    }

    #[tokio::test]
    async fn failed_task_retries_until_max_attempts() {
        let wd = WorkDistributor::new(Algorithm::Adaptive, 2, Arc::new(Metrics::default()));
        wd.register_agent("agent-1", vec![]).await;
        let id = wd
            .submit_task("build", serde_json::json!({}), TaskPriority::Normal, TaskRequirements::default())
            .await;
        let dispatched = wd.assignment_tick().await;
        wd.deliver(dispatched).await;
        wd.on_task_result(TaskResult {
            task_id: id.clone(),
            agent_id: "agent-1".to_string(),
            success: false,
            result: None,
            error: Some("boom".to_string()),
        })
        .await;
        // One retry remains (max_attempts = 2, attempts already = 1).
        let dispatched2 = wd.assignment_tick().await;
        assert_eq!(dispatched2.len(), 1);
        wd.deliver(dispatched2).await;
        wd.on_task_result(TaskResult {
            task_id: id,
            agent_id: "agent-1".to_string(),
            success: false,
            result: None,
            error: Some("boom again".to_string()),
        })
        .await;
        // Exhausted: no further dispatch.
        let dispatched3 = wd.assignment_tick().await;
        assert!(dispatched3.is_empty());
    }

    #[tokio::test]
    async fn monitor_tick_fails_stuck_tasks() {
        let wd = WorkDistributor::new(Algorithm::Adaptive, 1, Arc::new(Metrics::default()));
        wd.register_agent("agent-1", vec![]).await;
        let dispatched = wd
            .submit_task("build", serde_json::json!({}), TaskPriority::Normal, TaskRequirements::default())
            .await;
        let _ = dispatched;
        let ticked = wd.assignment_tick().await;
        wd.deliver(ticked).await;
        wd.monitor_tick(chrono::Duration::seconds(-1)).await;
        let stats = wd.stats().await;
        assert_eq!(stats["running"], 0);
    }
}
