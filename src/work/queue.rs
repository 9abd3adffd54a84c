//! Priority/dependency-aware task queue (SPEC_FULL.md §4.7).

use std::collections::{HashMap, HashSet, VecDeque};

use super::task::{AgentLoad, Task, TaskPriority, TaskState};

#[derive(Default)]
pub struct TaskQueue {
    lanes: HashMap<TaskPriority, VecDeque<Task>>,
    completed: HashSet<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub by_priority: HashMap<String, usize>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, task: Task) {
        self.lanes.entry(task.priority).or_default().push_back(task);
    }

    /// Re-enqueues a retried task at the head of its priority lane, ahead of
    /// tasks already waiting at the same priority, to preserve fairness for
    /// tasks that have already paid for one failed attempt.
    pub fn requeue_retry(&mut self, task: Task) {
        self.lanes.entry(task.priority).or_default().push_front(task);
    }

    pub fn mark_completed(&mut self, task_id: &str) {
        self.completed.insert(task_id.to_string());
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed.contains(task_id)
    }

    /// Scans priorities in dispatch order; within a priority, scans FIFO
    /// order; returns the first ready task the agent's capabilities satisfy.
    /// Strict priority-then-FIFO order within the capability-matched set
    /// (testable property 9).
    pub fn dequeue_for_agent(&mut self, agent: &AgentLoad) -> Option<Task> {
        let completed = &self.completed;
        for priority in TaskPriority::ORDER {
            let Some(lane) = self.lanes.get_mut(&priority) else {
                continue;
            };
            let pos = lane.iter().position(|t| {
                t.requirements.dependencies.iter().all(|dep| completed.contains(dep))
                    && agent.can_run(&t.requirements)
            });
            if let Some(pos) = pos {
                return lane.remove(pos);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.lanes.values().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued (not running) tasks — used by the rebalancer to
    /// compute per-agent imbalance; the queue itself is agent-agnostic, so
    /// "per agent" queued counts live on `AgentLoad.queued`, refreshed by the
    /// distributor from assignment bookkeeping.
    pub fn stats(&self) -> QueueStats {
        let mut by_priority = HashMap::new();
        for priority in TaskPriority::ORDER {
            let count = self.lanes.get(&priority).map(|l| l.len()).unwrap_or(0);
            by_priority.insert(format!("{priority:?}").to_lowercase(), count);
        }
        QueueStats {
            pending: self.len(),
            by_priority,
        }
    }

    /// Removes and returns queued (never running, since they're still in the
    /// queue) tasks matching a predicate — used by the rebalancer to migrate
    /// work away from an overloaded agent's pending lane.
    pub fn drain_matching(&mut self, mut pred: impl FnMut(&Task) -> bool, max: usize) -> Vec<Task> {
        let mut drained = Vec::new();
        for priority in TaskPriority::ORDER {
            if drained.len() >= max {
                break;
            }
            if let Some(lane) = self.lanes.get_mut(&priority) {
                let mut i = 0;
                while i < lane.len() && drained.len() < max {
                    if pred(&lane[i]) {
                        drained.push(lane.remove(i).unwrap());
                    } else {
                        i += 1;
                    }
                }
            }
        }
        drained
    }
}

pub fn transition(task: &mut Task, state: TaskState) {
    task.state = state;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::task::TaskRequirements;

    fn agent(caps: &[&str]) -> AgentLoad {
        AgentLoad::new("agent-1", caps.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn dequeues_highest_priority_first() {
        let mut q = TaskQueue::new();
        let low = Task::new("x", serde_json::json!({}), TaskPriority::Low, TaskRequirements::default(), 3);
        let high = Task::new("x", serde_json::json!({}), TaskPriority::High, TaskRequirements::default(), 3);
        q.enqueue(low.clone());
        q.enqueue(high.clone());
        let dequeued = q.dequeue_for_agent(&agent(&[])).unwrap();
        assert_eq!(dequeued.id, high.id);
        let dequeued2 = q.dequeue_for_agent(&agent(&[])).unwrap();
        assert_eq!(dequeued2.id, low.id);
    }

    #[test]
    fn fifo_within_same_priority() {
        let mut q = TaskQueue::new();
        let t1 = Task::new("x", serde_json::json!({}), TaskPriority::Normal, TaskRequirements::default(), 3);
        let t2 = Task::new("x", serde_json::json!({}), TaskPriority::Normal, TaskRequirements::default(), 3);
        q.enqueue(t1.clone());
        q.enqueue(t2.clone());
        assert_eq!(q.dequeue_for_agent(&agent(&[])).unwrap().id, t1.id);
        assert_eq!(q.dequeue_for_agent(&agent(&[])).unwrap().id, t2.id);
    }

    #[test]
    fn unsatisfied_dependency_is_never_ready() {
        let mut q = TaskQueue::new();
        let mut reqs = TaskRequirements::default();
        reqs.dependencies = vec!["dep-1".to_string()];
        let t = Task::new("x", serde_json::json!({}), TaskPriority::Critical, reqs, 3);
        q.enqueue(t);
        assert!(q.dequeue_for_agent(&agent(&[])).is_none());
        q.mark_completed("dep-1");
        assert!(q.dequeue_for_agent(&agent(&[])).is_some());
    }

    #[test]
    fn capability_mismatch_is_skipped_not_blocking() {
        let mut q = TaskQueue::new();
        let mut reqs = TaskRequirements::default();
        reqs.capabilities = vec!["gpu".to_string()];
        let needs_gpu = Task::new("x", serde_json::json!({}), TaskPriority::Critical, reqs, 3);
        let plain = Task::new("x", serde_json::json!({}), TaskPriority::Normal, TaskRequirements::default(), 3);
        q.enqueue(needs_gpu.clone());
        q.enqueue(plain.clone());
        let dequeued = q.dequeue_for_agent(&agent(&[])).unwrap();
        assert_eq!(dequeued.id, plain.id);
    }
}
