use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    // Ord derives low-to-high by declaration order; Background sorts lowest.
    Background,
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Priorities in dispatch order, highest first.
    pub const ORDER: [TaskPriority; 5] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
        TaskPriority::Background,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequirements {
    pub capabilities: Vec<String>,
    pub min_memory_mb: u64,
    pub min_cpu_cores: f64,
    pub dependencies: Vec<String>,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub requirements: TaskRequirements,
    pub state: TaskState,
    pub assigned_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        task_type: impl Into<String>,
        payload: serde_json::Value,
        priority: TaskPriority,
        requirements: TaskRequirements,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            priority,
            requirements,
            state: TaskState::Pending,
            assigned_agent: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts,
            result: None,
            error: None,
        }
    }
}

/// Per-agent load snapshot consumed by the load balancer. Refreshed
/// independently via agent heartbeats (SPEC_FULL.md §4.7 Result propagation).
#[derive(Debug, Clone)]
pub struct AgentLoad {
    pub agent_id: String,
    pub active: u32,
    pub queued: u32,
    pub cpu_util: f64,
    pub mem_util: f64,
    pub weight: f64,
    pub capabilities: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentLoad {
    pub fn new(agent_id: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            active: 0,
            queued: 0,
            cpu_util: 0.0,
            mem_util: 0.0,
            weight: 1.0,
            capabilities,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn can_run(&self, req: &TaskRequirements) -> bool {
        req.capabilities.iter().all(|c| self.capabilities.iter().any(|m| m == c))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}
