use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight in-process counters surfaced through `gateway.getStats`.
/// Not an exporter pipeline — see SPEC_FULL.md §10.5.
pub struct Metrics {
    started_at: Instant,
    connections: AtomicU64,
    sessions: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    assignment_ticks: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            connections: AtomicU64::new(0),
            sessions: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            assignment_ticks: AtomicU64::new(0),
        }
    }
}

impl Metrics {
    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_removed(&self) {
        self.sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn assignment_tick(&self) {
        self.assignment_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            assignment_ticks: self.assignment_ticks.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub connections: u64,
    pub sessions: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub assignment_ticks: u64,
    pub uptime_seconds: u64,
}
