pub mod auth;
pub mod config;
pub mod error;
pub mod event_router;
pub mod gateway;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod raft;
pub mod storage;
pub mod work;

#[cfg(test)]
pub mod test_support;

use std::sync::Arc;

use config::DaemonConfig;
use event_router::EventRouter;
use gateway::Gateway;
use metrics::Metrics;
use presence::PresenceRegistry;
use raft::RaftNode;
use work::{Algorithm, WorkDistributor};

/// Shared application state passed to every RPC handler and background task
/// (SPEC_FULL.md §10.6), mirroring the teacher's single-`Arc<AppContext>`
/// hand-off into `ipc::run` and its background jobs.
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub gateway: Arc<Gateway>,
    pub presence: Arc<PresenceRegistry>,
    pub event_router: Arc<EventRouter>,
    pub auth: Arc<AuthManagerHandle>,
    pub work: Arc<WorkDistributor>,
    pub raft: Arc<RaftNode>,
    pub metrics: Arc<Metrics>,
    pub started_at: std::time::Instant,
}

/// Re-exported under a crate-local alias so `AppContext.auth` reads as a
/// plain field without an import cycle between `lib.rs` and `auth::mod`.
pub type AuthManagerHandle = auth::AuthManager;

impl AppContext {
    /// Assembles every component from a loaded config and an open Raft store,
    /// the way the teacher's `run_server` builds one `AppContext` before
    /// handing it to `ipc::run` (SPEC_FULL.md §10.6).
    pub async fn build(
        config: Arc<DaemonConfig>,
        raft_store: Arc<dyn storage::RaftStore>,
    ) -> Result<Arc<Self>, error::RaftError> {
        let gateway = Arc::new(Gateway::new(10 * 1024 * 1024));
        let presence = Arc::new(PresenceRegistry::new());
        let event_router = Arc::new(EventRouter::new());
        let auth = Arc::new(auth::AuthManager::new());
        let metrics = Arc::new(Metrics::default());
        let work = Arc::new(WorkDistributor::new(Algorithm::Adaptive, config.max_attempts, metrics.clone()));

        let persistence = raft::RaftPersistence::new(&config.node_id, raft_store);
        let transport: Arc<dyn raft::RaftTransport> = Arc::new(raft::InProcessTransport::new());
        let timers = raft::RaftTimers {
            election_min: config.timers.election_timeout_min,
            election_max: config.timers.election_timeout_max,
            heartbeat_interval: config.timers.raft_heartbeat_interval,
        };
        let raft = RaftNode::new(config.node_id.clone(), config.peers.clone(), persistence, transport, timers).await?;

        Ok(Arc::new(Self {
            config,
            gateway,
            presence,
            event_router,
            auth,
            work,
            raft,
            metrics,
            started_at: std::time::Instant::now(),
        }))
    }

    /// Spawns every background loop (Raft election/heartbeat, presence stale
    /// detector, auth token cleanup, work distributor assignment/monitor/
    /// rebalance) the way the teacher's `run_server` spawns its jobs right
    /// after building the context.
    pub fn spawn_background_loops(self: &Arc<Self>) {
        let timers = &self.config.timers;

        tokio::spawn(self.raft.clone().spawn_election_loop());
        tokio::spawn(self.raft.clone().spawn_heartbeat_loop());

        tokio::spawn(self.presence.clone().spawn_stale_detector(
            timers.stale_detector_interval,
            timers.stale_timeout,
            timers.heartbeat_timeout,
        ));
        tokio::spawn(self.auth.clone().spawn_cleanup_loop(timers.token_cleanup_interval));
        tokio::spawn(self.gateway.clone().spawn_heartbeat_loop(timers.heartbeat_interval, timers.heartbeat_timeout));

        tokio::spawn(self.work.clone().spawn_assignment_loop(timers.assignment_tick));
        tokio::spawn(self.work.clone().spawn_monitor_loop(timers.monitor_tick, timers.max_task_duration));
        tokio::spawn(self.work.clone().spawn_rebalance_loop(timers.rebalance_tick));
    }

    /// Stops components in dependency order on shutdown (SPEC_FULL.md §5
    /// Cancellation policy): Raft flushes persistent state last, after the
    /// gateway and work distributor's own loops have already been cancelled
    /// by the caller dropping their `JoinHandle`s.
    pub async fn shutdown(&self) {
        self.raft.stop().await;
    }
}
