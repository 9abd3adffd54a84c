//! Test-only helpers for assembling a minimal [`AppContext`] without a real
//! socket or on-disk store — used by dispatcher and handler tests across the
//! crate (`#[cfg(test)]` only, never compiled into the release binary).

use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthManager;
use crate::config::{DaemonConfig, Timers};
use crate::event_router::EventRouter;
use crate::gateway::Gateway;
use crate::metrics::Metrics;
use crate::presence::PresenceRegistry;
use crate::raft::{InProcessTransport, RaftNode, RaftPersistence, RaftTimers, RaftTransport};
use crate::storage::MemoryRaftStore;
use crate::work::{Algorithm, WorkDistributor};
use crate::AppContext;

/// A fully wired [`AppContext`] backed by in-memory collaborators: a
/// single-node Raft engine over [`MemoryRaftStore`], millisecond-scale
/// timers, and no bound gateway socket. Handlers that only touch presence,
/// auth, the event router, or work distribution behave identically to the
/// production build; nothing here exercises the WebSocket accept loop.
pub async fn test_context() -> Arc<AppContext> {
    let config = Arc::new(DaemonConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        data_dir: std::env::temp_dir(),
        log: "info".to_string(),
        node_id: "test-node".to_string(),
        peers: Vec::new(),
        max_attempts: 3,
        timers: Timers {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            stale_timeout: Duration::from_secs(120),
            stale_detector_interval: Duration::from_secs(30),
            token_cleanup_interval: Duration::from_secs(300),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            raft_heartbeat_interval: Duration::from_millis(50),
            assignment_tick: Duration::from_millis(100),
            monitor_tick: Duration::from_secs(10),
            rebalance_tick: Duration::from_secs(30),
            max_task_duration: Duration::from_secs(3600),
        },
    });

    let gateway = Arc::new(Gateway::new(10 * 1024 * 1024));
    let presence = Arc::new(PresenceRegistry::new());
    let event_router = Arc::new(EventRouter::new());
    let auth = Arc::new(AuthManager::new());
    let metrics = Arc::new(Metrics::default());
    let work = Arc::new(WorkDistributor::new(Algorithm::Adaptive, config.max_attempts, metrics.clone()));

    let store: Arc<dyn crate::storage::RaftStore> = Arc::new(MemoryRaftStore::new());
    let persistence = RaftPersistence::new(&config.node_id, store);
    let transport: Arc<dyn RaftTransport> = Arc::new(InProcessTransport::new());
    let raft = RaftNode::new(
        config.node_id.clone(),
        config.peers.clone(),
        persistence,
        transport,
        RaftTimers {
            election_min: Duration::from_millis(10),
            election_max: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(5),
        },
    )
    .await
    .expect("in-memory raft store never fails to load");

    Arc::new(AppContext {
        config,
        gateway,
        presence,
        event_router,
        auth,
        work,
        raft,
        metrics,
        started_at: std::time::Instant::now(),
    })
}
