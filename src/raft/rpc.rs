//! Raft peer RPCs and the transport abstraction that carries them
//! (SPEC_FULL.md §6.3). Exact transport is an implementation choice; this
//! crate ships an in-process transport so single-node and test clusters need
//! no real network. A production deployment supplies its own `RaftTransport`.

use super::log::LogEntry;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct RequestVoteRequest {
    pub term: u32,
    pub candidate_id: String,
    pub last_log_index: u32,
    pub last_log_term: u32,
}

#[derive(Debug, Clone)]
pub struct RequestVoteResponse {
    pub term: u32,
    pub vote_granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesRequest {
    pub term: u32,
    pub leader_id: String,
    pub prev_log_index: u32,
    pub prev_log_term: u32,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u32,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesResponse {
    pub term: u32,
    pub success: bool,
    /// When `success` is false, the index the leader should retry from
    /// (conflict hint) — lets the leader skip back more than one index at a
    /// time instead of decrementing by exactly one per round trip.
    pub conflict_index: Option<u32>,
}

#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Returns `None` on timeout or an unreachable peer — the crash-stop
    /// model this engine assumes (no Byzantine behavior, SPEC_FULL.md §1).
    async fn send_request_vote(
        &self,
        peer: &str,
        req: RequestVoteRequest,
    ) -> Option<RequestVoteResponse>;

    async fn send_append_entries(
        &self,
        peer: &str,
        req: AppendEntriesRequest,
    ) -> Option<AppendEntriesResponse>;
}

/// In-process transport for single-process multi-node clusters (tests, and
/// the single-node default). Peers register themselves by node-id after
/// construction; a weak reference avoids a reference cycle since each
/// `RaftNode` also holds an `Arc` to its own transport.
pub struct InProcessTransport {
    nodes: tokio::sync::RwLock<std::collections::HashMap<String, std::sync::Weak<super::RaftNode>>>,
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self {
            nodes: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, node_id: impl Into<String>, node: std::sync::Weak<super::RaftNode>) {
        self.nodes.write().await.insert(node_id.into(), node);
    }
}

#[async_trait]
impl RaftTransport for InProcessTransport {
    async fn send_request_vote(
        &self,
        peer: &str,
        req: RequestVoteRequest,
    ) -> Option<RequestVoteResponse> {
        let node = self.nodes.read().await.get(peer)?.upgrade()?;
        Some(node.handle_request_vote(req).await)
    }

    async fn send_append_entries(
        &self,
        peer: &str,
        req: AppendEntriesRequest,
    ) -> Option<AppendEntriesResponse> {
        let node = self.nodes.read().await.get(peer)?.upgrade()?;
        Some(node.handle_append_entries(req).await)
    }
}
