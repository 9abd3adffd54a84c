//! Raft consensus engine (SPEC_FULL.md §4.6): leader election and log
//! replication with crash-stop safety — at most one leader per term,
//! committed entries are durable, log matching holds (testable properties
//! 6-8).

pub mod election;
pub mod log;
pub mod rpc;
pub mod storage;

pub use log::LogEntry;
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InProcessTransport, RaftTransport,
    RequestVoteRequest, RequestVoteResponse,
};
pub use storage::{PersistentState, RaftPersistence};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::RaftError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

struct RaftState {
    role: Role,
    current_term: u32,
    voted_for: Option<String>,
    log: Vec<LogEntry>,
    commit_index: u32,
    last_applied: u32,
    current_leader_id: Option<String>,
    /// Leader-only volatile state — for each peer, the next log index to
    /// send and the highest index known to be replicated there.
    next_index: HashMap<String, u32>,
    match_index: HashMap<String, u32>,
    election_deadline: Instant,
}

impl RaftState {
    fn last_log_index(&self) -> u32 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    fn last_log_term(&self) -> u32 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Candidate's log is at least as up-to-date as ours: higher last-log
    /// term, or equal term and a greater-or-equal index (SPEC_FULL.md §4.6
    /// Election, clause c).
    fn log_at_least_as_up_to_date(&self, last_log_term: u32, last_log_index: u32) -> bool {
        match last_log_term.cmp(&self.last_log_term()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => last_log_index >= self.last_log_index(),
        }
    }

    /// Entry at 1-based `index`, or `None` if out of range.
    fn entry_at(&self, index: u32) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }
}

#[derive(Debug, Clone)]
pub struct RaftTimers {
    pub election_min: Duration,
    pub election_max: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RaftTimers {
    fn default() -> Self {
        Self {
            election_min: Duration::from_millis(150),
            election_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}

/// A single Raft node. Peer RPCs are sent through a pluggable
/// [`RaftTransport`]; persistent state goes through a [`RaftPersistence`]
/// over the abstract key/value contract.
pub struct RaftNode {
    pub node_id: String,
    peers: Vec<String>,
    persistence: RaftPersistence,
    transport: Arc<dyn RaftTransport>,
    timers: RaftTimers,
    state: Mutex<RaftState>,
    applied_tx: broadcast::Sender<LogEntry>,
}

impl RaftNode {
    pub async fn new(
        node_id: impl Into<String>,
        peers: Vec<String>,
        persistence: RaftPersistence,
        transport: Arc<dyn RaftTransport>,
        timers: RaftTimers,
    ) -> Result<Arc<Self>, RaftError> {
        let node_id = node_id.into();
        let persisted = persistence.load_state().await?;
        let log = persistence.load_log().await?;
        let (applied_tx, _) = broadcast::channel(1024);
        let election_deadline = Instant::now() + random_timeout(&timers);
        let node = Arc::new(Self {
            node_id,
            peers,
            persistence,
            transport,
            timers,
            state: Mutex::new(RaftState {
                role: Role::Follower,
                current_term: persisted.current_term,
                voted_for: persisted.voted_for,
                log,
                commit_index: persisted.commit_index,
                last_applied: persisted.last_applied,
                current_leader_id: None,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                election_deadline,
            }),
            applied_tx,
        });
        Ok(node)
    }

    pub fn subscribe_applied(&self) -> broadcast::Receiver<LogEntry> {
        self.applied_tx.subscribe()
    }

    pub async fn role(&self) -> Role {
        self.state.lock().await.role
    }

    pub async fn current_term(&self) -> u32 {
        self.state.lock().await.current_term
    }

    pub async fn current_leader(&self) -> Option<String> {
        self.state.lock().await.current_leader_id.clone()
    }

    /// Client API: append a command to the leader's log and drive it toward
    /// commit. Fails with `not_leader` (plus a redirect hint) on a follower
    /// or candidate (SPEC_FULL.md §4.6 Client API).
    pub async fn propose(self: &Arc<Self>, data: Vec<u8>, kind: impl Into<String>) -> Result<LogEntry, RaftError> {
        let kind = kind.into();
        let (entry, term) = {
            let mut guard = self.state.lock().await;
            if guard.role != Role::Leader {
                return Err(RaftError::NotLeader {
                    leader_hint: guard.current_leader_id.clone(),
                });
            }
            let index = guard.last_log_index() + 1;
            let entry = LogEntry {
                term: guard.current_term,
                index,
                entry_type: kind,
                data,
            };
            guard.log.push(entry.clone());
            let term = guard.current_term;
            guard.match_index.insert(self.node_id.clone(), index);
            (entry, term)
        };
        self.persistence.append_entry(&entry).await?;

        if self.peers.is_empty() {
            // Single-node cluster: this node alone is a majority of one.
            self.advance_commit_and_apply().await;
            return Ok(entry);
        }

        self.replicate_to_peers(term).await;
        self.advance_commit_and_apply().await;
        Ok(entry)
    }

    /// Sends AppendEntries to every peer carrying whatever is outstanding
    /// past that peer's `next_index`, retrying once on a log-matching
    /// conflict by backing off to the leader's conflict hint.
    async fn replicate_to_peers(self: &Arc<Self>, term: u32) {
        let futures = self.peers.iter().cloned().map(|peer| {
            let this = Arc::clone(self);
            async move { this.replicate_to_one_peer(&peer, term).await }
        });
        futures_util::future::join_all(futures).await;
    }

    async fn replicate_to_one_peer(self: &Arc<Self>, peer: &str, term: u32) {
        for _attempt in 0..2 {
            let (req, next_index) = {
                let guard = self.state.lock().await;
                if guard.role != Role::Leader || guard.current_term != term {
                    return;
                }
                let next_index = *guard.next_index.get(peer).unwrap_or(&(guard.last_log_index() + 1));
                let prev_log_index = next_index.saturating_sub(1);
                let prev_log_term = guard.entry_at(prev_log_index).map(|e| e.term).unwrap_or(0);
                let entries: Vec<LogEntry> = guard
                    .log
                    .iter()
                    .filter(|e| e.index >= next_index)
                    .cloned()
                    .collect();
                (
                    AppendEntriesRequest {
                        term,
                        leader_id: self.node_id.clone(),
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit: guard.commit_index,
                    },
                    next_index,
                )
            };
            let sent_through = req.prev_log_index + req.entries.len() as u32;
            let Some(resp) = self.transport.send_append_entries(peer, req).await else {
                return;
            };
            let mut guard = self.state.lock().await;
            if resp.term > guard.current_term {
                self.step_down_locked(&mut guard, resp.term);
                return;
            }
            if guard.role != Role::Leader || guard.current_term != term {
                return;
            }
            if resp.success {
                guard.match_index.insert(peer.to_string(), sent_through);
                guard.next_index.insert(peer.to_string(), sent_through + 1);
                return;
            }
            let retry_from = resp.conflict_index.unwrap_or_else(|| next_index.saturating_sub(1).max(1));
            guard.next_index.insert(peer.to_string(), retry_from);
            drop(guard);
        }
    }

    /// Advances `commit_index` to the highest N such that a majority of
    /// `match_index` values are >= N and `log[N].term == current_term`
    /// (SPEC_FULL.md §4.6 Log replication), then applies newly committed
    /// entries in order.
    async fn advance_commit_and_apply(self: &Arc<Self>) {
        let mut guard = self.state.lock().await;
        if guard.role != Role::Leader {
            return;
        }
        let total_nodes = self.peers.len() + 1;
        let quorum = total_nodes / 2 + 1;
        let current_term = guard.current_term;

        let mut candidate_indices: Vec<u32> = guard.match_index.values().copied().collect();
        candidate_indices.push(guard.last_log_index());
        candidate_indices.sort_unstable();
        candidate_indices.dedup();

        let mut new_commit = guard.commit_index;
        for n in candidate_indices.into_iter().rev() {
            if n <= guard.commit_index {
                break;
            }
            let acked = guard.match_index.values().filter(|&&m| m >= n).count() + 1; // +1 for self
            let term_matches = guard.entry_at(n).map(|e| e.term == current_term).unwrap_or(false);
            if acked >= quorum && term_matches {
                new_commit = n;
                break;
            }
        }
        if new_commit > guard.commit_index {
            guard.commit_index = new_commit;
        }
        drop(guard);
        self.apply_committed().await;
    }

    /// Applies entries `last_applied+1 ..= commit_index` to the state
    /// machine in strict order (testable property — Raft applies in
    /// strict (term, index) order), persisting progress as it goes.
    async fn apply_committed(&self) {
        loop {
            let next = {
                let guard = self.state.lock().await;
                if guard.last_applied >= guard.commit_index {
                    return;
                }
                guard.entry_at(guard.last_applied + 1).cloned()
            };
            let Some(entry) = next else { return };
            let _ = self.applied_tx.send(entry.clone());
            let mut guard = self.state.lock().await;
            guard.last_applied = entry.index;
            let persisted = PersistentState {
                current_term: guard.current_term,
                voted_for: guard.voted_for.clone(),
                commit_index: guard.commit_index,
                last_applied: guard.last_applied,
            };
            drop(guard);
            if let Err(e) = self.persistence.save_state(&persisted).await {
                // A durability guarantee broken here is an invariant violation,
                // not a recoverable error (SPEC_FULL.md §7 Propagation policy).
                panic!("failed to persist applied state: {e}");
            }
        }
    }

    /// Inbound RequestVote handler, called by this node's [`RaftTransport`]
    /// when a candidate peer contacts it.
    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let mut guard = self.state.lock().await;
        if req.term < guard.current_term {
            return RequestVoteResponse {
                term: guard.current_term,
                vote_granted: false,
            };
        }
        if req.term > guard.current_term {
            self.step_down_locked(&mut guard, req.term);
        }
        let already_voted_for_other = guard
            .voted_for
            .as_ref()
            .map(|v| v != &req.candidate_id)
            .unwrap_or(false);
        let log_ok = guard.log_at_least_as_up_to_date(req.last_log_term, req.last_log_index);
        let grant = !already_voted_for_other && log_ok;
        if grant {
            guard.voted_for = Some(req.candidate_id.clone());
            guard.election_deadline = Instant::now() + random_timeout(&self.timers);
        }
        let term = guard.current_term;
        let persisted = PersistentState {
            current_term: guard.current_term,
            voted_for: guard.voted_for.clone(),
            commit_index: guard.commit_index,
            last_applied: guard.last_applied,
        };
        drop(guard);
        // Voted-for must be durable before the grant is observable by the
        // candidate (SPEC_FULL.md §4.6 Persistence).
        if let Err(e) = self.persistence.save_state(&persisted).await {
            panic!("failed to persist vote: {e}");
        }
        RequestVoteResponse { term, vote_granted: grant }
    }

    /// Inbound AppendEntries handler (heartbeat or replication), called by
    /// this node's [`RaftTransport`] when the leader peer contacts it.
    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut guard = self.state.lock().await;
        if req.term < guard.current_term {
            return AppendEntriesResponse {
                term: guard.current_term,
                success: false,
                conflict_index: None,
            };
        }
        if req.term > guard.current_term {
            self.step_down_locked(&mut guard, req.term);
        } else if guard.role != Role::Follower {
            guard.role = Role::Follower;
        }
        guard.current_leader_id = Some(req.leader_id.clone());
        guard.election_deadline = Instant::now() + random_timeout(&self.timers);

        if req.prev_log_index > 0 {
            match guard.entry_at(req.prev_log_index) {
                Some(e) if e.term == req.prev_log_term => {}
                Some(_) => {
                    let conflict_index = guard.entry_at(req.prev_log_index).map(|e| e.index).unwrap_or(1);
                    let term = guard.current_term;
                    return AppendEntriesResponse {
                        term,
                        success: false,
                        conflict_index: Some(conflict_index.min(req.prev_log_index)),
                    };
                }
                None => {
                    let term = guard.current_term;
                    let conflict_index = guard.last_log_index() + 1;
                    return AppendEntriesResponse {
                        term,
                        success: false,
                        conflict_index: Some(conflict_index),
                    };
                }
            }
        }

        let mut truncated_from: Option<u32> = None;
        for entry in &req.entries {
            match guard.entry_at(entry.index) {
                Some(existing) if existing.term == entry.term => continue,
                Some(_) => {
                    guard.log.truncate((entry.index - 1) as usize);
                    truncated_from = Some(truncated_from.map_or(entry.index, |f| f.min(entry.index)));
                }
                None => {}
            }
            guard.log.push(entry.clone());
        }

        if req.leader_commit > guard.commit_index {
            guard.commit_index = req.leader_commit.min(guard.last_log_index());
        }
        let term = guard.current_term;
        let persisted = PersistentState {
            current_term: guard.current_term,
            voted_for: guard.voted_for.clone(),
            commit_index: guard.commit_index,
            last_applied: guard.last_applied,
        };
        drop(guard);

        // The in-memory truncation above makes this request's entries the
        // authoritative suffix from the first conflicting index; the backing
        // store must match before any response claims the entries accepted
        // (SPEC_FULL.md §4.6 Persistence, Log Matching).
        if let Some(from) = truncated_from {
            if let Err(e) = self.persistence.truncate_from(from).await {
                panic!("failed to truncate conflicting log suffix: {e}");
            }
        }
        for entry in &req.entries {
            if let Err(e) = self.persistence.append_entry(entry).await {
                panic!("failed to persist log entry: {e}");
            }
        }
        if let Err(e) = self.persistence.save_state(&persisted).await {
            panic!("failed to persist follower state: {e}");
        }
        self.apply_committed().await;

        AppendEntriesResponse { term, success: true, conflict_index: None }
    }

    /// Steps down to Follower on observing a higher term in any message
    /// (SPEC_FULL.md §4.6 role transitions). Caller already holds the lock.
    fn step_down_locked(&self, guard: &mut RaftState, new_term: u32) {
        guard.role = Role::Follower;
        guard.current_term = new_term;
        guard.voted_for = None;
        guard.current_leader_id = None;
    }

    /// Candidate increments current-term, votes for self, and requests
    /// votes from all peers (SPEC_FULL.md §4.6 Election). A single-node
    /// cluster (empty peer list) becomes leader on its first timeout.
    async fn start_election(self: &Arc<Self>) {
        let (persisted, last_log_index, last_log_term) = {
            let mut guard = self.state.lock().await;
            guard.role = Role::Candidate;
            guard.current_term += 1;
            guard.voted_for = Some(self.node_id.clone());
            guard.current_leader_id = None;
            guard.election_deadline = Instant::now() + random_timeout(&self.timers);
            let persisted = PersistentState {
                current_term: guard.current_term,
                voted_for: guard.voted_for.clone(),
                commit_index: guard.commit_index,
                last_applied: guard.last_applied,
            };
            (persisted, guard.last_log_index(), guard.last_log_term())
        };
        let term = persisted.current_term;
        if let Err(e) = self.persistence.save_state(&persisted).await {
            panic!("failed to persist candidacy: {e}");
        }

        info!(node = %self.node_id, term, "starting election");

        if self.peers.is_empty() {
            self.become_leader(term).await;
            return;
        }

        let req = RequestVoteRequest {
            term,
            candidate_id: self.node_id.clone(),
            last_log_index,
            last_log_term,
        };
        let total_nodes = self.peers.len() + 1;
        let quorum = total_nodes / 2 + 1;
        let mut votes = 1usize; // vote for self

        let futures = self.peers.iter().cloned().map(|peer| {
            let this = Arc::clone(self);
            let req = req.clone();
            async move { this.transport.send_request_vote(&peer, req).await }
        });
        let responses = futures_util::future::join_all(futures).await;
        for resp in responses.into_iter().flatten() {
            let mut guard = self.state.lock().await;
            if resp.term > guard.current_term {
                self.step_down_locked(&mut guard, resp.term);
                return;
            }
            drop(guard);
            if resp.vote_granted {
                votes += 1;
            }
        }

        let guard = self.state.lock().await;
        let still_candidate = guard.role == Role::Candidate && guard.current_term == term;
        drop(guard);
        if still_candidate && votes >= quorum {
            self.become_leader(term).await;
        } else {
            debug!(node = %self.node_id, term, votes, quorum, "election did not reach quorum");
        }
    }

    async fn become_leader(self: &Arc<Self>, term: u32) {
        let mut guard = self.state.lock().await;
        if guard.current_term != term {
            return; // stale election result
        }
        guard.role = Role::Leader;
        guard.current_leader_id = Some(self.node_id.clone());
        let next = guard.last_log_index() + 1;
        guard.next_index = self.peers.iter().map(|p| (p.clone(), next)).collect();
        guard.match_index = self.peers.iter().map(|p| (p.clone(), 0)).collect();
        guard.match_index.insert(self.node_id.clone(), guard.last_log_index());
        drop(guard);
        info!(node = %self.node_id, term, "elected leader");
    }

    /// Background election-timeout watcher: steps up to Candidate whenever
    /// the deadline elapses without a heartbeat resetting it.
    pub async fn spawn_election_loop(self: Arc<Self>) {
        loop {
            let deadline = self.state.lock().await.election_deadline;
            let now = Instant::now();
            if deadline > now {
                tokio::time::sleep(deadline - now).await;
            }
            let (role, deadline_after_sleep) = {
                let guard = self.state.lock().await;
                (guard.role, guard.election_deadline)
            };
            if role != Role::Leader && Instant::now() >= deadline_after_sleep {
                self.start_election().await;
            }
        }
    }

    /// Leader heartbeat loop: sends (possibly empty) AppendEntries to every
    /// peer every `heartbeat_interval`, well under the election timeout
    /// floor (SPEC_FULL.md §4.6 Timers).
    pub async fn spawn_heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.timers.heartbeat_interval);
        loop {
            ticker.tick().await;
            let (role, term) = {
                let guard = self.state.lock().await;
                (guard.role, guard.current_term)
            };
            if role != Role::Leader {
                continue;
            }
            if self.peers.is_empty() {
                continue;
            }
            self.replicate_to_peers(term).await;
            self.advance_commit_and_apply().await;
        }
    }

    /// Flushes persistent state before returning (SPEC_FULL.md §5
    /// Cancellation: "Raft stop flushes persistent state before returning").
    pub async fn stop(&self) {
        let guard = self.state.lock().await;
        let persisted = PersistentState {
            current_term: guard.current_term,
            voted_for: guard.voted_for.clone(),
            commit_index: guard.commit_index,
            last_applied: guard.last_applied,
        };
        drop(guard);
        if let Err(e) = self.persistence.save_state(&persisted).await {
            warn!(err = %e, "failed to flush raft state on stop");
        }
    }
}

fn random_timeout(timers: &RaftTimers) -> Duration {
    election::random_election_timeout(timers.election_min, timers.election_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRaftStore;
    use std::sync::Arc;

    async fn single_node() -> Arc<RaftNode> {
        let store: Arc<dyn crate::storage::RaftStore> = Arc::new(MemoryRaftStore::new());
        let persistence = RaftPersistence::new("n1", store);
        let transport: Arc<dyn RaftTransport> = Arc::new(InProcessTransport::new());
        RaftNode::new(
            "n1",
            vec![],
            persistence,
            transport,
            RaftTimers {
                election_min: Duration::from_millis(10),
                election_max: Duration::from_millis(20),
                heartbeat_interval: Duration::from_millis(5),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn single_node_cluster_elects_itself_and_commits_on_propose() {
        let node = single_node().await;
        node.start_election().await;
        assert_eq!(node.role().await, Role::Leader);
        let entry = node.propose(b"cmd".to_vec(), "test").await.unwrap();
        assert_eq!(entry.term, 1);
        assert_eq!(entry.index, 1);
        assert_eq!(node.state.lock().await.commit_index, 1);
        assert_eq!(node.state.lock().await.last_applied, 1);
    }

    #[tokio::test]
    async fn propose_on_follower_fails_not_leader() {
        let node = single_node().await;
        // Still a follower — never ran an election.
        let err = node.propose(b"cmd".to_vec(), "test").await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
    }

    #[tokio::test]
    async fn two_node_cluster_replicates_and_commits_with_quorum() {
        let transport = Arc::new(InProcessTransport::new());
        let store_a: Arc<dyn crate::storage::RaftStore> = Arc::new(MemoryRaftStore::new());
        let store_b: Arc<dyn crate::storage::RaftStore> = Arc::new(MemoryRaftStore::new());
        let timers = RaftTimers {
            election_min: Duration::from_millis(50),
            election_max: Duration::from_millis(80),
            heartbeat_interval: Duration::from_millis(10),
        };
        let node_a = RaftNode::new(
            "a",
            vec!["b".to_string()],
            RaftPersistence::new("a", store_a),
            transport.clone() as Arc<dyn RaftTransport>,
            timers.clone(),
        )
        .await
        .unwrap();
        let node_b = RaftNode::new(
            "b",
            vec!["a".to_string()],
            RaftPersistence::new("b", store_b),
            transport.clone() as Arc<dyn RaftTransport>,
            timers,
        )
        .await
        .unwrap();
        transport.register("a", Arc::downgrade(&node_a)).await;
        transport.register("b", Arc::downgrade(&node_b)).await;

        node_a.start_election().await;
        assert_eq!(node_a.role().await, Role::Leader);
        assert_eq!(node_b.role().await, Role::Follower);

        let entry = node_a.propose(b"cmd".to_vec(), "test").await.unwrap();
        assert_eq!(entry.index, 1);
        assert_eq!(node_a.state.lock().await.commit_index, 1);
        assert_eq!(node_b.state.lock().await.commit_index, 1);
    }

    #[tokio::test]
    async fn higher_term_steps_down_a_leader() {
        let node = single_node().await;
        node.start_election().await;
        assert_eq!(node.role().await, Role::Leader);
        let resp = node
            .handle_append_entries(AppendEntriesRequest {
                term: node.current_term().await + 1,
                leader_id: "other".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .await;
        assert!(resp.success);
        assert_eq!(node.role().await, Role::Follower);
        assert_eq!(node.current_leader().await.as_deref(), Some("other"));
    }
}
