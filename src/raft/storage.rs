//! Maps Raft's persistent state onto the abstract key/value contract
//! (SPEC_FULL.md §6.4): `node/<id>/state` and `node/<id>/log/<index>`.

use std::sync::Arc;

use crate::error::RaftError;
use crate::storage::RaftStore;

use super::log::LogEntry;

#[derive(Debug, Clone, Default)]
pub struct PersistentState {
    pub current_term: u32,
    pub voted_for: Option<String>,
    pub commit_index: u32,
    pub last_applied: u32,
}

impl PersistentState {
    fn encode(&self) -> Vec<u8> {
        // Small fixed-layout encoding: term, commit_index, last_applied as
        // u32 big-endian, then an optional voted_for string.
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.current_term.to_be_bytes());
        buf.extend_from_slice(&self.commit_index.to_be_bytes());
        buf.extend_from_slice(&self.last_applied.to_be_bytes());
        match &self.voted_for {
            Some(id) => {
                buf.push(1);
                buf.extend_from_slice(&(id.len() as u32).to_be_bytes());
                buf.extend_from_slice(id.as_bytes());
            }
            None => buf.push(0),
        }
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, RaftError> {
        if bytes.len() < 13 {
            return Err(RaftError::CorruptLog {
                index: 0,
                reason: "persistent state shorter than fixed header".to_string(),
            });
        }
        let current_term = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let commit_index = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let last_applied = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let voted_for = if bytes[12] == 1 {
            let len = u32::from_be_bytes(bytes[13..17].try_into().unwrap()) as usize;
            let s = String::from_utf8(bytes[17..17 + len].to_vec())
                .map_err(|e| RaftError::CorruptLog { index: 0, reason: e.to_string() })?;
            Some(s)
        } else {
            None
        };
        Ok(Self {
            current_term,
            voted_for,
            commit_index,
            last_applied,
        })
    }
}

pub struct RaftPersistence {
    node_id: String,
    store: Arc<dyn RaftStore>,
}

impl RaftPersistence {
    pub fn new(node_id: impl Into<String>, store: Arc<dyn RaftStore>) -> Self {
        Self { node_id: node_id.into(), store }
    }

    fn state_key(&self) -> String {
        format!("node/{}/state", self.node_id)
    }

    fn log_key(&self, index: u32) -> String {
        format!("node/{}/log/{}", self.node_id, index)
    }

    /// Must complete before any message depending on the new state is sent
    /// (SPEC_FULL.md §4.6 Persistence, §6.4 Atomicity).
    pub async fn save_state(&self, state: &PersistentState) -> Result<(), RaftError> {
        self.store
            .store(&self.state_key(), state.encode())
            .await
            .map_err(RaftError::Storage)
    }

    pub async fn load_state(&self) -> Result<PersistentState, RaftError> {
        match self.store.load(&self.state_key()).await.map_err(RaftError::Storage)? {
            Some(bytes) => PersistentState::decode(&bytes),
            None => Ok(PersistentState::default()),
        }
    }

    /// Must complete before an AppendEntries response claims the entry
    /// accepted.
    pub async fn append_entry(&self, entry: &LogEntry) -> Result<(), RaftError> {
        self.store
            .store(&self.log_key(entry.index), entry.to_bytes())
            .await
            .map_err(RaftError::Storage)
    }

    pub async fn truncate_from(&self, from_index: u32) -> Result<(), RaftError> {
        let prefix = format!("node/{}/log/", self.node_id);
        let keys = self.store.list_keys(&prefix).await.map_err(RaftError::Storage)?;
        for key in keys {
            if let Some(idx_str) = key.strip_prefix(&prefix) {
                if let Ok(idx) = idx_str.parse::<u32>() {
                    if idx >= from_index {
                        self.store.delete(&key).await.map_err(RaftError::Storage)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Loads the full log, ordered by index, for rebuilding in-memory state
    /// on startup.
    pub async fn load_log(&self) -> Result<Vec<LogEntry>, RaftError> {
        let prefix = format!("node/{}/log/", self.node_id);
        let keys = self.store.list_keys(&prefix).await.map_err(RaftError::Storage)?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.store.load(&key).await.map_err(RaftError::Storage)? {
                entries.push(LogEntry::from_bytes(&bytes)?);
            }
        }
        entries.sort_by_key(|e| e.index);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRaftStore;

    #[tokio::test]
    async fn state_roundtrips_through_the_kv_contract() {
        let store: Arc<dyn RaftStore> = Arc::new(MemoryRaftStore::new());
        let persistence = RaftPersistence::new("n1", store);
        let state = PersistentState {
            current_term: 3,
            voted_for: Some("n2".to_string()),
            commit_index: 5,
            last_applied: 5,
        };
        persistence.save_state(&state).await.unwrap();
        let loaded = persistence.load_state().await.unwrap();
        assert_eq!(loaded.current_term, 3);
        assert_eq!(loaded.voted_for, Some("n2".to_string()));
    }

    #[tokio::test]
    async fn truncate_from_removes_conflicting_suffix() {
        let store: Arc<dyn RaftStore> = Arc::new(MemoryRaftStore::new());
        let persistence = RaftPersistence::new("n1", store);
        for i in 1..=5u32 {
            persistence
                .append_entry(&LogEntry { term: 1, index: i, entry_type: "t".into(), data: vec![] })
                .await
                .unwrap();
        }
        persistence.truncate_from(3).await.unwrap();
        let log = persistence.load_log().await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|e| e.index < 3));
    }
}
