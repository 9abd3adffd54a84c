//! The abstract key/value contract Raft uses for persistent state
//! (SPEC_FULL.md §4.6/§6.4/§10.4). `store`/`load`/`delete`/`exists`/`list_keys`
//! are the entire surface the consensus engine depends on; everything else
//! a production daemon might persist (sessions, licenses, task history) is
//! out of scope.

use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

#[async_trait]
pub trait RaftStore: Send + Sync {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// sqlite-backed implementation, WAL mode, following the connection-setup
/// pattern used elsewhere in this codebase for crash-safe local persistence.
pub struct SqliteRaftStore {
    pool: sqlx::SqlitePool,
}

impl SqliteRaftStore {
    pub async fn new(data_dir: &Path) -> Result<Self, StorageError> {
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};

        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| StorageError::Encoding(e.to_string()))?;
        let db_path = data_dir.join("raft.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))
                .map_err(StorageError::Backend)?
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = sqlx::SqlitePool::connect_with(opts)
            .await
            .map_err(StorageError::Backend)?;
        sqlx::query(include_str!("migrations/001_init.sql"))
            .execute(&pool)
            .await
            .map_err(StorageError::Backend)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl RaftStore for SqliteRaftStore {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO kv (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Backend)?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::Backend)?;
        Ok(row.map(|(v,)| v))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Backend)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.load(key).await?.is_some())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pattern = format!("{prefix}%");
        let rows: Vec<(String,)> = sqlx::query_as("SELECT key FROM kv WHERE key LIKE ?")
            .bind(pattern)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Backend)?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }
}

/// In-memory implementation for tests and single-process multi-node
/// Raft simulations — no disk I/O, so Raft safety properties can be
/// exercised deterministically.
#[derive(Default)]
pub struct MemoryRaftStore {
    inner: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryRaftStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RaftStore for MemoryRaftStore {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.inner.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.lock().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.inner.lock().await.contains_key(key))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .inner
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryRaftStore::new();
        assert!(!store.exists("a").await.unwrap());
        store.store("a", vec![1, 2, 3]).await.unwrap();
        assert!(store.exists("a").await.unwrap());
        assert_eq!(store.load("a").await.unwrap(), Some(vec![1, 2, 3]));
        store.delete("a").await.unwrap();
        assert_eq!(store.load("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_store_list_keys_by_prefix() {
        let store = MemoryRaftStore::new();
        store.store("node/1/log/1", vec![]).await.unwrap();
        store.store("node/1/log/2", vec![]).await.unwrap();
        store.store("node/1/state", vec![]).await.unwrap();
        let mut keys = store.list_keys("node/1/log/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["node/1/log/1", "node/1/log/2"]);
    }

    #[tokio::test]
    async fn sqlite_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRaftStore::new(dir.path()).await.unwrap();
        store.store("k", b"v".to_vec()).await.unwrap();
        assert_eq!(store.load("k").await.unwrap(), Some(b"v".to_vec()));
        store.store("k", b"v2".to_vec()).await.unwrap();
        assert_eq!(store.load("k").await.unwrap(), Some(b"v2".to_vec()));
    }
}
