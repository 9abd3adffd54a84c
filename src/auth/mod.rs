//! Token-based authentication and permission checks (SPEC_FULL.md §4.3).

use chrono::{DateTime, Utc};
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::presence::EntityType;

#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub permissions: HashSet<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenInfo {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains("*") || self.permissions.contains(permission)
    }
}

#[derive(Default)]
struct TokenStoreInner {
    tokens: HashMap<String, TokenInfo>,
    revoked: HashSet<String>,
}

/// Issues, validates, and revokes tokens. All mutation is serialized under a
/// single lock; `validate` is the hot path and only takes a read lock.
pub struct AuthManager {
    inner: RwLock<TokenStoreInner>,
}

impl Default for AuthManager {
    fn default() -> Self {
        Self {
            inner: RwLock::new(TokenStoreInner::default()),
        }
    }
}

impl AuthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a token directly — used by tests and by bootstrap provisioning,
    /// where the token value is chosen externally (e.g. `"T1"` in Scenario A).
    pub async fn seed_token(
        &self,
        token: impl Into<String>,
        entity_id: impl Into<String>,
        entity_type: EntityType,
        permissions: impl IntoIterator<Item = String>,
        expires_in_hours: i64,
    ) {
        let now = Utc::now();
        let info = TokenInfo {
            entity_id: entity_id.into(),
            entity_type,
            permissions: permissions.into_iter().collect(),
            issued_at: now,
            expires_at: now + chrono::Duration::hours(expires_in_hours),
        };
        self.inner.write().await.tokens.insert(token.into(), info);
    }

    /// Generate a fresh token of at least 128 bits of entropy, hex-encoded.
    pub async fn generate_token(
        &self,
        entity_id: impl Into<String>,
        entity_type: EntityType,
        permissions: impl IntoIterator<Item = String>,
        expires_in_hours: i64,
    ) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        self.seed_token(
            token.clone(),
            entity_id,
            entity_type,
            permissions,
            expires_in_hours,
        )
        .await;
        token
    }

    /// Returns the token's annotation iff it is recorded, not expired, and
    /// not revoked (testable property 3). Comparison against stored token
    /// strings runs in constant time with respect to the candidate.
    pub async fn validate(&self, candidate: &str) -> Option<TokenInfo> {
        let guard = self.inner.read().await;
        if guard.revoked.contains(candidate) {
            return None;
        }
        let mut found: Option<TokenInfo> = None;
        for (stored, info) in guard.tokens.iter() {
            if tokens_equal(stored, candidate) {
                found = Some(info.clone());
                break;
            }
        }
        match found {
            Some(info) if !info.is_expired() => Some(info),
            _ => None,
        }
    }

    pub async fn revoke(&self, token: &str) {
        let mut guard = self.inner.write().await;
        guard.revoked.insert(token.to_string());
        guard.tokens.remove(token);
    }

    /// Periodic sweep removing expired tokens (default every 5 minutes).
    /// Revoked tokens stay in the revocation set until their natural expiry
    /// to keep `validate` correct for callers still holding the old string.
    pub async fn cleanup_expired(&self) -> usize {
        let mut guard = self.inner.write().await;
        let before = guard.tokens.len();
        guard.tokens.retain(|_, info| !info.is_expired());
        before - guard.tokens.len()
    }

    pub async fn spawn_cleanup_loop(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = self.cleanup_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "swept expired tokens");
            }
        }
    }
}

/// Constant-time string comparison to avoid timing side-channels on the
/// token value.
fn tokens_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn validate_rejects_unknown_token() {
        let auth = AuthManager::new();
        assert!(auth.validate("nope").await.is_none());
    }

    #[tokio::test]
    async fn validate_accepts_seeded_token_with_wildcard() {
        let auth = AuthManager::new();
        auth.seed_token("T1", "agent_001", EntityType::Agent, vec!["*".to_string()], 1)
            .await;
        let info = auth.validate("T1").await.unwrap();
        assert_eq!(info.entity_id, "agent_001");
        assert!(info.has_permission("anything.at.all"));
    }

    #[tokio::test]
    async fn validate_rejects_expired_token() {
        let auth = AuthManager::new();
        auth.seed_token("T1", "agent_001", EntityType::Agent, vec!["*".to_string()], -1)
            .await;
        assert!(auth.validate("T1").await.is_none());
    }

    #[tokio::test]
    async fn revoked_token_never_validates_again() {
        let auth = AuthManager::new();
        auth.seed_token("T1", "agent_001", EntityType::Agent, vec!["*".to_string()], 1)
            .await;
        auth.revoke("T1").await;
        assert!(auth.validate("T1").await.is_none());
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired() {
        let auth = AuthManager::new();
        auth.seed_token("live", "a", EntityType::Agent, vec!["*".to_string()], 1)
            .await;
        auth.seed_token("dead", "b", EntityType::Agent, vec!["*".to_string()], -1)
            .await;
        let removed = auth.cleanup_expired().await;
        assert_eq!(removed, 1);
        assert!(auth.validate("live").await.is_some());
    }
}
