//! Presence and session registry (SPEC_FULL.md §4.4) — the single source of
//! truth for who is online, what capabilities they advertise, and what
//! sessions they hold.

pub mod types;

pub use types::{Capability, ChangeReason, EntityType, PresenceInfo, PresenceStatus, SessionInfo};

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

type PresenceCallback = Arc<dyn Fn(PresenceInfo, ChangeReason) + Send + Sync>;

struct SessionRecord {
    entity_id: String,
    entity_type: EntityType,
    connection_id: String,
    created_at: chrono::DateTime<Utc>,
    last_activity: chrono::DateTime<Utc>,
    authenticated: bool,
    permissions: Vec<String>,
    subscriptions: HashSet<String>,
}

#[derive(Default)]
struct RegistryInner {
    presence: HashMap<String, PresenceInfo>,
    sessions: HashMap<String, SessionRecord>,
    /// entity-id -> live session-ids, used to detect the zero-sessions transition.
    entity_sessions: HashMap<String, HashSet<String>>,
    global_subscribers: Vec<(u64, PresenceCallback)>,
    entity_subscribers: HashMap<String, Vec<(u64, PresenceCallback)>>,
}

pub struct PresenceRegistry {
    inner: RwLock<RegistryInner>,
    next_sub_id: AtomicU64,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            next_sub_id: AtomicU64::new(1),
        }
    }
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        status: PresenceStatus,
        capabilities: Vec<Capability>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> PresenceInfo {
        let info = PresenceInfo {
            entity_id: entity_id.to_string(),
            entity_type,
            status,
            status_message: None,
            activity: None,
            capabilities,
            last_seen: Utc::now(),
            metadata,
        };
        let mut guard = self.inner.write().await;
        guard.presence.insert(entity_id.to_string(), info.clone());
        drop(guard);
        info
    }

    /// Mutates an existing entry; fires a change notification to subscribers
    /// if the status changed. Callbacks run after the lock is released.
    pub async fn update(
        &self,
        entity_id: &str,
        status: PresenceStatus,
        message: Option<String>,
        activity: Option<String>,
    ) -> Option<PresenceInfo> {
        let mut guard = self.inner.write().await;
        let entry = guard.presence.get_mut(entity_id)?;
        let changed = entry.status != status;
        entry.status = status;
        entry.status_message = message;
        entry.activity = activity;
        entry.last_seen = Utc::now();
        let snapshot = entry.clone();
        let (globals, locals) = if changed {
            (
                guard.global_subscribers.clone(),
                guard
                    .entity_subscribers
                    .get(entity_id)
                    .cloned()
                    .unwrap_or_default(),
            )
        } else {
            (Vec::new(), Vec::new())
        };
        drop(guard);
        if changed {
            self.notify(snapshot.clone(), ChangeReason::Explicit, &globals, &locals);
        }
        Some(snapshot)
    }

    /// Forces offline and removes the entry; deletes all sessions for the entity.
    pub async fn remove(&self, entity_id: &str, reason: ChangeReason) {
        let mut guard = self.inner.write().await;
        let Some(mut entry) = guard.presence.remove(entity_id) else {
            return;
        };
        entry.status = PresenceStatus::Offline;
        if let Some(session_ids) = guard.entity_sessions.remove(entity_id) {
            for sid in session_ids {
                guard.sessions.remove(&sid);
            }
        }
        let globals = guard.global_subscribers.clone();
        let locals = guard
            .entity_subscribers
            .remove(entity_id)
            .unwrap_or_default();
        drop(guard);
        self.notify(entry, reason, &globals, &locals);
    }

    /// Refreshes last-seen without other changes.
    pub async fn touch(&self, entity_id: &str) {
        let mut guard = self.inner.write().await;
        if let Some(entry) = guard.presence.get_mut(entity_id) {
            entry.last_seen = Utc::now();
        }
    }

    pub async fn get(&self, entity_id: &str) -> Option<PresenceInfo> {
        self.inner.read().await.presence.get(entity_id).cloned()
    }

    pub async fn list_by_type(&self, entity_type: Option<EntityType>) -> Vec<PresenceInfo> {
        self.inner
            .read()
            .await
            .presence
            .values()
            .filter(|p| entity_type.map(|t| t == p.entity_type).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn create_session(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        connection_id: &str,
    ) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut guard = self.inner.write().await;
        guard.sessions.insert(
            session_id.clone(),
            SessionRecord {
                entity_id: entity_id.to_string(),
                entity_type,
                connection_id: connection_id.to_string(),
                created_at: now,
                last_activity: now,
                authenticated: false,
                permissions: Vec::new(),
                subscriptions: HashSet::new(),
            },
        );
        guard
            .entity_sessions
            .entry(entity_id.to_string())
            .or_default()
            .insert(session_id.clone());
        session_id
    }

    pub async fn authenticate_session(&self, session_id: &str, permissions: Vec<String>) {
        let mut guard = self.inner.write().await;
        if let Some(session) = guard.sessions.get_mut(session_id) {
            session.authenticated = true;
            session.permissions = permissions;
        }
    }

    pub async fn touch_session(&self, session_id: &str) {
        let mut guard = self.inner.write().await;
        if let Some(session) = guard.sessions.get_mut(session_id) {
            session.last_activity = Utc::now();
        }
    }

    pub async fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        let guard = self.inner.read().await;
        let s = guard.sessions.get(session_id)?;
        Some(SessionInfo {
            session_id: session_id.to_string(),
            entity_id: s.entity_id.clone(),
            entity_type: s.entity_type,
            connection_id: s.connection_id.clone(),
            created_at: s.created_at,
            last_activity: s.last_activity,
            authenticated: s.authenticated,
            permissions: s.permissions.clone(),
            subscriptions: s.subscriptions.iter().cloned().collect(),
        })
    }

    pub async fn session_permissions(&self, session_id: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .sessions
            .get(session_id)
            .map(|s| s.permissions.clone())
            .unwrap_or_default()
    }

    pub async fn add_session_subscription(&self, session_id: &str, channel: &str) {
        let mut guard = self.inner.write().await;
        if let Some(session) = guard.sessions.get_mut(session_id) {
            session.subscriptions.insert(channel.to_string());
        }
    }

    pub async fn remove_session_subscription(&self, session_id: &str, channel: &str) {
        let mut guard = self.inner.write().await;
        if let Some(session) = guard.sessions.get_mut(session_id) {
            session.subscriptions.remove(channel);
        }
    }

    /// Removes a session; when it was the last live session for its entity,
    /// the entity's status auto-transitions to offline.
    pub async fn remove_session(&self, session_id: &str, reason: ChangeReason) {
        let mut guard = self.inner.write().await;
        let Some(session) = guard.sessions.remove(session_id) else {
            return;
        };
        let entity_id = session.entity_id.clone();
        let mut now_empty = false;
        if let Some(set) = guard.entity_sessions.get_mut(&entity_id) {
            set.remove(session_id);
            now_empty = set.is_empty();
        }
        if !now_empty {
            return;
        }
        guard.entity_sessions.remove(&entity_id);
        let Some(entry) = guard.presence.get_mut(&entity_id) else {
            return;
        };
        if entry.status == PresenceStatus::Offline {
            return;
        }
        entry.status = PresenceStatus::Offline;
        entry.last_seen = Utc::now();
        let snapshot = entry.clone();
        let globals = guard.global_subscribers.clone();
        let locals = guard
            .entity_subscribers
            .get(&entity_id)
            .cloned()
            .unwrap_or_default();
        drop(guard);
        self.notify(snapshot, reason, &globals, &locals);
    }

    pub async fn live_session_count(&self, entity_id: &str) -> usize {
        self.inner
            .read()
            .await
            .entity_sessions
            .get(entity_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub async fn subscribe_global(&self, callback: PresenceCallback) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner.write().await.global_subscribers.push((id, callback));
        id
    }

    pub async fn subscribe_entity(&self, entity_id: &str, callback: PresenceCallback) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write()
            .await
            .entity_subscribers
            .entry(entity_id.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    fn notify(
        &self,
        info: PresenceInfo,
        reason: ChangeReason,
        globals: &[(u64, PresenceCallback)],
        locals: &[(u64, PresenceCallback)],
    ) {
        for (_, cb) in globals.iter().chain(locals.iter()) {
            cb(info.clone(), reason);
        }
    }

    /// Stale-detector: entries whose last-seen exceeds `stale_timeout`
    /// transition to offline. Sessions whose last-activity exceeds
    /// `heartbeat_timeout` are removed. Run this on its own periodic loop
    /// independent of the gateway's and Raft's heartbeat timers.
    pub async fn sweep_stale(
        &self,
        stale_timeout: chrono::Duration,
        heartbeat_timeout: chrono::Duration,
    ) {
        let now = Utc::now();
        let stale_entities: Vec<String> = {
            let guard = self.inner.read().await;
            guard
                .presence
                .values()
                .filter(|p| p.status != PresenceStatus::Offline && now - p.last_seen > stale_timeout)
                .map(|p| p.entity_id.clone())
                .collect()
        };
        for entity_id in stale_entities {
            self.update(&entity_id, PresenceStatus::Offline, None, None).await;
        }

        let stale_sessions: Vec<String> = {
            let guard = self.inner.read().await;
            guard
                .sessions
                .iter()
                .filter(|(_, s)| now - s.last_activity > heartbeat_timeout)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for session_id in stale_sessions {
            self.remove_session(&session_id, ChangeReason::Timeout).await;
        }
    }

    pub async fn spawn_stale_detector(
        self: Arc<Self>,
        interval: std::time::Duration,
        stale_timeout: std::time::Duration,
        heartbeat_timeout: std::time::Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        let stale = chrono::Duration::from_std(stale_timeout).unwrap_or(chrono::Duration::seconds(120));
        let hb = chrono::Duration::from_std(heartbeat_timeout).unwrap_or(chrono::Duration::seconds(60));
        loop {
            ticker.tick().await;
            self.sweep_stale(stale, hb).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_get() {
        let reg = PresenceRegistry::new();
        reg.register("a1", EntityType::Agent, PresenceStatus::Online, vec![], HashMap::new())
            .await;
        let info = reg.get("a1").await.unwrap();
        assert_eq!(info.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn removing_last_session_sets_offline() {
        let reg = PresenceRegistry::new();
        reg.register("a1", EntityType::Agent, PresenceStatus::Online, vec![], HashMap::new())
            .await;
        let sid = reg.create_session("a1", EntityType::Agent, "conn-1").await;
        assert_eq!(reg.live_session_count("a1").await, 1);
        reg.remove_session(&sid, ChangeReason::ConnectionClosed).await;
        assert_eq!(reg.live_session_count("a1").await, 0);
        let info = reg.get("a1").await.unwrap();
        assert_eq!(info.status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn update_fires_subscribers_only_on_status_change() {
        let reg = Arc::new(PresenceRegistry::new());
        reg.register("a1", EntityType::Agent, PresenceStatus::Online, vec![], HashMap::new())
            .await;
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = count.clone();
        reg.subscribe_global(Arc::new(move |_info, _reason| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        }))
        .await;
        reg.update("a1", PresenceStatus::Online, None, None).await;
        assert_eq!(count.load(Ordering::Relaxed), 0);
        reg.update("a1", PresenceStatus::Away, None, None).await;
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn sweep_stale_marks_offline_after_timeout() {
        let reg = PresenceRegistry::new();
        reg.register("a1", EntityType::Agent, PresenceStatus::Online, vec![], HashMap::new())
            .await;
        reg.sweep_stale(chrono::Duration::seconds(-1), chrono::Duration::seconds(60))
            .await;
        let info = reg.get("a1").await.unwrap();
        assert_eq!(info.status, PresenceStatus::Offline);
    }
}
