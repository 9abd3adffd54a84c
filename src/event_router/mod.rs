//! Event router (SPEC_FULL.md §4.5): channel pub/sub and directed agent
//! routes, decoupling publishers from subscribers.

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct RouterInner {
    channel_subscribers: HashMap<String, HashSet<String>>,
    agent_routes: HashMap<String, String>,
}

pub struct EventRouter {
    inner: RwLock<RouterInner>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self {
            inner: RwLock::new(RouterInner::default()),
        }
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, channel: &str, connection_id: &str) {
        self.inner
            .write()
            .await
            .channel_subscribers
            .entry(channel.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    pub async fn unsubscribe(&self, channel: &str, connection_id: &str) {
        let mut guard = self.inner.write().await;
        if let Some(set) = guard.channel_subscribers.get_mut(channel) {
            set.remove(connection_id);
            if set.is_empty() {
                guard.channel_subscribers.remove(channel);
            }
        }
    }

    /// Drops all subscriptions for a connection — called on disconnect.
    pub async fn unsubscribe_all(&self, connection_id: &str) {
        let mut guard = self.inner.write().await;
        guard.channel_subscribers.retain(|_, set| {
            set.remove(connection_id);
            !set.is_empty()
        });
        guard.agent_routes.retain(|_, conn| conn != connection_id);
    }

    /// Snapshots the subscriber set for a channel. The caller dispatches to
    /// this snapshot after releasing the router's lock, giving best-effort
    /// at-most-once delivery to connections present at dispatch start
    /// (resolves the Open Question in SPEC_FULL.md §10.8).
    pub async fn channel_subscribers(&self, channel: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .channel_subscribers
            .get(channel)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn register_agent_route(&self, agent_id: &str, connection_id: &str) {
        self.inner
            .write()
            .await
            .agent_routes
            .insert(agent_id.to_string(), connection_id.to_string());
    }

    pub async fn unregister_agent_route(&self, agent_id: &str) {
        self.inner.write().await.agent_routes.remove(agent_id);
    }

    pub async fn route_to_agent(&self, agent_id: &str) -> Option<String> {
        self.inner.read().await.agent_routes.get(agent_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publisher_not_included_unless_subscribed() {
        let router = EventRouter::new();
        router.subscribe("news", "c2").await;
        let subs = router.channel_subscribers("news").await;
        assert_eq!(subs, vec!["c2".to_string()]);
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_channel_and_route() {
        let router = EventRouter::new();
        router.subscribe("news", "c1").await;
        router.register_agent_route("agent_001", "c1").await;
        router.unsubscribe_all("c1").await;
        assert!(router.channel_subscribers("news").await.is_empty());
        assert_eq!(router.route_to_agent("agent_001").await, None);
    }

    #[tokio::test]
    async fn route_to_agent_returns_registered_connection() {
        let router = EventRouter::new();
        router.register_agent_route("agent_001", "conn-7").await;
        assert_eq!(router.route_to_agent("agent_001").await.as_deref(), Some("conn-7"));
    }
}
