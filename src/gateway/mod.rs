//! Gateway (SPEC_FULL.md §4.1): accepts WebSocket connections, maintains
//! per-connection state, drives heartbeats, and forwards frames to the
//! protocol dispatcher. Grounded in the teacher's `ipc::run`/`handle_connection`
//! accept-loop shape; the per-connection bounded outbound queue and explicit
//! connection table are this crate's own addition (the teacher instead relies
//! purely on a single broadcast channel with no backpressure or per-entity
//! routing, which this spec requires).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::presence::ChangeReason;
use crate::AppContext;

/// Max inbound WebSocket frame (SPEC_FULL.md §4.1 Frame-size policy).
const DEFAULT_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;
/// Bounded outbound queue depth per connection before it is treated as a slow consumer.
const OUTBOUND_QUEUE_DEPTH: usize = 1024;
/// New connections accepted per source IP per minute before rejection.
const MAX_CONNECTIONS_PER_MIN: usize = 120;

pub const SERVER_CAPABILITIES: &[&str] = &[
    "jsonrpc_2.0",
    "event_streaming",
    "presence",
    "multi_agent",
    "channel_subscriptions",
];

struct ConnectionHandle {
    sender: mpsc::Sender<Value>,
    entity_id: RwLock<Option<String>>,
    last_activity_ms: Arc<AtomicI64>,
}

/// Per-IP connection rate tracker, same shape as the teacher's `ConnectionRateLimiter`.
struct ConnectionRateLimiter {
    connections: HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self { connections: HashMap::new() }
    }

    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - Duration::from_secs(60);
        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);
        if timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

/// Connection table and outbound delivery for the WebSocket gateway. `run`
/// (the accept loop) lives at module scope because it needs `AppContext` to
/// dispatch frames; the table itself stays free of a dispatcher dependency so
/// other components can push notifications through it without importing the
/// protocol layer.
pub struct Gateway {
    connections: RwLock<HashMap<String, Arc<ConnectionHandle>>>,
    frame_max: usize,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Gateway {
    pub fn new(frame_max: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            frame_max,
        }
    }

    pub(crate) async fn register_connection(&self) -> (String, mpsc::Receiver<Value>, Arc<AtomicI64>) {
        let connection_id = format!("conn_{}", uuid::Uuid::new_v4());
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let last_activity = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
        let handle = Arc::new(ConnectionHandle {
            sender: tx,
            entity_id: RwLock::new(None),
            last_activity_ms: last_activity.clone(),
        });
        self.connections.write().await.insert(connection_id.clone(), handle);
        (connection_id, rx, last_activity)
    }

    pub async fn bind_entity(&self, connection_id: &str, entity_id: &str) {
        if let Some(handle) = self.connections.read().await.get(connection_id) {
            *handle.entity_id.write().await = Some(entity_id.to_string());
        }
    }

    /// Drops the connection's outbound sender, which is the sole cause of the
    /// owning connection task's `outbound_rx.recv()` returning `None` on its
    /// next poll — this is what actually closes the socket, whether the
    /// removal was triggered by a heartbeat timeout or ordinary disconnect.
    pub async fn remove_connection(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Serializes and enqueues on the connection's outbound channel. Fails
    /// with `ConnectionClosed` if unknown, `SlowConsumer` if the bounded queue
    /// is full (SPEC_FULL.md §4.1 Backpressure).
    pub async fn send(&self, connection_id: &str, message: Value) -> Result<(), GatewayError> {
        let sender = {
            let guard = self.connections.read().await;
            guard.get(connection_id).map(|h| h.sender.clone())
        };
        let sender = sender.ok_or(GatewayError::ConnectionClosed)?;
        sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => GatewayError::SlowConsumer,
            mpsc::error::TrySendError::Closed(_) => GatewayError::ConnectionClosed,
        })
    }

    /// Sends to every live connection, optionally skipping one (e.g. the
    /// publisher of a channel message it should not receive back).
    pub async fn broadcast(&self, message: Value, exclude: Option<&str>) {
        let guard = self.connections.read().await;
        for (id, handle) in guard.iter() {
            if Some(id.as_str()) == exclude {
                continue;
            }
            let _ = handle.sender.try_send(message.clone());
        }
    }

    /// Looks up the connection bound to `entity_id` and sends to it.
    pub async fn route_to_entity(&self, entity_id: &str, message: Value) -> Result<(), GatewayError> {
        let target = {
            let guard = self.connections.read().await;
            let mut found = None;
            for (id, handle) in guard.iter() {
                if handle.entity_id.read().await.as_deref() == Some(entity_id) {
                    found = Some(id.clone());
                    break;
                }
            }
            found
        };
        let connection_id = target.ok_or(GatewayError::ConnectionClosed)?;
        self.send(&connection_id, message).await
    }

    /// Heartbeat tick (SPEC_FULL.md §4.1 Heartbeat policy): pings connections
    /// still within the ping window, force-closes ones past the timeout.
    async fn heartbeat_tick(&self, timeout: Duration, ping_window: Duration) {
        let now = Utc::now().timestamp_millis();
        let timeout_ms = timeout.as_millis() as i64;
        let window_ms = ping_window.as_millis() as i64;
        let mut to_close = Vec::new();
        let mut to_ping = Vec::new();
        {
            let guard = self.connections.read().await;
            for (id, handle) in guard.iter() {
                let age_ms = now - handle.last_activity_ms.load(Ordering::Relaxed);
                if age_ms > timeout_ms {
                    to_close.push(id.clone());
                } else if age_ms <= window_ms {
                    to_ping.push(id.clone());
                }
            }
        }
        for id in &to_ping {
            let _ = self
                .send(
                    id,
                    serde_json::json!({
                        "jsonrpc": "2.0",
                        "method": "heartbeat",
                        "params": { "timestamp": Utc::now().to_rfc3339() }
                    }),
                )
                .await;
        }
        for id in to_close {
            warn!(connection_id = %id, "heartbeat timeout — closing connection");
            self.remove_connection(&id).await;
        }
    }

    pub async fn spawn_heartbeat_loop(self: Arc<Self>, interval: Duration, timeout: Duration) {
        let mut ticker = tokio::time::interval(interval);
        let ping_window = timeout + timeout / 2;
        loop {
            ticker.tick().await;
            self.heartbeat_tick(timeout, ping_window).await;
        }
    }
}

/// Binds and runs the accept loop until shutdown (SPEC_FULL.md §4.1 `start`).
pub async fn run(ctx: Arc<AppContext>) -> Result<(), GatewayError> {
    let addr = format!("{}:{}", ctx.config.host, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening");

    let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping gateway accept loop");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                {
                    let mut limiter = conn_limiter.lock().await;
                    if !limiter.check_and_record(peer.ip()) {
                        warn!(peer = %peer, "connection rate limit exceeded — rejecting");
                        drop(stream);
                        continue;
                    }
                }
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("gateway stopped");
    Ok(())
}

async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, ctx: Arc<AppContext>) -> Result<(), GatewayError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(ctx.gateway.frame_max),
        max_frame_size: Some(ctx.gateway.frame_max),
        ..Default::default()
    };
    let ws = accept_async_with_config(stream, Some(ws_config)).await.map_err(|_| GatewayError::ConnectionClosed)?;
    let (mut sink, mut stream) = ws.split();

    let (connection_id, mut outbound_rx, last_activity) = ctx.gateway.register_connection().await;
    ctx.metrics.connection_opened();

    let welcome = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "connection.welcome",
        "params": {
            "connection_id": connection_id,
            "server_version": env!("CARGO_PKG_VERSION"),
            "timestamp": Utc::now().to_rfc3339(),
            "capabilities": SERVER_CAPABILITIES,
        }
    });
    if sink.send(Message::Text(welcome.to_string())).await.is_err() {
        ctx.gateway.remove_connection(&connection_id).await;
        ctx.metrics.connection_closed();
        return Ok(());
    }

    let mut bound_entity: Option<String> = None;
    let mut bound_session: Option<String> = None;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > ctx.gateway.frame_max {
                            break;
                        }
                        last_activity.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                        let response = crate::protocol::dispatch_text(
                            &text,
                            &ctx,
                            &connection_id,
                            &mut bound_entity,
                            &mut bound_session,
                        ).await;
                        if let Some(response) = response {
                            if sink.send(Message::Text(response)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_activity.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_activity.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(value) => {
                        if sink.send(Message::Text(value.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    ctx.gateway.remove_connection(&connection_id).await;
    ctx.metrics.connection_closed();
    if let Some(session_id) = bound_session {
        ctx.presence.remove_session(&session_id, ChangeReason::ConnectionClosed).await;
        ctx.metrics.session_removed();
    }
    if let Some(entity_id) = bound_entity {
        ctx.event_router.unregister_agent_route(&entity_id).await;
    }
    ctx.event_router.unsubscribe_all(&connection_id).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_to_unknown_connection_is_connection_closed() {
        let gateway = Gateway::default();
        let err = gateway.send("nope", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionClosed));
    }

    #[tokio::test]
    async fn register_then_bind_then_route() {
        let gateway = Gateway::default();
        let (connection_id, mut rx, _last_activity) = gateway.register_connection().await;
        gateway.bind_entity(&connection_id, "agent_001").await;
        gateway
            .route_to_entity("agent_001", serde_json::json!({"hello": "world"}))
            .await
            .unwrap();
        let received = rx.try_recv().unwrap();
        assert_eq!(received["hello"], "world");
    }

    #[tokio::test]
    async fn full_outbound_queue_is_slow_consumer() {
        let gateway = Gateway::default();
        let (connection_id, _rx, _last_activity) = gateway.register_connection().await;
        for _ in 0..OUTBOUND_QUEUE_DEPTH {
            gateway.send(&connection_id, serde_json::json!({})).await.unwrap();
        }
        let err = gateway.send(&connection_id, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::SlowConsumer));
    }

    #[tokio::test]
    async fn heartbeat_timeout_removes_connection() {
        let gateway = Arc::new(Gateway::default());
        let (connection_id, _rx, last_activity) = gateway.register_connection().await;
        last_activity.store(0, Ordering::Relaxed);
        gateway.heartbeat_tick(Duration::from_secs(60), Duration::from_secs(90)).await;
        assert_eq!(gateway.connection_count().await, 0);
        let _ = connection_id;
    }
}
