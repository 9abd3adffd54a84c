//! JSON-RPC 2.0 dispatcher (SPEC_FULL.md §4.2): strict request/response/
//! notification/batch handling over a string-keyed method registry.
//!
//! Grounded in the teacher's `ipc::dispatch_text`/`dispatch` pair — parse,
//! re-check auth, match on method name, wrap the result. This crate's method
//! table additionally carries an auth-required flag and a permission name per
//! method (SPEC_FULL.md §4.2 Method registry), since unlike the teacher's
//! single shared bearer token this protocol has per-session permission sets.

pub mod handlers;

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::RpcError;
use crate::AppContext;

use handlers::HandlerContext;

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

struct MethodSpec {
    auth_required: bool,
    permission: Option<&'static str>,
}

fn method_spec(method: &str) -> Option<MethodSpec> {
    Some(match method {
        "rpc.ping" => MethodSpec { auth_required: false, permission: None },
        "auth.authenticate" => MethodSpec { auth_required: false, permission: None },
        "auth.generateToken" => MethodSpec { auth_required: true, permission: Some("token.issue") },
        "session.getInfo" => MethodSpec { auth_required: true, permission: None },
        "presence.update" => MethodSpec { auth_required: true, permission: None },
        "presence.get" => MethodSpec { auth_required: false, permission: None },
        "channel.subscribe" => MethodSpec { auth_required: true, permission: None },
        "channel.unsubscribe" => MethodSpec { auth_required: true, permission: None },
        "channel.publish" => MethodSpec { auth_required: true, permission: None },
        "agent.send" => MethodSpec { auth_required: true, permission: None },
        "agent.list" => MethodSpec { auth_required: false, permission: None },
        "gateway.getStats" => MethodSpec { auth_required: true, permission: None },
        _ => return None,
    })
}

/// Dispatches one raw text frame, which may be a single request/notification
/// or a JSON-RPC batch array. Returns `None` when nothing needs to be sent
/// back (a lone notification, or a batch made entirely of notifications).
pub async fn dispatch_text(
    text: &str,
    ctx: &Arc<AppContext>,
    connection_id: &str,
    bound_entity: &mut Option<String>,
    bound_session: &mut Option<String>,
) -> Option<String> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Some(error_string(Value::Null, RpcError::parse_error())),
    };

    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Some(error_string(Value::Null, RpcError::invalid_request("empty batch")));
            }
            let mut responses = Vec::new();
            for item in items {
                if let Some(resp) = dispatch_one(item, ctx, connection_id, bound_entity, bound_session).await {
                    responses.push(resp);
                }
            }
            if responses.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&responses).unwrap_or_default())
            }
        }
        other => dispatch_one(other, ctx, connection_id, bound_entity, bound_session)
            .await
            .map(|v| serde_json::to_string(&v).unwrap_or_default()),
    }
}

async fn dispatch_one(
    item: Value,
    ctx: &Arc<AppContext>,
    connection_id: &str,
    bound_entity: &mut Option<String>,
    bound_session: &mut Option<String>,
) -> Option<Value> {
    let req: RpcRequest = match serde_json::from_value(item) {
        Ok(r) => r,
        Err(e) => return Some(error_value(Value::Null, RpcError::invalid_request(e.to_string()))),
    };
    if req.jsonrpc != "2.0" {
        return Some(error_value(
            req.id.unwrap_or(Value::Null),
            RpcError::invalid_request("jsonrpc must be \"2.0\""),
        ));
    }

    let is_notification = req.id.is_none();
    let id = req.id.clone().unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);

    let result = handle_method(&req.method, params, ctx, connection_id, bound_entity, bound_session).await;

    if is_notification {
        return None;
    }
    Some(match result {
        Ok(value) => serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": value }),
        Err(e) => error_value(id, e),
    })
}

async fn handle_method(
    method: &str,
    params: Value,
    ctx: &Arc<AppContext>,
    connection_id: &str,
    bound_entity: &mut Option<String>,
    bound_session: &mut Option<String>,
) -> Result<Value, RpcError> {
    let spec = method_spec(method).ok_or_else(|| RpcError::method_not_found(method))?;

    let permissions: Vec<String> = match bound_session.as_deref() {
        Some(session_id) => ctx.presence.session_permissions(session_id).await,
        None => Vec::new(),
    };
    let authenticated = bound_session.is_some();

    if spec.auth_required && !authenticated {
        return Err(RpcError::authentication_error());
    }
    if let Some(permission) = spec.permission {
        let granted = permissions.iter().any(|p| p == "*" || p == permission);
        if !granted {
            return Err(RpcError::permission_denied(permission));
        }
    }
    if let Some(session_id) = bound_session.as_deref() {
        ctx.presence.touch_session(session_id).await;
    }

    let hctx = HandlerContext {
        ctx,
        connection_id,
        session_id: bound_session.clone(),
    };

    match method {
        "rpc.ping" => handlers::core::ping(params, &hctx).await,
        "auth.authenticate" => {
            let outcome = handlers::auth::authenticate(params, &hctx).await?;
            if let Some(session_id) = outcome.get("session-id").and_then(Value::as_str) {
                *bound_session = Some(session_id.to_string());
            }
            if let Some(entity_id) = outcome.get("entity-id").and_then(Value::as_str) {
                *bound_entity = Some(entity_id.to_string());
            }
            Ok(outcome)
        }
        "auth.generateToken" => handlers::auth::generate_token(params, &hctx).await,
        "session.getInfo" => handlers::session::get_info(params, &hctx).await,
        "presence.update" => handlers::presence::update(params, &hctx).await,
        "presence.get" => handlers::presence::get(params, &hctx).await,
        "channel.subscribe" => handlers::channel::subscribe(params, &hctx).await,
        "channel.unsubscribe" => handlers::channel::unsubscribe(params, &hctx).await,
        "channel.publish" => handlers::channel::publish(params, &hctx).await,
        "agent.send" => handlers::agent::send(params, &hctx).await,
        "agent.list" => handlers::agent::list(params, &hctx).await,
        "gateway.getStats" => handlers::gateway_stats::get_stats(params, &hctx).await,
        _ => Err(RpcError::method_not_found(method)),
    }
}

fn error_value(id: Value, e: RpcError) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": e })
}

fn error_string(id: Value, e: RpcError) -> String {
    serde_json::to_string(&error_value(id, e)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_context;

    #[tokio::test]
    async fn ping_requires_no_auth_and_responds_pong() {
        let ctx = test_context().await;
        let mut entity = None;
        let mut session = None;
        let text = r#"{"jsonrpc":"2.0","method":"rpc.ping","id":1}"#;
        let resp = dispatch_text(text, &ctx, "conn-1", &mut entity, &mut session).await.unwrap();
        let value: Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(value["result"], "pong");
    }

    #[tokio::test]
    async fn unauthenticated_call_to_protected_method_is_authentication_error() {
        let ctx = test_context().await;
        let mut entity = None;
        let mut session = None;
        let text = r#"{"jsonrpc":"2.0","method":"gateway.getStats","id":3}"#;
        let resp = dispatch_text(text, &ctx, "conn-1", &mut entity, &mut session).await.unwrap();
        let value: Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(value["error"]["code"], -32001);
    }

    #[tokio::test]
    async fn notification_produces_no_response() {
        let ctx = test_context().await;
        let mut entity = None;
        let mut session = None;
        let text = r#"{"jsonrpc":"2.0","method":"rpc.ping"}"#;
        let resp = dispatch_text(text, &ctx, "conn-1", &mut entity, &mut session).await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn authenticate_then_ping_scenario_a() {
        let ctx = test_context().await;
        ctx.auth
            .seed_token("T1", "agent_001", crate::presence::EntityType::Agent, vec!["*".to_string()], 1)
            .await;
        let mut entity = None;
        let mut session = None;
        let auth_text = r#"{"jsonrpc":"2.0","method":"auth.authenticate","params":{"token":"T1","entity-id":"agent_001","entity-type":"agent"},"id":1}"#;
        let resp = dispatch_text(auth_text, &ctx, "conn-1", &mut entity, &mut session).await.unwrap();
        let value: Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(value["result"]["success"], true);
        assert_eq!(value["result"]["entity-id"], "agent_001");
        assert_eq!(value["result"]["entity-type"], "agent");
        assert!(session.is_some());

        let ping_text = r#"{"jsonrpc":"2.0","method":"rpc.ping","id":2}"#;
        let resp2 = dispatch_text(ping_text, &ctx, "conn-1", &mut entity, &mut session).await.unwrap();
        let value2: Value = serde_json::from_str(&resp2).unwrap();
        assert_eq!(value2["result"], "pong");
        assert_eq!(value2["id"], 2);
    }

    #[tokio::test]
    async fn batch_of_non_notifications_has_matching_length() {
        let ctx = test_context().await;
        let mut entity = None;
        let mut session = None;
        let text = r#"[{"jsonrpc":"2.0","method":"rpc.ping","id":1},{"jsonrpc":"2.0","method":"rpc.ping","id":2}]"#;
        let resp = dispatch_text(text, &ctx, "conn-1", &mut entity, &mut session).await.unwrap();
        let value: Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn batch_of_only_notifications_yields_no_response() {
        let ctx = test_context().await;
        let mut entity = None;
        let mut session = None;
        let text = r#"[{"jsonrpc":"2.0","method":"rpc.ping"}]"#;
        let resp = dispatch_text(text, &ctx, "conn-1", &mut entity, &mut session).await;
        assert!(resp.is_none());
    }

    /// Scenario C — channel fan-out: two real gateway connections authenticate
    /// and subscribe to "news"; C1 publishes and only C2 receives the
    /// `channel.message` notification.
    #[tokio::test]
    async fn scenario_c_channel_fan_out_excludes_publisher() {
        let ctx = test_context().await;
        ctx.auth
            .seed_token("T1", "agent_001", crate::presence::EntityType::Agent, vec!["*".to_string()], 1)
            .await;
        ctx.auth
            .seed_token("T2", "agent_002", crate::presence::EntityType::Agent, vec!["*".to_string()], 1)
            .await;

        let (conn1, mut rx1, _la1) = ctx.gateway.register_connection().await;
        let (conn2, mut rx2, _la2) = ctx.gateway.register_connection().await;

        let mut e1 = None;
        let mut s1 = None;
        let auth1 = r#"{"jsonrpc":"2.0","method":"auth.authenticate","params":{"token":"T1","entity-id":"agent_001","entity-type":"agent"},"id":1}"#;
        dispatch_text(auth1, &ctx, &conn1, &mut e1, &mut s1).await;

        let mut e2 = None;
        let mut s2 = None;
        let auth2 = r#"{"jsonrpc":"2.0","method":"auth.authenticate","params":{"token":"T2","entity-id":"agent_002","entity-type":"agent"},"id":1}"#;
        dispatch_text(auth2, &ctx, &conn2, &mut e2, &mut s2).await;

        let sub = r#"{"jsonrpc":"2.0","method":"channel.subscribe","params":{"channel":"news"},"id":2}"#;
        dispatch_text(sub, &ctx, &conn1, &mut e1, &mut s1).await;
        dispatch_text(sub, &ctx, &conn2, &mut e2, &mut s2).await;

        let publish = r#"{"jsonrpc":"2.0","method":"channel.publish","params":{"channel":"news","message":{"body":"hello"}},"id":3}"#;
        let resp = dispatch_text(publish, &ctx, &conn1, &mut e1, &mut s1).await.unwrap();
        let value: Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(value["result"]["success"], true);

        // C1 (the publisher) receives nothing.
        assert!(rx1.try_recv().is_err());

        // C2 receives exactly one channel.message carrying the published body.
        let received = rx2.try_recv().unwrap();
        assert_eq!(received["method"], "channel.message");
        assert_eq!(received["params"]["data"]["body"], "hello");
        assert!(rx2.try_recv().is_err());
    }
}
