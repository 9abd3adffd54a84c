use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::error::RpcError;

use super::HandlerContext;

#[derive(Deserialize)]
struct ChannelParams {
    channel: String,
}

/// `channel.subscribe(channel)`. Requires auth.
pub async fn subscribe(params: Value, hctx: &HandlerContext<'_>) -> Result<Value, RpcError> {
    let params: ChannelParams = serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))?;
    hctx.ctx.event_router.subscribe(&params.channel, hctx.connection_id).await;
    if let Some(session_id) = hctx.session_id.as_deref() {
        hctx.ctx.presence.add_session_subscription(session_id, &params.channel).await;
    }
    Ok(serde_json::json!({ "success": true }))
}

/// `channel.unsubscribe(channel)`. Requires auth.
pub async fn unsubscribe(params: Value, hctx: &HandlerContext<'_>) -> Result<Value, RpcError> {
    let params: ChannelParams = serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))?;
    hctx.ctx.event_router.unsubscribe(&params.channel, hctx.connection_id).await;
    if let Some(session_id) = hctx.session_id.as_deref() {
        hctx.ctx.presence.remove_session_subscription(session_id, &params.channel).await;
    }
    Ok(serde_json::json!({ "success": true }))
}

#[derive(Deserialize)]
struct PublishParams {
    channel: String,
    message: Value,
}

/// `channel.publish(channel, message)`. Requires auth; delivers an `event`-
/// shaped notification (method `channel.message`) to each subscriber present
/// at dispatch start, excluding the publisher (SPEC_FULL.md §4.2, §10.8).
pub async fn publish(params: Value, hctx: &HandlerContext<'_>) -> Result<Value, RpcError> {
    let params: PublishParams = serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))?;
    let subscribers = hctx.ctx.event_router.channel_subscribers(&params.channel).await;
    let notification = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "channel.message",
        "params": {
            "type": "channel",
            "channel": params.channel,
            "data": params.message,
            "source": hctx.connection_id,
            "timestamp": Utc::now().to_rfc3339(),
        }
    });
    for connection_id in subscribers {
        if connection_id == hctx.connection_id {
            continue;
        }
        let _ = hctx.ctx.gateway.send(&connection_id, notification.clone()).await;
    }
    Ok(serde_json::json!({ "success": true }))
}
