use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::error::RpcError;
use crate::presence::{EntityType, PresenceStatus};

use super::HandlerContext;

#[derive(Deserialize)]
struct SendParams {
    #[serde(rename = "agent-id")]
    agent_id: String,
    message: Value,
}

/// `agent.send(agent-id, message)` → delivers an `agent.message` notification
/// to the connection currently routed for `agent-id` (SPEC_FULL.md §4.5).
/// Requires auth.
pub async fn send(params: Value, hctx: &HandlerContext<'_>) -> Result<Value, RpcError> {
    let params: SendParams = serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))?;

    let from = match hctx.session_id.as_deref() {
        Some(session_id) => hctx
            .ctx
            .presence
            .session_info(session_id)
            .await
            .map(|s| s.entity_id)
            .unwrap_or_else(|| "unknown".to_string()),
        None => "unknown".to_string(),
    };

    let connection_id = hctx
        .ctx
        .event_router
        .route_to_agent(&params.agent_id)
        .await
        .ok_or_else(|| RpcError::invalid_params("agent not routable"))?;

    let notification = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "agent.message",
        "params": {
            "from": from,
            "message": params.message,
            "timestamp": Utc::now().to_rfc3339(),
        }
    });
    hctx.ctx
        .gateway
        .send(&connection_id, notification)
        .await
        .map_err(|_| RpcError::invalid_params("agent connection closed"))?;

    Ok(serde_json::json!({ "success": true }))
}

/// `agent.list()` → presence dicts for every non-offline agent. No auth.
pub async fn list(_params: Value, hctx: &HandlerContext<'_>) -> Result<Value, RpcError> {
    let agents: Vec<_> = hctx
        .ctx
        .presence
        .list_by_type(Some(EntityType::Agent))
        .await
        .into_iter()
        .filter(|a| a.status != PresenceStatus::Offline)
        .collect();
    serde_json::to_value(agents).map_err(|_| RpcError::internal_error())
}
