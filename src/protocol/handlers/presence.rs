use serde::Deserialize;
use serde_json::Value;

use crate::error::RpcError;
use crate::presence::{EntityType, PresenceStatus};

use super::HandlerContext;

#[derive(Deserialize)]
struct UpdateParams {
    status: String,
    #[serde(rename = "status-message")]
    status_message: Option<String>,
    activity: Option<String>,
}

/// `presence.update(status, status-message?, activity?)` → {success}.
/// Requires auth; updates the caller's own presence entry.
pub async fn update(params: Value, hctx: &HandlerContext<'_>) -> Result<Value, RpcError> {
    let params: UpdateParams = serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))?;
    let status = params
        .status
        .parse::<PresenceStatus>()
        .map_err(|_| RpcError::invalid_params("invalid status"))?;
    let session_id = hctx.session_id.as_deref().ok_or_else(RpcError::authentication_error)?;
    let entity_id = hctx
        .ctx
        .presence
        .session_info(session_id)
        .await
        .ok_or_else(RpcError::authentication_error)?
        .entity_id;
    hctx.ctx.presence.update(&entity_id, status, params.status_message, params.activity).await;
    Ok(serde_json::json!({ "success": true }))
}

#[derive(Deserialize, Default)]
struct GetParams {
    #[serde(rename = "entity-id")]
    entity_id: Option<String>,
    #[serde(rename = "entity-type")]
    entity_type: Option<String>,
}

/// `presence.get(entity-id?|entity-type?)` → one or many presence dicts. No auth.
pub async fn get(params: Value, hctx: &HandlerContext<'_>) -> Result<Value, RpcError> {
    let params: GetParams = if params.is_null() {
        GetParams::default()
    } else {
        serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))?
    };

    if let Some(entity_id) = params.entity_id {
        let info = hctx.ctx.presence.get(&entity_id).await;
        return Ok(serde_json::to_value(info).unwrap_or(Value::Null));
    }

    let entity_type = match params.entity_type {
        Some(t) => Some(t.parse::<EntityType>().map_err(|_| RpcError::invalid_params("invalid entity-type"))?),
        None => None,
    };
    let list = hctx.ctx.presence.list_by_type(entity_type).await;
    Ok(serde_json::to_value(list).unwrap_or_else(|_| Value::Array(vec![])))
}
