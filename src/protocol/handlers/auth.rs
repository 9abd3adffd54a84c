use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::RpcError;
use crate::presence::{Capability, EntityType, PresenceStatus};

use super::HandlerContext;

#[derive(Deserialize)]
struct AuthenticateParams {
    token: String,
    #[serde(rename = "entity-id")]
    entity_id: Option<String>,
    #[serde(rename = "entity-type")]
    entity_type: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

/// `auth.authenticate(token, entity-id?, entity-type?, capabilities?, metadata?)`.
/// On success: creates a Session, binds it to the Connection, registers
/// Presence, and — if entity-type is agent — registers an agent route
/// (SPEC_FULL.md §4.2).
pub async fn authenticate(params: Value, hctx: &HandlerContext<'_>) -> Result<Value, RpcError> {
    let params: AuthenticateParams =
        serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))?;

    let token_info = hctx
        .ctx
        .auth
        .validate(&params.token)
        .await
        .ok_or_else(RpcError::authentication_error)?;

    let entity_id = params.entity_id.unwrap_or_else(|| token_info.entity_id.clone());
    let entity_type = match params.entity_type.as_deref() {
        Some(s) => s.parse::<EntityType>().map_err(|_| RpcError::invalid_params("invalid entity-type"))?,
        None => token_info.entity_type,
    };
    let capabilities = params
        .capabilities
        .into_iter()
        .map(|name| Capability { name, priority: 0 })
        .collect();

    hctx.ctx
        .presence
        .register(&entity_id, entity_type, PresenceStatus::Online, capabilities, params.metadata)
        .await;
    let session_id = hctx
        .ctx
        .presence
        .create_session(&entity_id, entity_type, hctx.connection_id)
        .await;
    hctx.ctx
        .presence
        .authenticate_session(&session_id, token_info.permissions.iter().cloned().collect())
        .await;

    hctx.ctx.gateway.bind_entity(hctx.connection_id, &entity_id).await;
    if entity_type == EntityType::Agent {
        hctx.ctx.event_router.register_agent_route(&entity_id, hctx.connection_id).await;
    }
    hctx.ctx.metrics.session_created();

    Ok(serde_json::json!({
        "success": true,
        "session-id": session_id,
        "entity-id": entity_id,
        "entity-type": entity_type.to_string(),
    }))
}

#[derive(Deserialize)]
struct GenerateTokenParams {
    #[serde(rename = "entity-id")]
    entity_id: String,
    #[serde(rename = "entity-type")]
    entity_type: String,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(rename = "expires-in-hours")]
    expires_in_hours: i64,
}

/// `auth.generateToken(entity-id, entity-type, permissions, expires-in-hours)`.
/// Requires auth and the `token.issue` permission (the method table in
/// `protocol::method_spec` enforces this before the handler runs).
pub async fn generate_token(params: Value, hctx: &HandlerContext<'_>) -> Result<Value, RpcError> {
    let params: GenerateTokenParams =
        serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))?;
    let entity_type = params
        .entity_type
        .parse::<EntityType>()
        .map_err(|_| RpcError::invalid_params("invalid entity-type"))?;
    let expires_in_hours = params.expires_in_hours;
    let token = hctx
        .ctx
        .auth
        .generate_token(params.entity_id, entity_type, params.permissions, expires_in_hours)
        .await;
    Ok(serde_json::json!({ "token": token, "expires-in-hours": expires_in_hours }))
}
