use serde_json::Value;

use crate::error::RpcError;

use super::HandlerContext;

/// `session.getInfo()` → session dict. Requires auth.
pub async fn get_info(_params: Value, hctx: &HandlerContext<'_>) -> Result<Value, RpcError> {
    let session_id = hctx.session_id.as_deref().ok_or_else(RpcError::authentication_error)?;
    let info = hctx
        .ctx
        .presence
        .session_info(session_id)
        .await
        .ok_or_else(RpcError::authentication_error)?;
    serde_json::to_value(info).map_err(|_| RpcError::internal_error())
}
