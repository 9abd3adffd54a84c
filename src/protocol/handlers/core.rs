use serde_json::Value;

use crate::error::RpcError;

use super::HandlerContext;

/// `rpc.ping` → `"pong"`; no auth.
pub async fn ping(_params: Value, _hctx: &HandlerContext<'_>) -> Result<Value, RpcError> {
    Ok(Value::String("pong".to_string()))
}
