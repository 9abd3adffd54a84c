use serde_json::Value;

use crate::error::RpcError;

use super::HandlerContext;

/// `gateway.getStats()` → connection/session counters and uptime
/// (SPEC_FULL.md §10.5). Requires auth.
pub async fn get_stats(_params: Value, hctx: &HandlerContext<'_>) -> Result<Value, RpcError> {
    let snapshot = hctx.ctx.metrics.snapshot();
    Ok(serde_json::json!({
        "connections": snapshot.connections,
        "sessions": snapshot.sessions,
        "tasks-completed": snapshot.tasks_completed,
        "tasks-failed": snapshot.tasks_failed,
        "uptime-seconds": snapshot.uptime_seconds,
    }))
}
