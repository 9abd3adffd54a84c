use serde::Serialize;

/// JSON-RPC 2.0 error codes. Values are part of the wire contract — never renumber.
pub mod code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const AUTHENTICATION_ERROR: i64 = -32001;
    pub const PERMISSION_DENIED: i64 = -32002;
    pub const RATE_LIMITED: i64 = -32003;
}

/// Uniform error envelope returned to clients. Never carries stack traces or
/// internal detail in `data` — see the internal_error variant.
#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(code::PARSE_ERROR, "parse error")
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new(code::INVALID_REQUEST, msg)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(code::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::new(code::INVALID_PARAMS, msg)
    }

    pub fn internal_error() -> Self {
        Self::new(code::INTERNAL_ERROR, "internal error")
    }

    pub fn authentication_error() -> Self {
        Self::new(code::AUTHENTICATION_ERROR, "authentication required")
    }

    pub fn permission_denied(permission: &str) -> Self {
        Self::new(
            code::PERMISSION_DENIED,
            format!("missing permission: {permission}"),
        )
    }

    pub fn rate_limited() -> Self {
        Self::new(code::RATE_LIMITED, "rate limit exceeded")
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

/// Errors from the Raft engine. `NotLeader` is not a bug: callers are expected
/// to retry against the hinted leader.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("not leader (current leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<String> },
    #[error("proposal did not commit within the retry window")]
    CommitTimeout,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("corrupt log entry at index {index}: {reason}")]
    CorruptLog { index: u32, reason: String },
}

/// Errors from the key/value contract backing Raft persistent state.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Encoding(String),
}

/// Errors from work distribution.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("agent not registered: {0}")]
    AgentNotRegistered(String),
    #[error("task {0} exceeded max attempts")]
    MaxAttemptsExceeded(String),
}

/// Gateway-level transport errors. These tear down the connection; they never
/// surface as a JSON-RPC error response because the socket is already gone.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("outbound queue full (slow consumer)")]
    SlowConsumer,
    #[error("frame exceeds maximum size")]
    FrameTooLarge,
}
