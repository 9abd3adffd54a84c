//! Method handlers (SPEC_FULL.md §4.2 Required core methods), one module per
//! method family. Each handler receives decoded params and a [`HandlerContext`]
//! carrying the connection id, the session id (if authenticated), and a
//! reference to [`crate::AppContext`] — the capability-reference pattern
//! SPEC_FULL.md §9 calls for to avoid Gateway holding a Protocol pointer.

pub mod agent;
pub mod auth;
pub mod channel;
pub mod core;
pub mod gateway_stats;
pub mod presence;
pub mod session;

use std::sync::Arc;

use crate::AppContext;

pub struct HandlerContext<'a> {
    pub ctx: &'a Arc<AppContext>,
    pub connection_id: &'a str,
    pub session_id: Option<String>,
}
