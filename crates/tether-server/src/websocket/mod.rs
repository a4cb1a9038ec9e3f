//! WebSocket transport: per-connection loop and frame dispatch.

pub mod handler;
pub mod session;
