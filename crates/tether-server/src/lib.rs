//! # tether-server
//!
//! Axum HTTP + `WebSocket` shell around the relay core.
//!
//! - `GET /ws`: authenticated upgrade, one reader/writer task pair per connection
//! - `GET /health`: liveness and counters
//! - `GET /api/live-location/active-sessions`: the caller's active shares
//! - `GET /metrics`: Prometheus exposition
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;
