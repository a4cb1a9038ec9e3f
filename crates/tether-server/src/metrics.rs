//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the global Prometheus recorder.
///
/// Call once at startup before anything records. The handle renders
/// `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle backed by a recorder that is not installed globally (tests).
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric names shared across crates.

/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Upgrades refused (counter, labels: reason).
pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Inbound client events (counter, labels: event).
pub const RELAY_EVENTS_RECEIVED_TOTAL: &str = "relay_events_received_total";
/// Error replies sent (counter, labels: code).
pub const RELAY_ERRORS_TOTAL: &str = "relay_errors_total";
/// Active sessions (gauge).
pub const RELAY_SESSIONS_ACTIVE: &str = "relay_sessions_active";
/// Sessions started (counter).
pub const RELAY_SESSIONS_STARTED_TOTAL: &str = "relay_sessions_started_total";
/// Sessions ended (counter, labels: reason).
pub const RELAY_SESSIONS_ENDED_TOTAL: &str = "relay_sessions_ended_total";
/// Location updates relayed (counter).
pub const RELAY_LOCATION_UPDATES_TOTAL: &str = "relay_location_updates_total";
/// Events delivered to live connections (counter, labels: event).
pub const RELAY_EVENTS_ROUTED_TOTAL: &str = "relay_events_routed_total";
/// Fallback pushes attempted (counter, labels: event).
pub const RELAY_FALLBACK_PUSHES_TOTAL: &str = "relay_fallback_pushes_total";
/// Fallback pushes failed or timed out (counter, labels: event).
pub const RELAY_FALLBACK_FAILURES_TOTAL: &str = "relay_fallback_failures_total";
/// Frames dropped on full outbound queues (counter).
pub const RELAY_DELIVERY_DROPS_TOTAL: &str = "relay_delivery_drops_total";
